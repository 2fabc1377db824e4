//! # Treesync - Filesystem synchronization and merge engine
//!
//! A synchronization engine for hierarchical, versioned package/resource
//! trees. Resources are composed of named sub-contents ("datastores": meta,
//! model, visual, …); two structurally different backends — a database-backed
//! resource hierarchy and a cloned git working tree — are presented behind one
//! abstraction, diffed at datastore granularity, and reconciled through
//! persistent merge states that survive repeated comparisons.
//!
//! ## Overview
//!
//! Treesync lets an application with a relational resource model treat a git
//! branch as a second materialization of the same tree:
//! - Materialize either backend into one canonical tree model
//! - Compare two trees down to individual datastores, ignoring
//!   formatting-only JSON differences
//! - Keep unresolved conflicts alive across refreshes while the user edits one
//!   side, dropping only differences the user already accepted
//! - Drive commit, push, pull, and branch merges against a real repository,
//!   with ordered credential retry
//! - Import and export whole trees as zip archives in two path layouts
//!
//! ## Architecture
//!
//! - **Canonical paths**: every node is addressed the same way regardless of
//!   backend; the root is `/`, directory paths end with `/`, artificial
//!   bucket directories are elided
//! - **[`FilesystemAccess`]**: the seam both backends implement —
//!   [`DatabaseFilesystem`] over a [`ResourceStore`], [`WorkdirFilesystem`]
//!   over a checked-out clone
//! - **[`comparator`]**: the structural diff, hashing content with SHA-256 so
//!   later refreshes can tell whether a side moved without re-reading it
//! - **[`MergeStateManager`]**: conflict survival and finalization; the
//!   active-state counters on endpoint roots persist through the store
//! - **[`SyncOrchestrator`]**: one template for all four git workflows —
//!   clone, compare, route through merge states, write back, push
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use treesync::{
//!     Credential, MemoryResourceStore, NodeMetadata, ResourceStore, StaticProvider,
//!     SyncOrchestrator, SyncOutcome, SyncRequest,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> treesync::Result<()> {
//! let store = Arc::new(MemoryResourceStore::new());
//! store.create_package(None, NodeMetadata::new("urn:example:root"))?;
//!
//! let orchestrator = SyncOrchestrator::new(store, Arc::new(StaticProvider::new()));
//! let request = SyncRequest::new(
//!     "urn:example:root",
//!     "https://example.com/org/models.git",
//!     "main",
//! )
//! .with_credentials(vec![Credential::new("ci", "t0ken")])
//! .with_commit_message("Publish model updates");
//!
//! match orchestrator.push(&request)? {
//!     SyncOutcome::Completed { commit_hash } => println!("pushed {commit_hash}"),
//!     SyncOutcome::Conflict(info) => println!("resolve {} first", info.merge_state_id),
//!     SyncOutcome::PendingMergeState(uuid) => println!("open merge state {uuid}"),
//! }
//! # Ok(())
//! # }
//! ```

// Public API modules
pub mod archive;
pub mod comparator;
pub mod error;
pub mod filesystem;
pub mod merge_state;
pub mod provider;
pub mod store;
pub mod sync;
pub mod tree;
pub mod types;
pub mod workdir;

pub use archive::{export_dir, export_zip, import_zip, ImportOptions};
pub use comparator::compare;
pub use error::{Result, SyncError};
pub use filesystem::FilesystemAccess;
pub use merge_state::{MergeState, MergeStateManager};
pub use provider::{HostingProvider, StaticProvider};
pub use store::{DatabaseFilesystem, MemoryResourceStore, ResourceRecord, ResourceStore};
pub use sync::{apply_diff, SyncOrchestrator, SyncRequest};
pub use tree::{FilesystemNode, FilesystemTree, NodeId, NodeKind};
pub use types::*;
pub use workdir::WorkdirFilesystem;
