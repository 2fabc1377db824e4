//! Filesystem abstraction contract
//!
//! [`FilesystemAccess`] is the seam between the comparator/codec and the two
//! concrete backends: the database-backed tree ([`crate::store`]) and the
//! repository-clone-backed tree ([`crate::workdir`]). Both present the same
//! canonical-path surface, so everything above this trait is backend-agnostic.
//!
//! The module also owns the physical-name conventions shared by both backends:
//! the `prefix.kind.format` datastore naming scheme and the artificial
//! directory names that exist in archives and working trees but never in
//! canonical paths.

use crate::error::Result;
use crate::tree::FilesystemTree;
use crate::types::{DataFormat, DatastoreKind, FilesystemKind};

/// Directory names inserted by the bucketed export layout
///
/// These directories group resources by type on disk. They are traversed but
/// elided from canonical paths, so both export layouts compare as identical
/// trees.
pub const ARTIFICIAL_DIRECTORIES: &[&str] =
    &["semantic-models", "visual-models", "application-profiles"];

/// Whether a path segment is one of the artificial bucket directories
pub fn is_artificial_directory(segment: &str) -> bool {
    ARTIFICIAL_DIRECTORIES.contains(&segment)
}

/// Remove artificial bucket segments from a canonical path
pub fn strip_artificial_segments(path: &str) -> String {
    let trailing = path.ends_with('/') && path.len() > 1;
    let mut out = String::from("/");
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if is_artificial_directory(segment) {
            continue;
        }
        out.push_str(segment);
        out.push('/');
    }
    if !trailing && out.len() > 1 {
        out.pop();
    }
    out
}

/// Join a child segment onto a directory's canonical path
///
/// Directory canonical paths end with `/`, so joining is concatenation; pass
/// `is_directory` to get the child's own trailing separator right.
pub fn join_canonical(parent: &str, segment: &str, is_directory: bool) -> String {
    let mut path = format!("{}{}", parent, segment);
    if is_directory {
        path.push('/');
    }
    path
}

/// Split a physical file name into `(prefix, kind, format)`
///
/// The name is split from the right so prefixes containing dots (IRIs with
/// version segments, hex hashes) survive intact. Names with fewer than two
/// separators do not follow the scheme and are classified [`DatastoreKind::Foreign`],
/// with the whole name as prefix and the extension (if any) as format.
pub fn split_datastore_name(file_name: &str) -> (String, DatastoreKind, DataFormat) {
    let parts: Vec<&str> = file_name.rsplitn(3, '.').collect();
    if parts.len() == 3 {
        // rsplitn yields segments right-to-left
        let (format, kind, prefix) = (parts[0], parts[1], parts[2]);
        if !format.is_empty() && !kind.is_empty() {
            return (
                prefix.to_string(),
                DatastoreKind::parse(kind),
                DataFormat::parse(format),
            );
        }
    }
    let format = file_name
        .rsplit_once('.')
        .map(|(_, ext)| DataFormat::parse(ext))
        .unwrap_or_else(|| DataFormat::Other(String::new()));
    (file_name.to_string(), DatastoreKind::Foreign, format)
}

/// Uniform read/write surface over a materialized tree
///
/// Implementations materialize their backend into a [`FilesystemTree`] once at
/// construction time; reads and writes then address nodes by canonical path and
/// datastores by kind. Content-level writes go straight through to the backend
/// (the in-memory tree tracks structure, not payloads).
pub trait FilesystemAccess {
    /// Which backend this filesystem is materialized from
    fn kind(&self) -> FilesystemKind;

    /// The materialized tree
    fn tree(&self) -> &FilesystemTree;

    /// Read the content of one datastore
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SyncError::DatastoreNotFound`] when the node has
    /// no datastore of the requested kind, or a backend I/O error.
    ///
    /// # Panics
    ///
    /// Panics when `canonical_path` is not present in the tree; addressing a
    /// path the materialization never produced is a programming error.
    fn datastore_content(&self, canonical_path: &str, kind: &DatastoreKind) -> Result<Vec<u8>>;

    /// Create a datastore on an existing node
    fn create_datastore(
        &mut self,
        canonical_path: &str,
        kind: &DatastoreKind,
        format: &DataFormat,
        content: &[u8],
    ) -> Result<()>;

    /// Replace the content of an existing datastore
    fn update_datastore(
        &mut self,
        canonical_path: &str,
        kind: &DatastoreKind,
        content: &[u8],
    ) -> Result<()>;

    /// Remove one datastore from a node
    fn remove_datastore(&mut self, canonical_path: &str, kind: &DatastoreKind) -> Result<()>;

    /// Remove a node and all of its datastores (recursively for directories)
    fn remove_file(&mut self, canonical_path: &str) -> Result<()>;

    /// Whether the node at this canonical path is a directory
    fn is_directory(&self, canonical_path: &str) -> bool;

    /// Canonical paths of a directory's direct children, sorted
    fn list_children(&self, canonical_path: &str) -> Vec<String>;
}
