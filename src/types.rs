//! Core data types used throughout the treesync library
//!
//! This module contains the fundamental data structures shared across
//! components:
//!
//! - **Datastores**: [`DatastoreKind`], [`DataFormat`], [`DatastoreInfo`] — the
//!   named sub-contents a resource is composed of
//! - **Metadata**: [`NodeMetadata`] — identity and descriptive fields of a node
//! - **Diffing**: [`DiffEntry`], [`DiffKey`], [`DiffTree`], [`ComparisonResult`]
//! - **Merging**: [`MergeCause`], [`MergeEndpoint`], [`EditableSide`]
//! - **Orchestration**: [`Credential`], [`SyncOutcome`], [`ExportVersion`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role tag of one datastore within a resource
///
/// `Meta` is distinguished because it carries the resource's identity and
/// metadata rather than payload. `Foreign` marks a physical file that does not
/// follow the `prefix.kind.format` naming scheme — typically a file added
/// manually on the version-control side. Foreign files are surfaced, never
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum DatastoreKind {
    /// Identity and metadata record of the resource
    Meta,
    /// Primary model payload
    Model,
    /// Visual layout payload
    Visual,
    /// Any other named sub-content
    Other(String),
    /// File outside the datastore naming scheme
    Foreign,
}

impl DatastoreKind {
    /// Canonical string tag of this kind (empty for foreign files)
    pub fn as_str(&self) -> &str {
        match self {
            DatastoreKind::Meta => "meta",
            DatastoreKind::Model => "model",
            DatastoreKind::Visual => "visual",
            DatastoreKind::Other(s) => s.as_str(),
            DatastoreKind::Foreign => "",
        }
    }

    /// Parse a string tag into a kind
    pub fn parse(tag: &str) -> Self {
        match tag {
            "meta" => DatastoreKind::Meta,
            "model" => DatastoreKind::Model,
            "visual" => DatastoreKind::Visual,
            "" => DatastoreKind::Foreign,
            other => DatastoreKind::Other(other.to_string()),
        }
    }
}

impl From<DatastoreKind> for String {
    fn from(kind: DatastoreKind) -> Self {
        kind.as_str().to_string()
    }
}

impl From<String> for DatastoreKind {
    fn from(tag: String) -> Self {
        DatastoreKind::parse(&tag)
    }
}

impl std::fmt::Display for DatastoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if matches!(self, DatastoreKind::Foreign) {
            write!(f, "foreign")
        } else {
            write!(f, "{}", self.as_str())
        }
    }
}

/// Serialization format of a datastore's content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum DataFormat {
    /// JSON payload (the only format produced by the database side today)
    Json,
    /// Any other format, identified by its extension
    Other(String),
}

impl DataFormat {
    /// File extension of this format
    pub fn as_str(&self) -> &str {
        match self {
            DataFormat::Json => "json",
            DataFormat::Other(s) => s.as_str(),
        }
    }

    /// Parse a file extension into a format
    pub fn parse(ext: &str) -> Self {
        match ext {
            "json" => DataFormat::Json,
            other => DataFormat::Other(other.to_string()),
        }
    }
}

impl From<DataFormat> for String {
    fn from(format: DataFormat) -> Self {
        format.as_str().to_string()
    }
}

impl From<String> for DataFormat {
    fn from(ext: String) -> Self {
        DataFormat::parse(&ext)
    }
}

/// One named sub-content of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreInfo {
    /// Role tag
    pub kind: DatastoreKind,
    /// Content format
    pub format: DataFormat,
    /// Physical or archive location of the content
    pub full_name: String,
}

impl DatastoreInfo {
    /// Create a datastore descriptor, deriving the physical name from a prefix
    pub fn new(kind: DatastoreKind, format: DataFormat, prefix: &str) -> Self {
        let full_name = match kind {
            DatastoreKind::Foreign => prefix.to_string(),
            _ => format!("{}.{}.{}", prefix, kind.as_str(), format.as_str()),
        };
        Self { kind, format, full_name }
    }

    /// Suffix appended to a canonical prefix to reconstruct the file name
    ///
    /// Foreign files have no derivable suffix; their full name stands alone.
    pub fn suffix(&self) -> String {
        match self.kind {
            DatastoreKind::Foreign => String::new(),
            _ => format!(".{}.{}", self.kind.as_str(), self.format.as_str()),
        }
    }

    /// Physical file name for a given canonical prefix
    pub fn file_name(&self, prefix: &str) -> String {
        match self.kind {
            DatastoreKind::Foreign => self.full_name.clone(),
            _ => format!("{}{}", prefix, self.suffix()),
        }
    }
}

/// Identity and descriptive metadata of a filesystem node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Resource IRI
    pub iri: String,
    /// Resource type tags
    #[serde(default)]
    pub type_tags: Vec<String>,
    /// User-facing label
    pub label: Option<String>,
    /// User-facing description
    pub description: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,
}

impl NodeMetadata {
    /// Create metadata for a freshly materialized node
    pub fn new(iri: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            iri: iri.into(),
            type_tags: Vec::new(),
            label: None,
            description: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Set the type tags
    pub fn with_type_tags(mut self, tags: Vec<String>) -> Self {
        self.type_tags = tags;
        self
    }

    /// Set the label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Kind of change recorded for one datastore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Present on `mergeFrom`, absent on `mergeTo`
    Created,
    /// Absent on `mergeFrom`, present on `mergeTo`
    Removed,
    /// Present on both sides with differing content
    Changed,
}

/// Identity of a diff entry across repeated comparisons
///
/// Two comparisons of the same endpoints address the same logical difference
/// by `(canonical path, datastore kind)`, which is how conflict survival is
/// tracked across merge-state refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiffKey {
    /// Canonical path of the affected node
    pub canonical_path: String,
    /// Kind of the affected datastore
    pub kind: DatastoreKind,
}

/// One datastore-granularity difference between two trees
///
/// The `old` side is always `mergeTo`, the `new` side always `mergeFrom`:
/// `old_hash == None` means the datastore was created on `mergeFrom`,
/// `new_hash == None` means it was removed there. Content hashes are recorded
/// so a later refresh can tell whether a side has moved without re-reading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Canonical path of the affected node
    pub canonical_path: String,
    /// The affected datastore
    pub datastore: DatastoreInfo,
    /// Kind of change
    pub change: ChangeKind,
    /// Content hash on the `mergeTo` side (None when created)
    pub old_hash: Option<String>,
    /// Content hash on the `mergeFrom` side (None when removed)
    pub new_hash: Option<String>,
}

impl DiffEntry {
    /// Identity of this entry across comparisons
    pub fn key(&self) -> DiffKey {
        DiffKey {
            canonical_path: self.canonical_path.clone(),
            kind: self.datastore.kind.clone(),
        }
    }
}

/// Full set of datastore comparisons from one comparator run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffTree {
    /// All recorded entries
    pub entries: Vec<DiffEntry>,
}

impl DiffTree {
    /// Create an empty diff tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry
    pub fn insert(&mut self, entry: DiffEntry) {
        self.entries.push(entry);
    }

    /// Look up an entry by its cross-comparison identity
    pub fn get(&self, key: &DiffKey) -> Option<&DiffEntry> {
        self.entries.iter().find(|e| {
            e.canonical_path == key.canonical_path && e.datastore.kind == key.kind
        })
    }

    /// Number of recorded entries
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Whether no differences were recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of comparing two filesystem abstractions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComparisonResult {
    /// Datastores present only on `mergeFrom`
    pub created: Vec<DiffEntry>,
    /// Datastores present only on `mergeTo`
    pub removed: Vec<DiffEntry>,
    /// Datastores present on both sides with differing content
    pub changed: Vec<DiffEntry>,
    /// Candidate conflicts (every difference until reconciled against history)
    pub conflicts: Vec<DiffKey>,
    /// All entries keyed for diff-of-diffs reconciliation
    pub diff_tree: DiffTree,
}

impl ComparisonResult {
    /// Whether the two trees were identical
    pub fn is_identical(&self) -> bool {
        self.diff_tree.is_empty()
    }
}

/// Which storage backend a merge endpoint is materialized from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemKind {
    /// Relational package/resource hierarchy
    DatabaseBacked,
    /// Cloned repository working tree
    RepositoryClone,
}

/// Why a merge state was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeCause {
    /// Local changes are being published to the remote
    Push,
    /// Remote changes are being applied locally
    Pull,
    /// Two branches are being merged
    Merge,
}

/// Which endpoint the user keeps editing while a merge state is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditableSide {
    /// The `mergeFrom` endpoint
    MergeFrom,
    /// The `mergeTo` endpoint
    MergeTo,
}

/// One side of a reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeEndpoint {
    /// Root resource IRI of this side
    pub root_iri: String,
    /// Backend the side is materialized from
    pub kind: FilesystemKind,
    /// Whether this side tracks a branch (as opposed to a pinned commit)
    pub is_branch: bool,
    /// Branch name, when `is_branch`
    pub branch_name: Option<String>,
    /// Last commit hash known for this side
    pub last_commit_hash: Option<String>,
    /// Remote URL, for repository-clone sides
    pub remote_url: Option<String>,
}

impl MergeEndpoint {
    /// Describe a database-backed endpoint
    pub fn database(root_iri: impl Into<String>, last_commit_hash: Option<String>) -> Self {
        Self {
            root_iri: root_iri.into(),
            kind: FilesystemKind::DatabaseBacked,
            is_branch: false,
            branch_name: None,
            last_commit_hash,
            remote_url: None,
        }
    }

    /// Describe a repository-clone endpoint on a branch
    pub fn repository(
        root_iri: impl Into<String>,
        remote_url: impl Into<String>,
        branch_name: impl Into<String>,
        last_commit_hash: Option<String>,
    ) -> Self {
        Self {
            root_iri: root_iri.into(),
            kind: FilesystemKind::RepositoryClone,
            is_branch: true,
            branch_name: Some(branch_name.into()),
            last_commit_hash,
            remote_url: Some(remote_url.into()),
        }
    }
}

/// One credential candidate for remote operations
///
/// Candidates are tried strictly in order; the loop is sequential because each
/// attempt may mutate on-disk clone state the next attempt depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Username (providers commonly accept a fixed token user here)
    pub username: String,
    /// Token or password
    pub secret: String,
}

impl Credential {
    /// Create a credential candidate
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

/// Conflict descriptor returned when an operation cannot write back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Root IRI of the `mergeFrom` endpoint
    pub merge_from_iri: String,
    /// Root IRI of the `mergeTo` endpoint
    pub merge_to_iri: String,
    /// Identifier of the merge state holding the conflicts
    pub merge_state_id: Uuid,
}

/// Terminal result of one orchestrated operation
///
/// Mirrors the HTTP surface consumed by the route layer: completed (200),
/// conflict (409), and redirect to an already-open merge state (300).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The operation ran to completion
    Completed {
        /// Commit hash the database side now records
        commit_hash: String,
    },
    /// The comparator found conflicts; the write-back was aborted
    Conflict(ConflictInfo),
    /// An open merge state already exists and must be resolved first
    PendingMergeState(Uuid),
}

/// Path-naming scheme of an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportVersion {
    /// Variant 1: canonical paths verbatim
    Flat,
    /// Variant 2: resource-type bucket directories inserted
    Bucketed,
}

impl ExportVersion {
    /// Numeric tag stored under `_exportVersion` in the root metadata
    pub fn as_number(self) -> u32 {
        match self {
            ExportVersion::Flat => 1,
            ExportVersion::Bucketed => 2,
        }
    }

    /// Parse the numeric tag read from an archive
    pub fn from_number(n: u64) -> Option<Self> {
        match n {
            1 => Some(ExportVersion::Flat),
            2 => Some(ExportVersion::Bucketed),
            _ => None,
        }
    }
}
