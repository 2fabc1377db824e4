//! Error types for the treesync library
//!
//! This module defines all error types that can occur during synchronization
//! operations. Structural conflicts are deliberately *not* errors — they are
//! first-class results surfaced through [`crate::types::SyncOutcome`]; the
//! variants here cover I/O, collaborator and precondition failures.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the treesync library
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for all treesync operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error")]
    WalkDir(#[from] walkdir::Error),

    /// Errors raised by the underlying git library
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// Errors raised by the archive codec
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// UUID parsing error
    #[error("UUID error")]
    Uuid(#[from] uuid::Error),

    /// Resource not found in the resource store
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Package not found in the resource store
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    /// Datastore not found on a node
    #[error("Datastore not found: {kind} on {canonical_path}")]
    DatastoreNotFound {
        /// Canonical path of the owning node
        canonical_path: String,
        /// Datastore kind that was requested
        kind: String,
    },

    /// A materialized resource has no meta datastore
    ///
    /// Signals a corrupt or partially-imported tree; every leaf resource must
    /// carry its identity record.
    #[error("Resource {0} has no meta datastore")]
    MissingMetaDatastore(String),

    /// Merge state not found
    #[error("Merge state not found: {0}")]
    MergeStateNotFound(String),

    /// Finalization attempted while conflicts remain
    #[error("Merge state {uuid} still has {remaining} unresolved conflicts")]
    MergeStateNotResolved {
        /// Merge state identifier
        uuid: String,
        /// Number of conflicts still requiring user action
        remaining: usize,
    },

    /// Malformed archive entry path during import
    #[error("Invalid archive path: {0}")]
    InvalidArchivePath(String),

    /// Archive is structurally invalid (missing root metadata, unknown version)
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    /// Every credential candidate was rejected
    #[error("All {0} credential candidates were rejected")]
    CredentialsExhausted(usize),

    /// Remote branch required by the operation does not exist
    #[error("Remote branch not found: {0}")]
    BranchNotFound(String),

    /// Clone directory could not be prepared
    #[error("Clone failed for {url}: {reason}")]
    CloneFailed {
        /// Remote URL that was being cloned
        url: String,
        /// Failure detail from the last attempt
        reason: String,
    },

    /// Resource-store collaborator failure
    #[error("Store error: {0}")]
    Store(String),

    /// Hosting-provider collaborator failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Path conversion error
    #[error("Path is not valid UTF-8: {0:?}")]
    PathConversion(PathBuf),

    /// A state the control flow cannot legally reach
    ///
    /// Raised when the credential loop terminates with neither a success nor a
    /// conflict; by construction one of the two must have occurred.
    #[error("Unreachable state: {0}")]
    Unreachable(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a store error with a custom message
    pub fn store(msg: impl Into<String>) -> Self {
        SyncError::Store(msg.into())
    }

    /// Create a provider error with a custom message
    pub fn provider(msg: impl Into<String>) -> Self {
        SyncError::Provider(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal(msg.into())
    }

    /// Create an unreachable-state error with a custom message
    pub fn unreachable(msg: impl Into<String>) -> Self {
        SyncError::Unreachable(msg.into())
    }

    /// Check if this error may succeed with a different credential
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Git(e) if matches!(
            e.class(),
            git2::ErrorClass::Http | git2::ErrorClass::Ssh | git2::ErrorClass::Net
        ))
    }

    /// Check if this error indicates caller or data corruption
    ///
    /// Precondition violations are raised immediately and never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SyncError::ResourceNotFound(_)
                | SyncError::PackageNotFound(_)
                | SyncError::MissingMetaDatastore(_)
                | SyncError::InvalidArchivePath(_)
                | SyncError::InvalidArchive(_)
        )
    }
}
