//! Merge states: persistent reconciliation records
//!
//! A merge state is opened whenever a push, pull, or merge finds the two
//! endpoints diverged. It records the comparison, the conflict set, and which
//! side the user keeps editing while the state is open. Repeated refreshes
//! fold the conflict set forward: a difference the user already accepted does
//! not come back just because the editable side kept moving.
//!
//! States live in the manager's table; the active-state counters on the
//! endpoint roots are persisted through the [`ResourceStore`] so route layers
//! can cheaply ask "is this root mid-merge".

use crate::error::{Result, SyncError};
use crate::store::ResourceStore;
use crate::types::{
    ComparisonResult, DiffKey, DiffTree, EditableSide, FilesystemKind, MergeCause, MergeEndpoint,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// One open reconciliation between two endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeState {
    /// Stable identifier of this state
    pub uuid: Uuid,
    /// The side differences flow from (`new` side of every entry)
    pub merge_from: MergeEndpoint,
    /// The side differences flow to (`old` side of every entry)
    pub merge_to: MergeEndpoint,
    /// Operation that opened the state
    pub cause: MergeCause,
    /// Side the user keeps editing while the state is open
    pub editable_side: EditableSide,
    /// Merge-base commit the endpoints share, when known
    pub last_common_commit_hash: Option<String>,
    /// Comparison snapshot the conflict set was derived from
    pub diff_tree: DiffTree,
    /// Every difference seen by the latest comparison
    pub all_conflicts: Vec<DiffKey>,
    /// Differences still requiring a user decision
    pub unresolved_conflicts: Vec<DiffKey>,
    /// Commit message recorded for finalization
    pub commit_message: Option<String>,
    /// Whether the state reflects the latest comparison of its endpoints
    pub is_up_to_date: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last refresh or resolution timestamp
    pub modified_at: DateTime<Utc>,
}

impl MergeState {
    /// Number of differences the latest comparison recorded
    pub fn conflict_count(&self) -> usize {
        self.all_conflicts.len()
    }

    /// Whether every conflict has been resolved
    pub fn is_resolved(&self) -> bool {
        self.unresolved_conflicts.is_empty()
    }

    /// Hash of the non-editable side of a diff entry
    ///
    /// The non-editable side is frozen while the state is open; its hash is
    /// what refresh checks to decide whether an old conflict survived.
    fn frozen_side_hash<'a>(&self, entry: &'a crate::types::DiffEntry) -> Option<&'a String> {
        match self.editable_side {
            EditableSide::MergeTo => entry.new_hash.as_ref(),
            EditableSide::MergeFrom => entry.old_hash.as_ref(),
        }
    }
}

/// Lifecycle manager for merge states
pub struct MergeStateManager {
    store: Arc<dyn ResourceStore>,
    states: RwLock<HashMap<Uuid, MergeState>>,
}

impl MergeStateManager {
    /// Create a manager backed by the given store
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Open a merge state for a diverged comparison
    ///
    /// A state is created even when the comparison found zero conflicts, so
    /// push, pull, and merge all run the same state machine; a zero-conflict
    /// state finalizes immediately. Bumps the active-state counter on each
    /// endpoint root.
    pub fn create_merge_state(
        &self,
        merge_from: MergeEndpoint,
        merge_to: MergeEndpoint,
        cause: MergeCause,
        editable_side: EditableSide,
        last_common_commit_hash: Option<String>,
        comparison: &ComparisonResult,
        commit_message: Option<String>,
    ) -> Result<MergeState> {
        let now = Utc::now();
        let state = MergeState {
            uuid: Uuid::new_v4(),
            merge_from,
            merge_to,
            cause,
            editable_side,
            last_common_commit_hash,
            diff_tree: comparison.diff_tree.clone(),
            all_conflicts: comparison.conflicts.clone(),
            unresolved_conflicts: comparison.conflicts.clone(),
            commit_message,
            is_up_to_date: true,
            created_at: now,
            modified_at: now,
        };
        for root in self.endpoint_roots(&state) {
            self.store.adjust_active_merge_states(&root, 1)?;
        }
        info!(
            uuid = %state.uuid,
            conflicts = state.conflict_count(),
            ?cause,
            "merge state opened"
        );
        self.states.write().insert(state.uuid, state.clone());
        Ok(state)
    }

    /// Look up a state by identifier
    pub fn get(&self, uuid: Uuid) -> Result<MergeState> {
        self.states
            .read()
            .get(&uuid)
            .cloned()
            .ok_or_else(|| SyncError::MergeStateNotFound(uuid.to_string()))
    }

    /// Look up the open state between two endpoint roots, if any
    pub fn find_by_endpoints(&self, from_root: &str, to_root: &str) -> Option<MergeState> {
        self.states
            .read()
            .values()
            .find(|s| s.merge_from.root_iri == from_root && s.merge_to.root_iri == to_root)
            .cloned()
    }

    /// Mark one conflict as resolved by the user
    pub fn resolve_conflict(&self, uuid: Uuid, key: &DiffKey) -> Result<MergeState> {
        let mut states = self.states.write();
        let state = states
            .get_mut(&uuid)
            .ok_or_else(|| SyncError::MergeStateNotFound(uuid.to_string()))?;
        state.unresolved_conflicts.retain(|k| k != key);
        state.modified_at = Utc::now();
        trace!(uuid = %uuid, remaining = state.unresolved_conflicts.len(), "conflict resolved");
        Ok(state.clone())
    }

    /// Refresh a state against a fresh comparison of its endpoints
    ///
    /// Conflict survival: a difference from the new comparison is carried over
    /// as already-resolved when the same `(path, kind)` was known before, was
    /// not left unresolved, and the frozen (non-editable) side's content hash
    /// has not moved since. Everything else becomes unresolved.
    pub fn update_to_be_up_to_date(
        &self,
        uuid: Uuid,
        comparison: &ComparisonResult,
    ) -> Result<MergeState> {
        let mut states = self.states.write();
        let state = states
            .get_mut(&uuid)
            .ok_or_else(|| SyncError::MergeStateNotFound(uuid.to_string()))?;

        let mut unresolved = Vec::new();
        for entry in &comparison.diff_tree.entries {
            let key = entry.key();
            let survives_as_resolved = match state.diff_tree.get(&key) {
                Some(previous) => {
                    !state.unresolved_conflicts.contains(&key)
                        && state.frozen_side_hash(previous) == state.frozen_side_hash(entry)
                }
                None => false,
            };
            if survives_as_resolved {
                trace!(path = %key.canonical_path, kind = %key.kind, "conflict carried as resolved");
            } else {
                unresolved.push(key);
            }
        }

        state.diff_tree = comparison.diff_tree.clone();
        state.all_conflicts = comparison.conflicts.clone();
        state.unresolved_conflicts = unresolved;
        state.is_up_to_date = true;
        state.modified_at = Utc::now();
        debug!(
            uuid = %uuid,
            total = state.all_conflicts.len(),
            unresolved = state.unresolved_conflicts.len(),
            "merge state refreshed"
        );
        Ok(state.clone())
    }

    /// Mark a state stale after one of its endpoints changed
    pub fn mark_stale(&self, uuid: Uuid) -> Result<()> {
        let mut states = self.states.write();
        let state = states
            .get_mut(&uuid)
            .ok_or_else(|| SyncError::MergeStateNotFound(uuid.to_string()))?;
        state.is_up_to_date = false;
        Ok(())
    }

    /// Finalize a fully resolved state
    ///
    /// Runs the caller-supplied finalizer (the git merge-commit construction
    /// for merges; a no-op returning the already-known hash for push/pull),
    /// then fast-forwards the database-backed endpoint's recorded commit hash
    /// and removes the state. The state survives a finalizer failure.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MergeStateNotResolved`] while conflicts remain.
    pub fn finalize<F>(&self, uuid: Uuid, finalizer: F) -> Result<Option<String>>
    where
        F: FnOnce(&MergeState) -> Result<Option<String>>,
    {
        let state = self.get(uuid)?;
        if !state.is_resolved() {
            return Err(SyncError::MergeStateNotResolved {
                uuid: uuid.to_string(),
                remaining: state.unresolved_conflicts.len(),
            });
        }

        let commit_hash = finalizer(&state)?;

        // fast-forward the database side to wherever the repository side is
        let target_hash = commit_hash.clone().or_else(|| {
            let other = if state.merge_from.kind == FilesystemKind::DatabaseBacked {
                &state.merge_to
            } else {
                &state.merge_from
            };
            other.last_commit_hash.clone()
        });
        for endpoint in [&state.merge_from, &state.merge_to] {
            if endpoint.kind == FilesystemKind::DatabaseBacked {
                self.store
                    .update_last_commit_hash(&endpoint.root_iri, target_hash.clone())?;
            }
        }

        self.remove(uuid)?;
        info!(uuid = %uuid, hash = ?target_hash, "merge state finalized");
        Ok(target_hash)
    }

    /// Remove a state and release the endpoint counters
    pub fn remove(&self, uuid: Uuid) -> Result<()> {
        let state = self
            .states
            .write()
            .remove(&uuid)
            .ok_or_else(|| SyncError::MergeStateNotFound(uuid.to_string()))?;
        for root in self.endpoint_roots(&state) {
            self.store.adjust_active_merge_states(&root, -1)?;
        }
        Ok(())
    }

    fn endpoint_roots(&self, state: &MergeState) -> Vec<String> {
        let mut roots = vec![state.merge_from.root_iri.clone()];
        if state.merge_to.root_iri != state.merge_from.root_iri {
            roots.push(state.merge_to.root_iri.clone());
        }
        roots
    }
}
