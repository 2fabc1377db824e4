//! Integration tests for treesync
//!
//! Drives the orchestrator end to end against local bare repositories:
//! publishing, divergence conflicts and their resolution, pulls, branch
//! merges, and the missing-branch clone fallback.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use treesync::*;

/// Test harness wiring a seeded store to a local bare remote
pub struct SyncTestHarness {
    pub store: Arc<MemoryResourceStore>,
    pub remote: TempDir,
    pub orchestrator: SyncOrchestrator,
}

impl SyncTestHarness {
    /// Create a harness with one package and one model resource
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let store = Arc::new(MemoryResourceStore::new());
        store
            .create_package(None, NodeMetadata::new("urn:root"))
            .unwrap();
        store
            .create_package(Some("urn:root"), NodeMetadata::new("urn:pkg"))
            .unwrap();
        store
            .create_resource(
                "urn:pkg",
                NodeMetadata::new("urn:m1").with_type_tags(vec!["SemanticModel".to_string()]),
            )
            .unwrap();
        store
            .set_datastore_json("urn:m1", "model", json!({"a": 1}))
            .unwrap();

        let remote = TempDir::new().unwrap();
        let repo = git2::Repository::init_bare(remote.path()).unwrap();
        repo.set_head("refs/heads/main").unwrap();

        let orchestrator =
            SyncOrchestrator::new(store.clone(), Arc::new(StaticProvider::new()));
        Self {
            store,
            remote,
            orchestrator,
        }
    }

    /// Request targeting the harness remote's `main` branch
    pub fn request(&self) -> SyncRequest {
        SyncRequest::new(
            "urn:root",
            self.remote.path().to_str().unwrap(),
            "main",
        )
    }

    pub fn remote_repo(&self) -> git2::Repository {
        git2::Repository::open_bare(self.remote.path()).unwrap()
    }

    /// Head commit hash of a remote branch
    pub fn remote_head(&self, branch: &str) -> String {
        self.remote_repo()
            .find_branch(branch, git2::BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap()
            .id()
            .to_string()
    }

    /// Create a remote branch off an existing one
    pub fn remote_branch(&self, from: &str, new_branch: &str) {
        let repo = self.remote_repo();
        let commit = repo
            .find_branch(from, git2::BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap();
        repo.branch(new_branch, &commit, true).unwrap();
    }

    /// Clone the remote, apply an edit in the working tree, commit and push
    pub fn remote_edit(
        &self,
        branch: &str,
        message: &str,
        edit: impl FnOnce(&Path),
    ) -> String {
        let dir = TempDir::new().unwrap();
        let repo = git2::build::RepoBuilder::new()
            .branch(branch)
            .clone(self.remote.path().to_str().unwrap(), dir.path())
            .unwrap();
        edit(dir.path());

        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.update_all(["*"].iter(), None).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let signature = git2::Signature::now("tester", "tester@localhost").unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        let oid = repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &[&parent])
            .unwrap();

        let mut remote = repo.find_remote("origin").unwrap();
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        remote.push(&[refspec.as_str()], None).unwrap();
        oid.to_string()
    }

    /// The model payload of `urn:m1` as committed on a remote branch
    pub fn remote_model(&self, branch: &str) -> serde_json::Value {
        let repo = self.remote_repo();
        let tree = repo
            .find_branch(branch, git2::BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap()
            .tree()
            .unwrap();
        let entry = tree
            .get_path(Path::new("urn:pkg/semantic-models/urn:m1.model.json"))
            .unwrap();
        let blob = repo.find_blob(entry.id()).unwrap();
        serde_json::from_slice(blob.content()).unwrap()
    }

    /// Resolve every open conflict of a merge state
    pub fn resolve_all(&self, uuid: uuid::Uuid) {
        let state = self.orchestrator.merge_states().get(uuid).unwrap();
        for key in state.unresolved_conflicts {
            self.orchestrator
                .merge_states()
                .resolve_conflict(uuid, &key)
                .unwrap();
        }
    }
}

fn completed(outcome: SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Completed { commit_hash } => commit_hash,
        other => panic!("expected completion, got {:?}", other),
    }
}

fn conflicted(outcome: SyncOutcome) -> ConflictInfo {
    match outcome {
        SyncOutcome::Conflict(info) => info,
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[test]
fn test_commit_publishes_database_tree() {
    let harness = SyncTestHarness::new();
    let hash = completed(harness.orchestrator.commit(&harness.request()).unwrap());

    assert_eq!(
        harness.store.last_commit_hash("urn:root").unwrap().as_deref(),
        Some(hash.as_str())
    );
    assert_eq!(harness.remote_head("main"), hash);

    // the bucketed layout landed in the repository
    let repo = harness.remote_repo();
    let tree = repo
        .find_commit(git2::Oid::from_str(&hash).unwrap())
        .unwrap()
        .tree()
        .unwrap();
    assert!(tree.get_path(Path::new(".meta.json")).is_ok());
    assert!(tree.get_path(Path::new("urn:pkg/.meta.json")).is_ok());
    assert!(tree
        .get_path(Path::new("urn:pkg/semantic-models/urn:m1.model.json"))
        .is_ok());
}

#[test]
fn test_push_without_remote_movement() {
    let harness = SyncTestHarness::new();
    let first = completed(harness.orchestrator.commit(&harness.request()).unwrap());

    harness
        .store
        .set_datastore_json("urn:m1", "model", json!({"a": 2}))
        .unwrap();
    let second = completed(harness.orchestrator.push(&harness.request()).unwrap());

    assert_ne!(first, second);
    assert_eq!(harness.remote_head("main"), second);
    assert_eq!(harness.store.active_merge_states("urn:root").unwrap(), 0);
}

#[test]
fn test_push_conflict_resolution_roundtrip() {
    let harness = SyncTestHarness::new();
    completed(harness.orchestrator.commit(&harness.request()).unwrap());

    // both sides move independently
    harness.remote_edit("main", "remote change", |root| {
        std::fs::write(
            root.join("urn:pkg/semantic-models/urn:m1.model.json"),
            b"{\"a\": 3}",
        )
        .unwrap();
    });
    harness
        .store
        .set_datastore_json("urn:m1", "model", json!({"a": 2}))
        .unwrap();

    let info = conflicted(harness.orchestrator.push(&harness.request()).unwrap());
    let state = harness
        .orchestrator
        .merge_states()
        .get(info.merge_state_id)
        .unwrap();
    assert!(!state.is_resolved());
    assert_eq!(harness.store.active_merge_states("urn:root").unwrap(), 1);

    // a repeated push while unresolved points back at the open state
    match harness.orchestrator.push(&harness.request()).unwrap() {
        SyncOutcome::PendingMergeState(uuid) => assert_eq!(uuid, state.uuid),
        other => panic!("expected pending state, got {:?}", other),
    }

    harness.resolve_all(state.uuid);
    let hash = completed(harness.orchestrator.push(&harness.request()).unwrap());
    assert_eq!(harness.remote_head("main"), hash);
    assert_eq!(harness.store.active_merge_states("urn:root").unwrap(), 0);

    // the database side won the resolved conflict
    assert_eq!(harness.remote_model("main"), json!({"a": 2}));
}

#[test]
fn test_pull_applies_remote_changes_after_resolution() {
    let harness = SyncTestHarness::new();
    completed(harness.orchestrator.commit(&harness.request()).unwrap());

    let remote_hash = harness.remote_edit("main", "remote change", |root| {
        std::fs::write(
            root.join("urn:pkg/semantic-models/urn:m1.model.json"),
            b"{\"a\": 42}",
        )
        .unwrap();
    });

    let info = conflicted(harness.orchestrator.pull(&harness.request()).unwrap());
    harness.resolve_all(info.merge_state_id);

    let hash = completed(harness.orchestrator.pull(&harness.request()).unwrap());
    assert_eq!(hash, remote_hash);
    assert_eq!(
        harness.store.datastore_json("urn:m1", "model").unwrap(),
        json!({"a": 42})
    );
    assert_eq!(
        harness.store.last_commit_hash("urn:root").unwrap().as_deref(),
        Some(remote_hash.as_str())
    );
    assert_eq!(harness.store.active_merge_states("urn:root").unwrap(), 0);
}

#[test]
fn test_pull_up_to_date_short_circuits() {
    let harness = SyncTestHarness::new();
    let hash = completed(harness.orchestrator.commit(&harness.request()).unwrap());
    let pulled = completed(harness.orchestrator.pull(&harness.request()).unwrap());
    assert_eq!(pulled, hash);
    assert_eq!(harness.store.active_merge_states("urn:root").unwrap(), 0);
}

#[test]
fn test_merge_writes_two_parent_commit() {
    let harness = SyncTestHarness::new();
    completed(harness.orchestrator.commit(&harness.request()).unwrap());
    harness.remote_branch("main", "feature");
    harness.remote_edit("feature", "feature change", |root| {
        std::fs::write(
            root.join("urn:pkg/semantic-models/urn:m1.model.json"),
            b"{\"a\": 7}",
        )
        .unwrap();
    });

    let request = harness.request().with_commit_message("Merge feature work");
    let info = conflicted(harness.orchestrator.merge(&request, "feature").unwrap());
    harness.resolve_all(info.merge_state_id);

    let hash = completed(harness.orchestrator.merge(&request, "feature").unwrap());
    assert_eq!(harness.remote_head("main"), hash);

    let repo = harness.remote_repo();
    let commit = repo.find_commit(git2::Oid::from_str(&hash).unwrap()).unwrap();
    assert_eq!(commit.parent_count(), 2);
    assert_eq!(commit.message().unwrap_or_default(), "Merge feature work");
}

#[test]
fn test_commit_conflicts_when_remote_moved() {
    let harness = SyncTestHarness::new();
    completed(harness.orchestrator.commit(&harness.request()).unwrap());

    let remote_hash = harness.remote_edit("main", "remote change", |root| {
        std::fs::write(
            root.join("urn:pkg/semantic-models/urn:m1.model.json"),
            b"{\"a\": 99}",
        )
        .unwrap();
    });

    // the remote movement must surface instead of being overwritten
    let info = conflicted(harness.orchestrator.commit(&harness.request()).unwrap());
    assert_eq!(harness.remote_head("main"), remote_hash);
    assert_eq!(harness.remote_model("main"), json!({"a": 99}));

    harness.resolve_all(info.merge_state_id);
    let hash = completed(harness.orchestrator.commit(&harness.request()).unwrap());
    assert_eq!(harness.remote_head("main"), hash);
    assert_eq!(harness.store.active_merge_states("urn:root").unwrap(), 0);
}

#[test]
fn test_commit_finalizes_resolved_merge_state() {
    let harness = SyncTestHarness::new();
    completed(harness.orchestrator.commit(&harness.request()).unwrap());

    harness.remote_edit("main", "remote change", |root| {
        std::fs::write(
            root.join("urn:pkg/semantic-models/urn:m1.model.json"),
            b"{\"a\": 3}",
        )
        .unwrap();
    });
    harness
        .store
        .set_datastore_json("urn:m1", "model", json!({"a": 2}))
        .unwrap();

    let info = conflicted(harness.orchestrator.push(&harness.request()).unwrap());
    harness.resolve_all(info.merge_state_id);

    // committing with the resolved state open must retire it
    let hash = completed(harness.orchestrator.commit(&harness.request()).unwrap());
    assert_eq!(harness.remote_head("main"), hash);
    assert_eq!(harness.store.active_merge_states("urn:root").unwrap(), 0);
    assert!(harness
        .orchestrator
        .merge_states()
        .get(info.merge_state_id)
        .is_err());
}

#[test]
fn test_missing_branch_falls_back_to_default() {
    let harness = SyncTestHarness::new();
    let first = completed(harness.orchestrator.commit(&harness.request()).unwrap());

    harness
        .store
        .set_datastore_json("urn:m1", "model", json!({"a": 5}))
        .unwrap();
    let mut request = harness.request();
    request.branch = "drafts".to_string();

    let hash = completed(harness.orchestrator.commit(&request).unwrap());
    assert_ne!(first, hash);
    assert_eq!(harness.remote_head("drafts"), hash);
    assert_eq!(harness.remote_head("main"), first);
    assert_eq!(
        harness.store.last_commit_hash("urn:root").unwrap().as_deref(),
        Some(hash.as_str())
    );
}

#[test]
fn test_clone_roundtrip_preserves_content() {
    let harness = SyncTestHarness::new();
    completed(harness.orchestrator.commit(&harness.request()).unwrap());

    // an identical re-comparison of the pushed tree finds nothing
    let dir = TempDir::new().unwrap();
    git2::build::RepoBuilder::new()
        .branch("main")
        .clone(harness.remote.path().to_str().unwrap(), dir.path())
        .unwrap();
    let clone_fs = WorkdirFilesystem::build(dir.path(), &[]).unwrap();
    let database = DatabaseFilesystem::build(harness.store.clone(), "urn:root").unwrap();
    let result = compare(&database, &clone_fs).unwrap();
    assert!(result.is_identical(), "differences: {:?}", result.diff_tree);
}
