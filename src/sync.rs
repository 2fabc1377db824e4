//! Synchronization orchestrator
//!
//! [`SyncOrchestrator`] drives the commit, push, pull, and merge workflows as
//! variations of one template: clone the remote branch with ordered credential
//! candidates, establish the local/remote/merge-base commit hashes, compare
//! the two filesystems when the endpoints diverged, route the result through
//! the merge-state manager, and only then write back (materialize, commit,
//! push) and fast-forward the recorded commit hash.
//!
//! Each operation is one sequential blocking task. Mutual exclusion per root
//! is the caller's responsibility; the orchestrator itself never runs two
//! phases of one operation concurrently.

use crate::archive;
use crate::comparator::compare;
use crate::error::{Result, SyncError};
use crate::filesystem::FilesystemAccess;
use crate::merge_state::{MergeState, MergeStateManager};
use crate::provider::HostingProvider;
use crate::store::{DatabaseFilesystem, ResourceStore};
use crate::types::{
    ComparisonResult, ConflictInfo, Credential, DatastoreKind, EditableSide, ExportVersion,
    MergeCause, MergeEndpoint, SyncOutcome,
};
use crate::workdir::WorkdirFilesystem;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{FetchOptions, IndexAddOption, Oid, PushOptions, RemoteCallbacks, Repository};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

/// Parameters of one orchestrated operation
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Root IRI of the database-backed tree
    pub root_iri: String,
    /// Remote repository URL
    pub remote_url: String,
    /// Branch the operation targets
    pub branch: String,
    /// Commit message override (a default is derived when absent)
    pub commit_message: Option<String>,
    /// Credential candidates, tried strictly in order
    pub credentials: Vec<Credential>,
    /// Layout used when materializing the database tree
    pub export_version: ExportVersion,
    /// Compare even when the commit hashes say nothing moved
    pub force_compare: bool,
}

impl SyncRequest {
    /// Create a request with the default knobs
    pub fn new(
        root_iri: impl Into<String>,
        remote_url: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            root_iri: root_iri.into(),
            remote_url: remote_url.into(),
            branch: branch.into(),
            commit_message: None,
            credentials: Vec::new(),
            export_version: ExportVersion::Bucketed,
            force_compare: false,
        }
    }

    /// Set the commit message
    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }

    /// Set the credential candidates
    pub fn with_credentials(mut self, credentials: Vec<Credential>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the export layout
    pub fn with_export_version(mut self, version: ExportVersion) -> Self {
        self.export_version = version;
        self
    }

    /// Force a comparison regardless of recorded hashes
    pub fn with_force_compare(mut self, force: bool) -> Self {
        self.force_compare = force;
        self
    }
}

/// Try an operation once per credential candidate
///
/// Candidates run strictly in order; only retryable (transport/auth) failures
/// advance to the next one. Exhausting the list raises
/// [`SyncError::CredentialsExhausted`]. An empty list makes a single attempt
/// with default credentials, for remotes that need none.
fn with_credentials<T, F>(credentials: &[Credential], mut attempt: F) -> Result<T>
where
    F: FnMut(Option<&Credential>) -> Result<T>,
{
    if credentials.is_empty() {
        return attempt(None);
    }
    let last = credentials.len() - 1;
    for (index, credential) in credentials.iter().enumerate() {
        match attempt(Some(credential)) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && index < last => {
                warn!(candidate = index, error = %err, "credential rejected, trying next");
            }
            Err(err) if err.is_retryable() => {
                warn!(candidate = index, error = %err, "last credential rejected");
                return Err(SyncError::CredentialsExhausted(credentials.len()));
            }
            Err(err) => return Err(err),
        }
    }
    // the loop either returned a value or ran out of candidates above
    Err(SyncError::unreachable(
        "credential loop finished with neither success nor terminal failure",
    ))
}

fn remote_callbacks(credential: Option<&Credential>) -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(credential) = credential.cloned() {
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            let username = if credential.username.is_empty() {
                username_from_url.unwrap_or("git")
            } else {
                credential.username.as_str()
            };
            git2::Cred::userpass_plaintext(username, &credential.secret)
        });
    }
    callbacks
}

fn clone_once(
    url: &str,
    path: &Path,
    branch: Option<&str>,
    credential: Option<&Credential>,
) -> std::result::Result<Repository, git2::Error> {
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(remote_callbacks(credential));
    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch);
    if let Some(branch) = branch {
        builder.branch(branch);
    }
    builder.clone(url, path)
}

fn branch_missing(err: &git2::Error) -> bool {
    err.code() == git2::ErrorCode::NotFound || err.class() == git2::ErrorClass::Reference
}

fn head_hash(repo: &Repository) -> Option<String> {
    repo.head()
        .ok()
        .and_then(|head| head.peel_to_commit().ok())
        .map(|commit| commit.id().to_string())
}

fn merge_base_hash(repo: &Repository, a: Option<&str>, b: Option<&str>) -> Option<String> {
    let a = Oid::from_str(a?).ok()?;
    let b = Oid::from_str(b?).ok()?;
    repo.merge_base(a, b).ok().map(|oid| oid.to_string())
}

fn signature(repo: &Repository) -> Result<git2::Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| git2::Signature::now("treesync", "treesync@localhost"))?)
}

/// Stage everything and commit, returning None when the tree is unchanged
fn commit_all(repo: &Repository, message: &str) -> Result<Option<Oid>> {
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;
    let tree_id = index.write_tree()?;
    if let Ok(head) = repo.head() {
        if head.peel_to_tree()?.id() == tree_id {
            debug!("working tree unchanged, nothing to commit");
            return Ok(None);
        }
    }
    let tree = repo.find_tree(tree_id)?;
    let signature = signature(repo)?;
    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
    Ok(Some(oid))
}

fn push_branch(repo: &Repository, branch: &str, credential: Option<&Credential>) -> Result<()> {
    let mut remote = repo.find_remote("origin")?;
    let mut options = PushOptions::new();
    options.remote_callbacks(remote_callbacks(credential));
    let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
    remote.push(&[refspec.as_str()], Some(&mut options))?;
    Ok(())
}

/// Stage the `their` side of every index conflict
///
/// Runs after the structural conflicts were already resolved through the
/// merge state, so the incoming side is the approved one.
fn resolve_index_conflicts(repo: &Repository, index: &mut git2::Index) -> Result<()> {
    let conflicts: Vec<git2::IndexConflict> =
        index.conflicts()?.collect::<std::result::Result<_, _>>()?;
    for conflict in conflicts {
        match conflict.their {
            Some(mut entry) => {
                entry.flags &= !0x3000; // clear the stage bits
                let blob = repo.find_blob(entry.id)?;
                index.add_frombuffer(&entry, blob.content())?;
            }
            None => {
                if let Some(entry) = conflict.our {
                    let path = std::str::from_utf8(&entry.path)
                        .map_err(|_| SyncError::internal("non-UTF-8 path in merge index"))?
                        .to_string();
                    index.remove_path(Path::new(&path))?;
                }
            }
        }
    }
    index.write()?;
    Ok(())
}

/// Replay a comparison onto the `merge_to` side
///
/// Entries are applied in an order that keeps the tree invariants intact:
/// creations parents-first with metadata before payloads, then changes, then
/// removals deepest-first.
pub fn apply_diff(
    target: &mut dyn FilesystemAccess,
    source: &dyn FilesystemAccess,
    comparison: &ComparisonResult,
) -> Result<()> {
    let mut created = comparison.created.clone();
    created.sort_by(|a, b| {
        (a.canonical_path.as_str(), a.datastore.kind != DatastoreKind::Meta)
            .cmp(&(b.canonical_path.as_str(), b.datastore.kind != DatastoreKind::Meta))
    });
    for entry in &created {
        let content = source.datastore_content(&entry.canonical_path, &entry.datastore.kind)?;
        target.create_datastore(
            &entry.canonical_path,
            &entry.datastore.kind,
            &entry.datastore.format,
            &content,
        )?;
    }
    for entry in &comparison.changed {
        let content = source.datastore_content(&entry.canonical_path, &entry.datastore.kind)?;
        target.update_datastore(&entry.canonical_path, &entry.datastore.kind, &content)?;
    }
    let mut removed = comparison.removed.clone();
    removed.sort_by(|a, b| b.canonical_path.cmp(&a.canonical_path));
    for entry in &removed {
        if target.tree().find(&entry.canonical_path).is_none() {
            // already gone with an enclosing removal
            continue;
        }
        if entry.datastore.kind == DatastoreKind::Meta {
            target.remove_file(&entry.canonical_path)?;
        } else {
            target.remove_datastore(&entry.canonical_path, &entry.datastore.kind)?;
        }
    }
    Ok(())
}

/// Drives commit, push, pull, and merge against a remote repository
pub struct SyncOrchestrator {
    store: Arc<dyn ResourceStore>,
    provider: Arc<dyn HostingProvider>,
    merge_states: Arc<MergeStateManager>,
}

impl SyncOrchestrator {
    /// Create an orchestrator over a store and provider
    pub fn new(store: Arc<dyn ResourceStore>, provider: Arc<dyn HostingProvider>) -> Self {
        let merge_states = Arc::new(MergeStateManager::new(store.clone()));
        Self {
            store,
            provider,
            merge_states,
        }
    }

    /// The merge-state manager, for conflict resolution surfaces
    pub fn merge_states(&self) -> &Arc<MergeStateManager> {
        &self.merge_states
    }

    /// Snapshot the database tree onto the branch and push
    ///
    /// Publishes directly while the remote head is exactly where the last
    /// synchronization left it; a remote that moved in the meantime routes
    /// through the merge-state machinery like a push, so nobody else's
    /// commits are silently replaced.
    #[instrument(skip_all, fields(root = %request.root_iri, branch = %request.branch))]
    pub fn commit(&self, request: &SyncRequest) -> Result<SyncOutcome> {
        self.publish(request, false)
    }

    /// Publish local changes, comparing first when the remote moved
    #[instrument(skip_all, fields(root = %request.root_iri, branch = %request.branch))]
    pub fn push(&self, request: &SyncRequest) -> Result<SyncOutcome> {
        self.publish(request, request.force_compare)
    }

    /// Shared publication template behind [`Self::commit`] and [`Self::push`]
    fn publish(&self, request: &SyncRequest, force_compare: bool) -> Result<SyncOutcome> {
        let existing = self.open_state(request);
        if let Some(state) = &existing {
            if !state.is_resolved() {
                return Ok(SyncOutcome::PendingMergeState(state.uuid));
            }
        }
        let recorded = self.store.last_commit_hash(&request.root_iri)?;
        let (workdir, repo) = self.clone_repository(request, recorded.as_deref())?;
        let remote_head = head_hash(&repo);

        let diverged = recorded != remote_head;
        let mut state = None;
        if existing.is_some() || diverged || force_compare {
            let database = DatabaseFilesystem::build(self.store.clone(), &request.root_iri)?;
            let clone_fs =
                WorkdirFilesystem::build(workdir.path(), &self.provider.provider_directories())?;
            let comparison = compare(&database, &clone_fs)?;
            let current = match existing {
                Some(previous) => self
                    .merge_states
                    .update_to_be_up_to_date(previous.uuid, &comparison)?,
                None => self.merge_states.create_merge_state(
                    MergeEndpoint::database(&request.root_iri, recorded.clone()),
                    MergeEndpoint::repository(
                        &request.root_iri,
                        &request.remote_url,
                        &request.branch,
                        remote_head.clone(),
                    ),
                    MergeCause::Push,
                    EditableSide::MergeFrom,
                    merge_base_hash(&repo, recorded.as_deref(), remote_head.as_deref()),
                    &comparison,
                    request.commit_message.clone(),
                )?,
            };
            if !current.is_resolved() {
                return Ok(self.conflict_outcome(&current));
            }
            state = Some(current);
        }
        self.write_back(request, workdir.path(), &repo, remote_head, state.as_ref())
    }

    /// Apply remote changes onto the database tree
    #[instrument(skip_all, fields(root = %request.root_iri, branch = %request.branch))]
    pub fn pull(&self, request: &SyncRequest) -> Result<SyncOutcome> {
        let existing = self.open_state(request);
        if let Some(state) = &existing {
            if !state.is_resolved() {
                return Ok(SyncOutcome::PendingMergeState(state.uuid));
            }
        }
        let recorded = self.store.last_commit_hash(&request.root_iri)?;
        let (workdir, repo) = self.clone_repository(request, recorded.as_deref())?;
        let remote_head = head_hash(&repo);

        if existing.is_none() && !request.force_compare && recorded == remote_head {
            debug!("already at the remote head");
            return Ok(SyncOutcome::Completed {
                commit_hash: recorded.unwrap_or_default(),
            });
        }

        let mut database = DatabaseFilesystem::build(self.store.clone(), &request.root_iri)?;
        let clone_fs =
            WorkdirFilesystem::build(workdir.path(), &self.provider.provider_directories())?;
        let comparison = compare(&clone_fs, &database)?;
        let state = match existing {
            Some(previous) => self
                .merge_states
                .update_to_be_up_to_date(previous.uuid, &comparison)?,
            None => self.merge_states.create_merge_state(
                MergeEndpoint::repository(
                    &request.root_iri,
                    &request.remote_url,
                    &request.branch,
                    remote_head.clone(),
                ),
                MergeEndpoint::database(&request.root_iri, recorded.clone()),
                MergeCause::Pull,
                EditableSide::MergeTo,
                merge_base_hash(&repo, recorded.as_deref(), remote_head.as_deref()),
                &comparison,
                None,
            )?,
        };
        if !state.is_resolved() {
            return Ok(self.conflict_outcome(&state));
        }

        apply_diff(&mut database, &clone_fs, &comparison)?;
        let hash = self
            .merge_states
            .finalize(state.uuid, |_| Ok(remote_head.clone()))?;
        info!(hash = ?hash, "pull applied");
        Ok(SyncOutcome::Completed {
            commit_hash: hash.unwrap_or_default(),
        })
    }

    /// Merge one remote branch into another
    ///
    /// Compares the two branch trees first; the git merge commit is only
    /// written once the merge state is resolved. The default merge message is
    /// harvested from the repository state and overridden by the request's
    /// commit message.
    #[instrument(skip_all, fields(root = %request.root_iri, from = source_branch, into = %request.branch))]
    pub fn merge(&self, request: &SyncRequest, source_branch: &str) -> Result<SyncOutcome> {
        let existing = self.open_state(request);
        if let Some(state) = &existing {
            if !state.is_resolved() {
                return Ok(SyncOutcome::PendingMergeState(state.uuid));
            }
        }
        let (workdir, repo) = self.clone_repository(request, None)?;
        let source_request = SyncRequest {
            branch: source_branch.to_string(),
            ..request.clone()
        };
        let (source_dir, source_repo) = self.clone_repository(&source_request, None)?;

        let excluded = self.provider.provider_directories();
        let target_fs = WorkdirFilesystem::build(workdir.path(), &excluded)?;
        let source_fs = WorkdirFilesystem::build(source_dir.path(), &excluded)?;
        let comparison = compare(&source_fs, &target_fs)?;

        let target_head = head_hash(&repo);
        let source_head = head_hash(&source_repo);
        let state = match existing {
            Some(previous) => self
                .merge_states
                .update_to_be_up_to_date(previous.uuid, &comparison)?,
            None => self.merge_states.create_merge_state(
                MergeEndpoint::repository(
                    &request.root_iri,
                    &request.remote_url,
                    source_branch,
                    source_head,
                ),
                MergeEndpoint::repository(
                    &request.root_iri,
                    &request.remote_url,
                    &request.branch,
                    target_head.clone(),
                ),
                MergeCause::Merge,
                EditableSide::MergeTo,
                merge_base_hash(
                    &repo,
                    target_head.as_deref(),
                    head_hash(&source_repo).as_deref(),
                ),
                &comparison,
                request.commit_message.clone(),
            )?,
        };
        if !state.is_resolved() {
            return Ok(self.conflict_outcome(&state));
        }

        let merged = merge_commit(&repo, source_branch, request.commit_message.as_deref())?;
        if merged.is_some() {
            with_credentials(&request.credentials, |credential| {
                push_branch(&repo, &request.branch, credential)
            })?;
        }
        let hash = merged.map(|oid| oid.to_string()).or(target_head);
        let hash = self.merge_states.finalize(state.uuid, |_| Ok(hash.clone()))?;
        info!(hash = ?hash, "merge finished");
        Ok(SyncOutcome::Completed {
            commit_hash: hash.unwrap_or_default(),
        })
    }

    fn open_state(&self, request: &SyncRequest) -> Option<MergeState> {
        self.merge_states
            .find_by_endpoints(&request.root_iri, &request.root_iri)
    }

    fn conflict_outcome(&self, state: &MergeState) -> SyncOutcome {
        info!(uuid = %state.uuid, conflicts = state.unresolved_conflicts.len(), "conflicts found");
        SyncOutcome::Conflict(ConflictInfo {
            merge_from_iri: state.merge_from.root_iri.clone(),
            merge_to_iri: state.merge_to.root_iri.clone(),
            merge_state_id: state.uuid,
        })
    }

    fn clone_repository(
        &self,
        request: &SyncRequest,
        recorded: Option<&str>,
    ) -> Result<(TempDir, Repository)> {
        with_credentials(&request.credentials, |credential| {
            self.try_clone(request, credential, recorded)
        })
    }

    fn try_clone(
        &self,
        request: &SyncRequest,
        credential: Option<&Credential>,
        recorded: Option<&str>,
    ) -> Result<(TempDir, Repository)> {
        let url = self.provider.clone_url_for(&request.remote_url, credential);
        let dir = TempDir::new()?;
        match clone_once(&url, dir.path(), Some(&request.branch), credential) {
            Ok(repo) => return Ok((dir, repo)),
            Err(err) if branch_missing(&err) => {
                debug!(branch = %request.branch, "branch absent on remote, cloning default branch");
            }
            Err(err) => {
                return Err(SyncError::Git(err));
            }
        }

        // fall back to the default branch and pin the requested branch
        // locally, either at the recorded commit or at the current head
        let dir = TempDir::new()?;
        let repo = clone_once(&url, dir.path(), None, credential)?;
        {
            let head = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
            match head {
                Some(head) => {
                    let target = match recorded.and_then(|hash| Oid::from_str(hash).ok()) {
                        Some(oid) => repo.find_commit(oid).unwrap_or(head),
                        None => head,
                    };
                    repo.branch(&request.branch, &target, true)?;
                    repo.set_head(&format!("refs/heads/{}", request.branch))?;
                    let mut checkout = CheckoutBuilder::new();
                    checkout.force();
                    repo.checkout_head(Some(&mut checkout))?;
                }
                None => {
                    // empty repository: point HEAD at the unborn branch
                    repo.set_head(&format!("refs/heads/{}", request.branch))?;
                }
            }
        }
        Ok((dir, repo))
    }

    /// Materialize the database tree into the clone, commit, and push
    fn write_back(
        &self,
        request: &SyncRequest,
        workdir: &Path,
        repo: &Repository,
        remote_head: Option<String>,
        state: Option<&MergeState>,
    ) -> Result<SyncOutcome> {
        let database = DatabaseFilesystem::build(self.store.clone(), &request.root_iri)?;
        self.clear_worktree(workdir)?;
        archive::export_dir(&database, workdir, request.export_version)?;

        let message = request
            .commit_message
            .clone()
            .unwrap_or_else(|| format!("Synchronize {}", request.root_iri));
        let committed = commit_all(repo, &message)?;
        if committed.is_some() {
            with_credentials(&request.credentials, |credential| {
                push_branch(repo, &request.branch, credential)
            })?;
        }
        let new_head = committed
            .map(|oid| oid.to_string())
            .or(remote_head)
            .ok_or_else(|| {
                SyncError::unreachable("write-back produced no commit on an empty history")
            })?;

        match state {
            Some(state) => {
                self.merge_states
                    .finalize(state.uuid, |_| Ok(Some(new_head.clone())))?;
            }
            None => {
                self.store
                    .update_last_commit_hash(&request.root_iri, Some(new_head.clone()))?;
            }
        }
        info!(hash = %new_head, "write-back pushed");
        Ok(SyncOutcome::Completed {
            commit_hash: new_head,
        })
    }

    /// Empty the working directory except `.git` and provider directories
    fn clear_worktree(&self, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == ".git" || self.provider.is_provider_directory(&name) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Write the merge commit for a source branch, favoring the incoming side in
/// content conflicts
fn merge_commit(
    repo: &Repository,
    source_branch: &str,
    message: Option<&str>,
) -> Result<Option<Oid>> {
    let reference = repo
        .find_reference(&format!("refs/remotes/origin/{}", source_branch))
        .map_err(|_| SyncError::BranchNotFound(source_branch.to_string()))?;
    let annotated = repo.reference_to_annotated_commit(&reference)?;
    let (analysis, _) = repo.merge_analysis(&[&annotated])?;
    if analysis.is_up_to_date() {
        debug!("target already contains the source branch");
        return Ok(None);
    }

    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.merge(&[&annotated], None, Some(&mut checkout))?;

    let mut index = repo.index()?;
    if index.has_conflicts() {
        resolve_index_conflicts(repo, &mut index)?;
    }
    // harvest the default message before the merge state is cleaned up
    let message = match message {
        Some(message) => message.to_string(),
        None => repo
            .message()
            .unwrap_or_else(|_| format!("Merge branch '{}'", source_branch)),
    };

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let head = repo.head()?.peel_to_commit()?;
    let source = repo.find_commit(annotated.id())?;
    let signature = signature(repo)?;
    let oid = repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        &message,
        &tree,
        &[&head, &source],
    )?;
    repo.cleanup_state()?;
    Ok(Some(oid))
}
