//! Resource-model collaborator and the database-backed filesystem
//!
//! The relational backend stays outside this crate; [`ResourceStore`] is the
//! seam it plugs into. [`MemoryResourceStore`] is a complete in-memory
//! implementation carrying the reference semantics (and serving the test
//! harness). [`DatabaseFilesystem`] materializes a store's package/resource
//! hierarchy into the canonical tree model and routes writes back through the
//! store.
//!
//! Implementors are expected to make each trait method atomic per key;
//! cross-call transactionality is not assumed anywhere in this crate.

use crate::error::{Result, SyncError};
use crate::filesystem::{join_canonical, FilesystemAccess};
use crate::tree::{FilesystemNode, FilesystemTree, NodeId};
use crate::types::{DataFormat, DatastoreInfo, DatastoreKind, FilesystemKind, NodeMetadata};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// One resource or package record as the store reports it
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    /// Identity and descriptive metadata
    pub metadata: NodeMetadata,
    /// Whether this record is a package (directory) or a leaf resource
    pub is_package: bool,
}

/// Seam to the external resource model
///
/// Packages form the directory hierarchy; resources are leaves composed of
/// JSON datastores named by kind tag (`model`, `visual`, …). Identity
/// metadata is part of the record itself, so the `meta` datastore is derived,
/// never stored.
pub trait ResourceStore: Send + Sync {
    /// Look up a record by IRI
    fn resource(&self, iri: &str) -> Result<Option<ResourceRecord>>;

    /// Create a package, optionally under a parent package
    fn create_package(&self, parent_iri: Option<&str>, metadata: NodeMetadata) -> Result<()>;

    /// Create a leaf resource under a package
    fn create_resource(&self, package_iri: &str, metadata: NodeMetadata) -> Result<()>;

    /// Remove a resource or package together with its subtree
    fn remove_resource(&self, iri: &str) -> Result<()>;

    /// IRIs of a package's direct children, in insertion order
    fn list_children(&self, package_iri: &str) -> Result<Vec<String>>;

    /// Kind tags of the stored datastores of a resource
    fn datastore_names(&self, iri: &str) -> Result<Vec<String>>;

    /// Read one stored datastore
    fn datastore_json(&self, iri: &str, name: &str) -> Result<Value>;

    /// Create or replace one stored datastore
    fn set_datastore_json(&self, iri: &str, name: &str, value: Value) -> Result<()>;

    /// Remove one stored datastore
    fn remove_datastore(&self, iri: &str, name: &str) -> Result<()>;

    /// Replace a record's identity metadata
    fn update_metadata(&self, iri: &str, metadata: NodeMetadata) -> Result<()>;

    /// Record the commit hash a root was last synchronized at
    fn update_last_commit_hash(&self, root_iri: &str, hash: Option<String>) -> Result<()>;

    /// Commit hash a root was last synchronized at
    fn last_commit_hash(&self, root_iri: &str) -> Result<Option<String>>;

    /// Adjust the count of merge states a root participates in
    fn adjust_active_merge_states(&self, root_iri: &str, delta: i64) -> Result<()>;

    /// Count of merge states a root participates in
    fn active_merge_states(&self, root_iri: &str) -> Result<i64>;
}

#[derive(Debug)]
struct StoreEntry {
    metadata: NodeMetadata,
    is_package: bool,
    parent: Option<String>,
    children: Vec<String>,
    datastores: BTreeMap<String, Value>,
    last_commit_hash: Option<String>,
    active_merge_states: i64,
}

impl StoreEntry {
    fn new(metadata: NodeMetadata, is_package: bool, parent: Option<String>) -> Self {
        Self {
            metadata,
            is_package,
            parent,
            children: Vec::new(),
            datastores: BTreeMap::new(),
            last_commit_hash: None,
            active_merge_states: 0,
        }
    }
}

/// In-memory [`ResourceStore`]
///
/// Reference implementation used by the integration harness and by embedders
/// without a relational backend. All methods are atomic under one lock.
#[derive(Default)]
pub struct MemoryResourceStore {
    entries: RwLock<HashMap<String, StoreEntry>>,
}

impl MemoryResourceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        iri: &str,
        f: impl FnOnce(&mut StoreEntry) -> T,
    ) -> Result<T> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(iri)
            .ok_or_else(|| SyncError::ResourceNotFound(iri.to_string()))?;
        Ok(f(entry))
    }
}

impl ResourceStore for MemoryResourceStore {
    fn resource(&self, iri: &str) -> Result<Option<ResourceRecord>> {
        Ok(self.entries.read().get(iri).map(|e| ResourceRecord {
            metadata: e.metadata.clone(),
            is_package: e.is_package,
        }))
    }

    fn create_package(&self, parent_iri: Option<&str>, metadata: NodeMetadata) -> Result<()> {
        let mut entries = self.entries.write();
        let iri = metadata.iri.clone();
        if let Some(parent) = parent_iri {
            let parent_entry = entries
                .get_mut(parent)
                .ok_or_else(|| SyncError::PackageNotFound(parent.to_string()))?;
            parent_entry.children.push(iri.clone());
        }
        entries.insert(
            iri,
            StoreEntry::new(metadata, true, parent_iri.map(String::from)),
        );
        Ok(())
    }

    fn create_resource(&self, package_iri: &str, metadata: NodeMetadata) -> Result<()> {
        let mut entries = self.entries.write();
        let parent = entries
            .get_mut(package_iri)
            .ok_or_else(|| SyncError::PackageNotFound(package_iri.to_string()))?;
        let iri = metadata.iri.clone();
        parent.children.push(iri.clone());
        entries.insert(
            iri,
            StoreEntry::new(metadata, false, Some(package_iri.to_string())),
        );
        Ok(())
    }

    fn remove_resource(&self, iri: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let mut stack = vec![iri.to_string()];
        let parent = entries
            .get(iri)
            .ok_or_else(|| SyncError::ResourceNotFound(iri.to_string()))?
            .parent
            .clone();
        while let Some(current) = stack.pop() {
            if let Some(entry) = entries.remove(&current) {
                stack.extend(entry.children);
            }
        }
        if let Some(parent) = parent {
            if let Some(entry) = entries.get_mut(&parent) {
                entry.children.retain(|c| c != iri);
            }
        }
        Ok(())
    }

    fn list_children(&self, package_iri: &str) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let entry = entries
            .get(package_iri)
            .ok_or_else(|| SyncError::PackageNotFound(package_iri.to_string()))?;
        Ok(entry.children.clone())
    }

    fn datastore_names(&self, iri: &str) -> Result<Vec<String>> {
        self.with_entry(iri, |e| e.datastores.keys().cloned().collect())
    }

    fn datastore_json(&self, iri: &str, name: &str) -> Result<Value> {
        self.with_entry(iri, |e| e.datastores.get(name).cloned())?
            .ok_or_else(|| SyncError::DatastoreNotFound {
                canonical_path: iri.to_string(),
                kind: name.to_string(),
            })
    }

    fn set_datastore_json(&self, iri: &str, name: &str, value: Value) -> Result<()> {
        self.with_entry(iri, |e| {
            e.datastores.insert(name.to_string(), value);
        })
    }

    fn remove_datastore(&self, iri: &str, name: &str) -> Result<()> {
        self.with_entry(iri, |e| {
            e.datastores.remove(name);
        })
    }

    fn update_metadata(&self, iri: &str, metadata: NodeMetadata) -> Result<()> {
        self.with_entry(iri, |e| e.metadata = metadata)
    }

    fn update_last_commit_hash(&self, root_iri: &str, hash: Option<String>) -> Result<()> {
        self.with_entry(root_iri, |e| e.last_commit_hash = hash)
    }

    fn last_commit_hash(&self, root_iri: &str) -> Result<Option<String>> {
        self.with_entry(root_iri, |e| e.last_commit_hash.clone())
    }

    fn adjust_active_merge_states(&self, root_iri: &str, delta: i64) -> Result<()> {
        self.with_entry(root_iri, |e| {
            e.active_merge_states = (e.active_merge_states + delta).max(0)
        })
    }

    fn active_merge_states(&self, root_iri: &str) -> Result<i64> {
        self.with_entry(root_iri, |e| e.active_merge_states)
    }
}

/// Filesystem abstraction over a store's package/resource hierarchy
///
/// Canonical path segments are resource IRIs. Every node exposes a derived
/// `meta` datastore serialized from its record metadata; stored datastores map
/// one-to-one onto the remaining kinds, always in JSON.
pub struct DatabaseFilesystem {
    store: Arc<dyn ResourceStore>,
    tree: FilesystemTree,
    iri_by_path: HashMap<String, String>,
}

impl DatabaseFilesystem {
    /// Materialize the hierarchy rooted at `root_iri`
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ResourceNotFound`] when the root does not exist
    /// and propagates store failures from the traversal.
    pub fn build(store: Arc<dyn ResourceStore>, root_iri: &str) -> Result<Self> {
        let record = store
            .resource(root_iri)?
            .ok_or_else(|| SyncError::ResourceNotFound(root_iri.to_string()))?;
        debug!(root = root_iri, "materializing resource hierarchy");

        let mut tree = FilesystemTree::new(record.metadata.clone());
        let mut iri_by_path = HashMap::new();
        iri_by_path.insert("/".to_string(), root_iri.to_string());
        let root = tree.root();
        Self::attach_datastores(&store, &mut tree, root, root_iri)?;

        let mut pending: Vec<(NodeId, String)> = vec![(root, root_iri.to_string())];
        while let Some((parent_id, parent_iri)) = pending.pop() {
            let parent_path = tree.node(parent_id).canonical_path.clone();
            for child_iri in store.list_children(&parent_iri)? {
                let child = store
                    .resource(&child_iri)?
                    .ok_or_else(|| SyncError::ResourceNotFound(child_iri.clone()))?;
                let canonical =
                    join_canonical(&parent_path, &child_iri, child.is_package);
                let node = if child.is_package {
                    FilesystemNode::directory(&child_iri, &canonical, child.metadata)
                } else {
                    FilesystemNode::file(&child_iri, &canonical, child.metadata)
                };
                let id = tree.insert(parent_id, node)?;
                Self::attach_datastores(&store, &mut tree, id, &child_iri)?;
                iri_by_path.insert(canonical, child_iri.clone());
                if child.is_package {
                    pending.push((id, child_iri));
                }
            }
        }

        debug!(nodes = tree.len(), "resource hierarchy materialized");
        Ok(Self { store, tree, iri_by_path })
    }

    fn attach_datastores(
        store: &Arc<dyn ResourceStore>,
        tree: &mut FilesystemTree,
        id: NodeId,
        iri: &str,
    ) -> Result<()> {
        let node = tree.node_mut(id);
        node.datastores
            .push(DatastoreInfo::new(DatastoreKind::Meta, DataFormat::Json, iri));
        for name in store.datastore_names(iri)? {
            node.datastores.push(DatastoreInfo::new(
                DatastoreKind::parse(&name),
                DataFormat::Json,
                iri,
            ));
        }
        Ok(())
    }

    fn iri_of(&self, canonical_path: &str) -> &str {
        match self.iri_by_path.get(canonical_path) {
            Some(iri) => iri,
            None => panic!(
                "canonical path {:?} has no backing resource; tree was built incorrectly",
                canonical_path
            ),
        }
    }

    /// The store this filesystem writes through
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }
}

impl FilesystemAccess for DatabaseFilesystem {
    fn kind(&self) -> FilesystemKind {
        FilesystemKind::DatabaseBacked
    }

    fn tree(&self) -> &FilesystemTree {
        &self.tree
    }

    fn datastore_content(&self, canonical_path: &str, kind: &DatastoreKind) -> Result<Vec<u8>> {
        let iri = self.iri_of(canonical_path);
        match kind {
            DatastoreKind::Meta => {
                let id = self.tree.expect(canonical_path);
                Ok(serde_json::to_vec_pretty(&self.tree.node(id).metadata)?)
            }
            DatastoreKind::Foreign => Err(SyncError::DatastoreNotFound {
                canonical_path: canonical_path.to_string(),
                kind: kind.to_string(),
            }),
            _ => {
                let value = self.store.datastore_json(iri, kind.as_str())?;
                Ok(serde_json::to_vec_pretty(&value)?)
            }
        }
    }

    fn create_datastore(
        &mut self,
        canonical_path: &str,
        kind: &DatastoreKind,
        format: &DataFormat,
        content: &[u8],
    ) -> Result<()> {
        if *kind == DatastoreKind::Foreign {
            // foreign files live on the repository side only
            warn!(path = canonical_path, "skipping foreign file on database side");
            return Ok(());
        }
        let id = match self.tree.find(canonical_path) {
            Some(id) => id,
            None => {
                let is_dir = canonical_path.ends_with('/');
                let trimmed = canonical_path.trim_end_matches('/');
                let split = trimmed
                    .rfind('/')
                    .ok_or_else(|| SyncError::internal("canonical path missing parent"))?;
                let (parent, iri) = (&canonical_path[..split + 1], &trimmed[split + 1..]);
                let parent_id = self.tree.expect(parent);
                let parent_iri = self.iri_of(parent).to_string();
                let metadata = if *kind == DatastoreKind::Meta {
                    crate::workdir::parse_meta(content, iri)
                } else {
                    NodeMetadata::new(iri)
                };
                let node = if is_dir {
                    self.store
                        .create_package(Some(&parent_iri), metadata.clone())?;
                    FilesystemNode::directory(iri, canonical_path, metadata)
                } else {
                    self.store.create_resource(&parent_iri, metadata.clone())?;
                    FilesystemNode::file(iri, canonical_path, metadata)
                };
                let iri = iri.to_string();
                let id = self.tree.insert(parent_id, node)?;
                self.tree.node_mut(id).datastores.push(DatastoreInfo::new(
                    DatastoreKind::Meta,
                    DataFormat::Json,
                    &iri,
                ));
                self.iri_by_path.insert(canonical_path.to_string(), iri);
                id
            }
        };
        if *kind == DatastoreKind::Meta {
            let metadata =
                crate::workdir::parse_meta(content, &self.tree.node(id).name.clone());
            self.store
                .update_metadata(self.iri_of(canonical_path), metadata.clone())?;
            self.tree.node_mut(id).metadata = metadata;
            return Ok(());
        }
        let value: Value = serde_json::from_slice(content)?;
        let iri = self.iri_of(canonical_path).to_string();
        self.store.set_datastore_json(&iri, kind.as_str(), value)?;
        if self.tree.node(id).datastore(kind).is_none() {
            self.tree.node_mut(id).datastores.push(DatastoreInfo::new(
                kind.clone(),
                format.clone(),
                &iri,
            ));
        }
        Ok(())
    }

    fn update_datastore(
        &mut self,
        canonical_path: &str,
        kind: &DatastoreKind,
        content: &[u8],
    ) -> Result<()> {
        self.create_datastore(canonical_path, kind, &DataFormat::Json, content)
    }

    fn remove_datastore(&mut self, canonical_path: &str, kind: &DatastoreKind) -> Result<()> {
        if matches!(kind, DatastoreKind::Foreign) {
            return Ok(());
        }
        let iri = self.iri_of(canonical_path).to_string();
        self.store.remove_datastore(&iri, kind.as_str())?;
        let id = self.tree.expect(canonical_path);
        self.tree.node_mut(id).datastores.retain(|d| &d.kind != kind);
        Ok(())
    }

    fn remove_file(&mut self, canonical_path: &str) -> Result<()> {
        let iri = self.iri_of(canonical_path).to_string();
        self.store.remove_resource(&iri)?;
        let id = self.tree.expect(canonical_path);
        // drop the subtree's path index entries as well; only directory paths
        // (trailing separator) can have descendants
        let is_dir = self.tree.node(id).is_directory();
        let mut stale: Vec<String> = Vec::new();
        for path in self.iri_by_path.keys() {
            if path == canonical_path || (is_dir && path.starts_with(canonical_path)) {
                stale.push(path.clone());
            }
        }
        for path in stale {
            self.iri_by_path.remove(&path);
        }
        self.tree.remove(id)?;
        Ok(())
    }

    fn is_directory(&self, canonical_path: &str) -> bool {
        self.tree
            .find(canonical_path)
            .map(|id| self.tree.node(id).is_directory())
            .unwrap_or(false)
    }

    fn list_children(&self, canonical_path: &str) -> Vec<String> {
        let id = self.tree.expect(canonical_path);
        let mut children: Vec<String> = self
            .tree
            .children(id)
            .iter()
            .map(|c| self.tree.node(*c).canonical_path.clone())
            .collect();
        children.sort_unstable();
        children
    }
}
