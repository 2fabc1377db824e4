//! In-memory filesystem tree model
//!
//! The tree is the common representation every other component works on:
//! directory and file nodes carrying datastores, addressed by canonical path.
//!
//! ## Structure
//!
//! Nodes live in an arena owned by [`FilesystemTree`] and are addressed by
//! [`NodeId`] handles. A parent index and per-node child lists give upward and
//! downward navigation without reference cycles, and a global
//! `canonical path → NodeId` map gives O(1) lookup during comparison and
//! removal.
//!
//! ## Canonical paths
//!
//! A canonical path identifies a node independently of which physical layout
//! produced it. The root directory is `/`; directory paths end with `/`; a
//! child's path strictly extends its parent's. Both invariants are enforced on
//! insertion.

use crate::error::{Result, SyncError};
use crate::types::{DatastoreInfo, DatastoreKind, NodeMetadata};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canonical path of the tree root
pub const ROOT_PATH: &str = "/";

/// Handle to a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(usize);

/// Kind of a filesystem node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A package / directory with children
    Directory,
    /// A leaf resource composed of datastores
    File,
}

/// One node of the filesystem tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemNode {
    /// Directory or file
    pub kind: NodeKind,
    /// Last path segment (display name or resource IRI)
    pub name: String,
    /// Abstraction-independent identifier of this node
    pub canonical_path: String,
    /// Named sub-contents of this node
    pub datastores: Vec<DatastoreInfo>,
    /// Identity and descriptive metadata
    pub metadata: NodeMetadata,
}

impl FilesystemNode {
    /// Create a directory node
    pub fn directory(
        name: impl Into<String>,
        canonical_path: impl Into<String>,
        metadata: NodeMetadata,
    ) -> Self {
        Self {
            kind: NodeKind::Directory,
            name: name.into(),
            canonical_path: canonical_path.into(),
            datastores: Vec::new(),
            metadata,
        }
    }

    /// Create a file node
    pub fn file(
        name: impl Into<String>,
        canonical_path: impl Into<String>,
        metadata: NodeMetadata,
    ) -> Self {
        Self {
            kind: NodeKind::File,
            name: name.into(),
            canonical_path: canonical_path.into(),
            datastores: Vec::new(),
            metadata,
        }
    }

    /// Whether this node is a directory
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    /// Find a datastore descriptor by kind
    pub fn datastore(&self, kind: &DatastoreKind) -> Option<&DatastoreInfo> {
        self.datastores.iter().find(|d| &d.kind == kind)
    }

    /// Whether this node carries a meta datastore
    pub fn has_meta(&self) -> bool {
        self.datastore(&DatastoreKind::Meta).is_some()
    }
}

/// Arena-owned directory tree with a global path index
#[derive(Debug, Clone)]
pub struct FilesystemTree {
    nodes: Vec<FilesystemNode>,
    parents: Vec<Option<NodeId>>,
    children: Vec<Vec<NodeId>>,
    by_path: HashMap<String, NodeId>,
    root: NodeId,
}

impl FilesystemTree {
    /// Create a tree whose root is the canonical `/` directory
    pub fn new(root_metadata: NodeMetadata) -> Self {
        let root_name = root_metadata.iri.clone();
        let root = FilesystemNode::directory(root_name, ROOT_PATH, root_metadata);
        let mut by_path = HashMap::new();
        by_path.insert(ROOT_PATH.to_string(), NodeId(0));
        Self {
            nodes: vec![root],
            parents: vec![None],
            children: vec![Vec::new()],
            by_path,
            root: NodeId(0),
        }
    }

    /// Handle of the root directory
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of reachable nodes
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    /// Whether only the root exists
    pub fn is_empty(&self) -> bool {
        self.by_path.len() <= 1
    }

    /// Insert a node under `parent`
    ///
    /// Enforces the canonical-path invariants: the parent must be a directory,
    /// the child's path must strictly extend the parent's, directory paths must
    /// end with `/`, and the path must be unused.
    pub fn insert(&mut self, parent: NodeId, node: FilesystemNode) -> Result<NodeId> {
        let parent_node = self.node(parent);
        if !parent_node.is_directory() {
            return Err(SyncError::internal(format!(
                "cannot insert under file node {}",
                parent_node.canonical_path
            )));
        }
        let parent_path = parent_node.canonical_path.clone();
        if !node.canonical_path.starts_with(&parent_path)
            || node.canonical_path.len() <= parent_path.len()
        {
            return Err(SyncError::internal(format!(
                "canonical path {} does not extend parent {}",
                node.canonical_path, parent_path
            )));
        }
        if node.is_directory() && !node.canonical_path.ends_with('/') {
            return Err(SyncError::internal(format!(
                "directory path {} missing trailing separator",
                node.canonical_path
            )));
        }
        if self.by_path.contains_key(&node.canonical_path) {
            return Err(SyncError::internal(format!(
                "duplicate canonical path {}",
                node.canonical_path
            )));
        }

        let id = NodeId(self.nodes.len());
        self.by_path.insert(node.canonical_path.clone(), id);
        self.nodes.push(node);
        self.parents.push(Some(parent));
        self.children.push(Vec::new());
        self.children[parent.0].push(id);
        Ok(id)
    }

    /// Borrow a node by handle
    pub fn node(&self, id: NodeId) -> &FilesystemNode {
        &self.nodes[id.0]
    }

    /// Mutably borrow a node by handle
    pub fn node_mut(&mut self, id: NodeId) -> &mut FilesystemNode {
        &mut self.nodes[id.0]
    }

    /// Look up a node handle by canonical path
    pub fn find(&self, canonical_path: &str) -> Option<NodeId> {
        self.by_path.get(canonical_path).copied()
    }

    /// Look up a node handle by canonical path, panicking when absent
    ///
    /// A lookup for a path missing from the global map is a programming error:
    /// it means the tree was built incorrectly upstream, not that the caller
    /// hit a recoverable condition.
    ///
    /// # Panics
    ///
    /// Panics when `canonical_path` is not present in the tree.
    pub fn expect(&self, canonical_path: &str) -> NodeId {
        match self.find(canonical_path) {
            Some(id) => id,
            None => panic!(
                "canonical path {:?} missing from tree index; tree was built incorrectly",
                canonical_path
            ),
        }
    }

    /// Parent of a node (None for the root)
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents[id.0]
    }

    /// Children of a node
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.children[id.0]
    }

    /// Remove a node and its subtree from the reachable tree
    ///
    /// Arena slots are not reclaimed; the nodes merely become unreachable and
    /// their paths are dropped from the index.
    pub fn remove(&mut self, id: NodeId) -> Result<()> {
        if id == self.root {
            return Err(SyncError::internal("cannot remove the root node"));
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            stack.extend(self.children[current.0].iter().copied());
            let path = self.nodes[current.0].canonical_path.clone();
            self.by_path.remove(&path);
        }
        if let Some(parent) = self.parents[id.0] {
            self.children[parent.0].retain(|c| *c != id);
        }
        self.parents[id.0] = None;
        Ok(())
    }

    /// All reachable canonical paths, sorted
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.by_path.keys().map(|s| s.as_str()).collect();
        paths.sort_unstable();
        paths
    }

    /// Iterate reachable nodes in canonical-path order
    pub fn iter(&self) -> impl Iterator<Item = &FilesystemNode> {
        let mut ids: Vec<NodeId> = self.by_path.values().copied().collect();
        ids.sort_unstable_by(|a, b| {
            self.nodes[a.0]
                .canonical_path
                .cmp(&self.nodes[b.0].canonical_path)
        });
        ids.into_iter().map(move |id| &self.nodes[id.0])
    }

    /// The root IRI of the package this node belongs to
    ///
    /// Walks the parent index upward to the nearest directory and returns its
    /// metadata IRI. This is the arena replacement for the live parent
    /// back-reference of the original design.
    pub fn owning_package_iri(&self, id: NodeId) -> &str {
        let mut current = id;
        loop {
            match self.parents[current.0] {
                Some(parent) => {
                    if self.nodes[parent.0].is_directory() {
                        return &self.nodes[parent.0].metadata.iri;
                    }
                    current = parent;
                }
                None => return &self.nodes[self.root.0].metadata.iri,
            }
        }
    }
}
