//! Repository-clone-backed filesystem
//!
//! [`WorkdirFilesystem`] materializes a checked-out working tree into the
//! canonical tree model. Physical files named `prefix.kind.format` are grouped
//! by prefix into one file node with multiple datastores; a directory's own
//! `.meta.json` attaches to the directory node; files outside the naming
//! scheme become single-datastore foreign nodes. Artificial bucket directories
//! are traversed but elided from canonical paths, so both export layouts
//! materialize into the same tree.

use crate::error::{Result, SyncError};
use crate::filesystem::{
    is_artificial_directory, join_canonical, split_datastore_name, FilesystemAccess,
};
use crate::tree::{FilesystemNode, FilesystemTree};
use crate::types::{DataFormat, DatastoreInfo, DatastoreKind, FilesystemKind, NodeMetadata};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Parse a meta datastore payload into node metadata
///
/// Falls back to extracting the `iri` field alone (or the supplied default)
/// when the payload does not carry the full metadata record.
pub(crate) fn parse_meta(bytes: &[u8], fallback_iri: &str) -> NodeMetadata {
    if let Ok(meta) = serde_json::from_slice::<NodeMetadata>(bytes) {
        return meta;
    }
    let iri = serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("iri").and_then(|i| i.as_str()).map(String::from))
        .unwrap_or_else(|| fallback_iri.to_string());
    NodeMetadata::new(iri)
}

/// Filesystem abstraction over a cloned working tree
pub struct WorkdirFilesystem {
    tree: FilesystemTree,
    /// Physical directory holding each node's files, by canonical path
    physical_dirs: HashMap<String, PathBuf>,
}

impl WorkdirFilesystem {
    /// Materialize a working tree rooted at `root`
    ///
    /// `excluded_dirs` names directories skipped entirely (provider-specific
    /// directories); `.git` is always skipped.
    ///
    /// # Errors
    ///
    /// Propagates traversal and read errors from the underlying filesystem.
    pub fn build(root: impl AsRef<Path>, excluded_dirs: &[String]) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        debug!(root = %root.display(), "materializing working tree");

        let mut tree = FilesystemTree::new(NodeMetadata::new(""));
        let mut physical_dirs = HashMap::new();
        physical_dirs.insert("/".to_string(), root.clone());

        // canonical path of every traversed physical directory; artificial
        // bucket directories map to their parent's canonical path
        let mut dir_canonical: HashMap<PathBuf, String> = HashMap::new();
        dir_canonical.insert(root.clone(), "/".to_string());

        let walker = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| {
                if !e.file_type().is_dir() || e.depth() == 0 {
                    return true;
                }
                match e.file_name().to_str() {
                    Some(name) => name != ".git" && !excluded_dirs.iter().any(|d| d == name),
                    None => false,
                }
            });

        for entry in walker {
            let entry = entry?;
            if entry.depth() == 0 {
                continue;
            }
            let parent_physical = entry
                .path()
                .parent()
                .ok_or_else(|| SyncError::PathConversion(entry.path().to_path_buf()))?;
            let parent_canonical = dir_canonical
                .get(parent_physical)
                .cloned()
                .ok_or_else(|| SyncError::internal("directory visited before its parent"))?;
            let name = entry
                .file_name()
                .to_str()
                .ok_or_else(|| SyncError::PathConversion(entry.path().to_path_buf()))?
                .to_string();

            if entry.file_type().is_dir() {
                if is_artificial_directory(&name) {
                    trace!(dir = %name, "eliding bucket directory");
                    dir_canonical.insert(entry.path().to_path_buf(), parent_canonical);
                    continue;
                }
                let canonical = join_canonical(&parent_canonical, &name, true);
                let parent_id = tree.expect(&parent_canonical);
                tree.insert(
                    parent_id,
                    FilesystemNode::directory(&name, &canonical, NodeMetadata::new(&name)),
                )?;
                physical_dirs.insert(canonical.clone(), entry.path().to_path_buf());
                dir_canonical.insert(entry.path().to_path_buf(), canonical);
                continue;
            }

            let (prefix, kind, format) = split_datastore_name(&name);
            let dir_id = tree.expect(&parent_canonical);

            if kind == DatastoreKind::Meta && prefix.is_empty() {
                // .meta.json describes the enclosing directory
                let content = fs::read(entry.path())?;
                let node = tree.node_mut(dir_id);
                node.metadata = parse_meta(&content, &node.name.clone());
                node.datastores
                    .push(DatastoreInfo::new(DatastoreKind::Meta, format, ""));
                continue;
            }

            if kind == DatastoreKind::Foreign {
                let canonical = join_canonical(&parent_canonical, &name, false);
                let mut node =
                    FilesystemNode::file(&name, &canonical, NodeMetadata::new(&name));
                node.datastores.push(DatastoreInfo {
                    kind: DatastoreKind::Foreign,
                    format,
                    full_name: name.clone(),
                });
                tree.insert(dir_id, node)?;
                physical_dirs.insert(canonical, parent_physical.to_path_buf());
                continue;
            }

            let canonical = join_canonical(&parent_canonical, &prefix, false);
            let id = match tree.find(&canonical) {
                Some(id) => id,
                None => {
                    let node =
                        FilesystemNode::file(&prefix, &canonical, NodeMetadata::new(&prefix));
                    let id = tree.insert(dir_id, node)?;
                    physical_dirs.insert(canonical.clone(), parent_physical.to_path_buf());
                    id
                }
            };
            if kind == DatastoreKind::Meta {
                let content = fs::read(entry.path())?;
                tree.node_mut(id).metadata = parse_meta(&content, &prefix);
            }
            tree.node_mut(id).datastores.push(DatastoreInfo {
                kind,
                format,
                full_name: name,
            });
        }

        debug!(nodes = tree.len(), "working tree materialized");
        Ok(Self { tree, physical_dirs })
    }

    fn physical_dir(&self, canonical_path: &str) -> &PathBuf {
        match self.physical_dirs.get(canonical_path) {
            Some(dir) => dir,
            None => panic!(
                "canonical path {:?} has no physical location; tree was built incorrectly",
                canonical_path
            ),
        }
    }

    fn datastore_path(&self, canonical_path: &str, kind: &DatastoreKind) -> Result<PathBuf> {
        let node = self.tree.node(self.tree.expect(canonical_path));
        let info = node
            .datastore(kind)
            .ok_or_else(|| SyncError::DatastoreNotFound {
                canonical_path: canonical_path.to_string(),
                kind: kind.to_string(),
            })?;
        Ok(self.physical_dir(canonical_path).join(&info.full_name))
    }
}

impl FilesystemAccess for WorkdirFilesystem {
    fn kind(&self) -> FilesystemKind {
        FilesystemKind::RepositoryClone
    }

    fn tree(&self) -> &FilesystemTree {
        &self.tree
    }

    fn datastore_content(&self, canonical_path: &str, kind: &DatastoreKind) -> Result<Vec<u8>> {
        let path = self.datastore_path(canonical_path, kind)?;
        Ok(fs::read(path)?)
    }

    fn create_datastore(
        &mut self,
        canonical_path: &str,
        kind: &DatastoreKind,
        format: &DataFormat,
        content: &[u8],
    ) -> Result<()> {
        let id = match self.tree.find(canonical_path) {
            Some(id) => id,
            None => {
                // materialize the node under its (existing) parent
                let is_dir = canonical_path.ends_with('/');
                let trimmed = canonical_path.trim_end_matches('/');
                let split = trimmed
                    .rfind('/')
                    .ok_or_else(|| SyncError::internal("canonical path missing parent"))?;
                let (parent, name) = (&canonical_path[..split + 1], &trimmed[split + 1..]);
                let parent_id = self.tree.expect(parent);
                let physical = self.physical_dir(parent).join(name);
                let node = if is_dir {
                    fs::create_dir_all(&physical)?;
                    FilesystemNode::directory(name, canonical_path, NodeMetadata::new(name))
                } else {
                    FilesystemNode::file(name, canonical_path, NodeMetadata::new(name))
                };
                let dir = if is_dir {
                    physical
                } else {
                    self.physical_dir(parent).clone()
                };
                let id = self.tree.insert(parent_id, node)?;
                self.physical_dirs.insert(canonical_path.to_string(), dir);
                id
            }
        };
        let node = self.tree.node(id);
        let prefix = if node.is_directory() { "" } else { node.name.as_str() };
        let info = DatastoreInfo::new(kind.clone(), format.clone(), prefix);
        let path = self.physical_dir(canonical_path).join(&info.full_name);
        fs::write(path, content)?;
        if self.tree.node(id).datastore(kind).is_none() {
            self.tree.node_mut(id).datastores.push(info);
        }
        Ok(())
    }

    fn update_datastore(
        &mut self,
        canonical_path: &str,
        kind: &DatastoreKind,
        content: &[u8],
    ) -> Result<()> {
        let path = self.datastore_path(canonical_path, kind)?;
        fs::write(path, content)?;
        Ok(())
    }

    fn remove_datastore(&mut self, canonical_path: &str, kind: &DatastoreKind) -> Result<()> {
        let path = self.datastore_path(canonical_path, kind)?;
        fs::remove_file(path)?;
        let id = self.tree.expect(canonical_path);
        self.tree.node_mut(id).datastores.retain(|d| &d.kind != kind);
        Ok(())
    }

    fn remove_file(&mut self, canonical_path: &str) -> Result<()> {
        let id = self.tree.expect(canonical_path);
        if self.tree.node(id).is_directory() {
            fs::remove_dir_all(self.physical_dir(canonical_path))?;
        } else {
            let dir = self.physical_dir(canonical_path).clone();
            for info in &self.tree.node(id).datastores {
                let path = dir.join(&info.full_name);
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
        }
        self.tree.remove(id)?;
        self.physical_dirs.remove(canonical_path);
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta_json(iri: &str) -> Vec<u8> {
        serde_json::to_vec(&NodeMetadata::new(iri)).unwrap()
    }

    fn scaffold() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join(".meta.json"), meta_json("urn:root")).unwrap();
        fs::create_dir(root.join("urn:pkg")).unwrap();
        fs::write(root.join("urn:pkg/.meta.json"), meta_json("urn:pkg")).unwrap();
        fs::write(root.join("urn:pkg/urn:m1.meta.json"), meta_json("urn:m1")).unwrap();
        fs::write(root.join("urn:pkg/urn:m1.model.json"), b"{\"a\":1}").unwrap();
        fs::write(root.join("urn:pkg/NOTES.txt"), b"hello").unwrap();
        fs::create_dir(root.join(".git")).unwrap();
        fs::write(root.join(".git/config"), b"[core]").unwrap();
        dir
    }

    #[test]
    fn test_build_groups_datastores_by_prefix() {
        let dir = scaffold();
        let fs = WorkdirFilesystem::build(dir.path(), &[]).unwrap();
        let tree = fs.tree();

        let m1 = tree.node(tree.expect("/urn:pkg/urn:m1"));
        assert_eq!(m1.datastores.len(), 2);
        assert!(m1.has_meta());
        assert_eq!(m1.metadata.iri, "urn:m1");

        // .git never materializes
        assert!(tree.find("/.git/").is_none());
    }

    #[test]
    fn test_directory_meta_attaches_to_directory() {
        let dir = scaffold();
        let fs = WorkdirFilesystem::build(dir.path(), &[]).unwrap();
        let pkg = fs.tree().node(fs.tree().expect("/urn:pkg/"));
        assert!(pkg.has_meta());
        assert_eq!(pkg.metadata.iri, "urn:pkg");
        assert_eq!(fs.tree().node(fs.tree().root()).metadata.iri, "urn:root");
    }

    #[test]
    fn test_foreign_file_survives() {
        let dir = scaffold();
        let fs = WorkdirFilesystem::build(dir.path(), &[]).unwrap();
        let node = fs.tree().node(fs.tree().expect("/urn:pkg/NOTES.txt"));
        assert_eq!(node.datastores.len(), 1);
        assert_eq!(node.datastores[0].kind, DatastoreKind::Foreign);
        assert_eq!(
            fs.datastore_content("/urn:pkg/NOTES.txt", &DatastoreKind::Foreign)
                .unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_artificial_directories_elided() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join(".meta.json"), meta_json("urn:root")).unwrap();
        fs::create_dir_all(root.join("semantic-models")).unwrap();
        fs::write(
            root.join("semantic-models/urn:m1.meta.json"),
            meta_json("urn:m1"),
        )
        .unwrap();
        fs::write(root.join("semantic-models/urn:m1.model.json"), b"{}").unwrap();

        let fs = WorkdirFilesystem::build(root, &[]).unwrap();
        assert!(fs.tree().find("/semantic-models/").is_none());
        assert!(fs.tree().find("/urn:m1").is_some());
    }

    #[test]
    fn test_write_and_remove_roundtrip() {
        let dir = scaffold();
        let mut fs = WorkdirFilesystem::build(dir.path(), &[]).unwrap();

        fs.update_datastore("/urn:pkg/urn:m1", &DatastoreKind::Model, b"{\"a\":2}")
            .unwrap();
        assert_eq!(
            fs.datastore_content("/urn:pkg/urn:m1", &DatastoreKind::Model)
                .unwrap(),
            b"{\"a\":2}"
        );

        fs.create_datastore(
            "/urn:pkg/urn:m2",
            &DatastoreKind::Meta,
            &DataFormat::Json,
            &meta_json("urn:m2"),
        )
        .unwrap();
        assert!(dir.path().join("urn:pkg/urn:m2.meta.json").exists());

        fs.remove_file("/urn:pkg/urn:m1").unwrap();
        assert!(!dir.path().join("urn:pkg/urn:m1.model.json").exists());
        assert!(fs.tree().find("/urn:pkg/urn:m1").is_none());
    }

    #[test]
    fn test_excluded_directories_skipped() {
        let dir = scaffold();
        fs::create_dir(dir.path().join(".github")).unwrap();
        fs::write(dir.path().join(".github/workflow.yml"), b"x").unwrap();
        let fs =
            WorkdirFilesystem::build(dir.path(), &[".github".to_string()]).unwrap();
        assert!(fs.tree().find("/.github/").is_none());
    }
}
