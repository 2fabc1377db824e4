//! Archive codec: tree import and export
//!
//! Exports flatten a materialized tree into named entries — one file per
//! datastore, one `.meta.json` per directory — written either into a zip
//! archive or straight onto disk (which is how the orchestrator materializes
//! the database tree into a clone). The root `.meta.json` carries the layout
//! tag under `_exportVersion`.
//!
//! Two layouts exist: [`ExportVersion::Flat`] uses canonical paths verbatim;
//! [`ExportVersion::Bucketed`] inserts a resource-type bucket directory above
//! each leaf resource. Import strips bucket segments, so both layouts decode
//! into the same canonical structure.

use crate::error::{Result, SyncError};
use crate::filesystem::{split_datastore_name, strip_artificial_segments, FilesystemAccess};
use crate::store::ResourceStore;
use crate::tree::FilesystemNode;
use crate::types::{DatastoreKind, ExportVersion, NodeMetadata};
use crate::workdir::parse_meta;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// Entry name of a directory's metadata file
const META_FILE: &str = ".meta.json";
/// Key carrying the layout tag in the root metadata
pub(crate) const EXPORT_VERSION_KEY: &str = "_exportVersion";

/// Knobs for [`import_zip`]
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Mint fresh IRIs for every imported node instead of keeping the
    /// archived ones (importing a second copy next to the original)
    pub mint_fresh_iris: bool,
}

/// Bucket directory a leaf resource belongs to under the bucketed layout
fn bucket_for(node: &FilesystemNode) -> Option<&'static str> {
    for tag in &node.metadata.type_tags {
        let tag = tag.to_ascii_lowercase();
        if tag.contains("profile") {
            return Some("application-profiles");
        }
        if tag.contains("visual") {
            return Some("visual-models");
        }
        if tag.contains("model") || tag.contains("semantic") {
            return Some("semantic-models");
        }
    }
    if node.datastore(&DatastoreKind::Model).is_some() {
        return Some("semantic-models");
    }
    if node.datastore(&DatastoreKind::Visual).is_some() {
        return Some("visual-models");
    }
    None
}

/// Flatten a tree into `(entry name, content)` pairs
///
/// Entries come out in canonical-path order, directories before their
/// children.
pub fn entries(
    fs: &dyn FilesystemAccess,
    version: ExportVersion,
) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    for node in fs.tree().iter() {
        let path = node.canonical_path.as_str();
        if node.is_directory() {
            let mut meta: Value = serde_json::from_slice(&meta_content(fs, node)?)?;
            if path == "/" {
                if let Some(object) = meta.as_object_mut() {
                    object.insert(
                        EXPORT_VERSION_KEY.to_string(),
                        Value::from(version.as_number()),
                    );
                }
            }
            let name = format!("{}{}", path.trim_start_matches('/'), META_FILE);
            out.push((name, serde_json::to_vec_pretty(&meta)?));
            continue;
        }

        let split = path.rfind('/').map(|i| i + 1).unwrap_or(0);
        let parent = path[..split].trim_start_matches('/');
        let bucket = match version {
            ExportVersion::Flat => None,
            ExportVersion::Bucketed => bucket_for(node),
        };
        for info in &node.datastores {
            let file_name = info.file_name(&node.name);
            let name = match bucket {
                Some(bucket) => format!("{}{}/{}", parent, bucket, file_name),
                None => format!("{}{}", parent, file_name),
            };
            out.push((name, fs.datastore_content(path, &info.kind)?));
        }
    }
    Ok(out)
}

fn meta_content(fs: &dyn FilesystemAccess, node: &FilesystemNode) -> Result<Vec<u8>> {
    if node.has_meta() {
        fs.datastore_content(&node.canonical_path, &DatastoreKind::Meta)
    } else {
        Ok(serde_json::to_vec_pretty(&node.metadata)?)
    }
}

/// Write a tree into a zip archive
pub fn export_zip<W: Write + Seek>(
    fs: &dyn FilesystemAccess,
    writer: W,
    version: ExportVersion,
) -> Result<()> {
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default();
    let entries = entries(fs, version)?;
    debug!(entries = entries.len(), ?version, "writing archive");
    for (name, content) in entries {
        zip.start_file(name, options)?;
        zip.write_all(&content)?;
    }
    zip.finish()?;
    Ok(())
}

/// Materialize a tree as plain files under `dir`
///
/// Used by the orchestrator to write the database tree into a clone's working
/// directory before committing.
pub fn export_dir(
    fs: &dyn FilesystemAccess,
    dir: &Path,
    version: ExportVersion,
) -> Result<()> {
    for (name, content) in entries(fs, version)? {
        let target = dir.join(&name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, content)?;
    }
    Ok(())
}

/// Decode a zip archive into the resource store
///
/// Creates the archived root package under `parent_iri` (or as a top-level
/// package) and returns the root's IRI. Bucket segments are stripped; foreign
/// entries and non-JSON payloads stay on the repository side and are skipped
/// with a warning.
///
/// # Errors
///
/// Returns [`SyncError::InvalidArchive`] when the root `.meta.json` is
/// missing or carries an unknown layout tag, and
/// [`SyncError::MissingMetaDatastore`] when a resource's payload arrives
/// before (or without) its metadata entry.
pub fn import_zip<R: Read + Seek>(
    reader: R,
    store: &Arc<dyn ResourceStore>,
    parent_iri: Option<&str>,
    options: &ImportOptions,
) -> Result<String> {
    let mut archive = ZipArchive::new(reader)?;
    let mut raw: Vec<(String, Vec<u8>)> = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let mut content = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut content)?;
        raw.push((name, content));
    }
    // lexicographic order puts every metadata entry before the payloads and
    // children it governs
    raw.sort_by(|a, b| a.0.cmp(&b.0));

    let root = raw
        .first()
        .filter(|(name, _)| name == META_FILE)
        .ok_or_else(|| SyncError::InvalidArchive("missing root metadata entry".to_string()))?;
    let root_value: Value = serde_json::from_slice(&root.1)?;
    let version = match root_value.get(EXPORT_VERSION_KEY).and_then(Value::as_u64) {
        Some(n) => ExportVersion::from_number(n)
            .ok_or_else(|| SyncError::InvalidArchive(format!("unknown layout tag {}", n)))?,
        None => ExportVersion::Flat,
    };
    debug!(entries = raw.len(), ?version, "importing archive");

    let mut dir_iris: HashMap<String, String> = HashMap::new();
    let mut resource_iris: HashMap<String, String> = HashMap::new();
    let mut root_iri = String::new();

    for (name, content) in &raw {
        if name == META_FILE {
            let metadata = imported_metadata(content, options);
            root_iri = metadata.iri.clone();
            store.create_package(parent_iri, metadata)?;
            dir_iris.insert("/".to_string(), root_iri.clone());
            continue;
        }

        let canonical = match version {
            ExportVersion::Flat => format!("/{}", name),
            ExportVersion::Bucketed => strip_artificial_segments(&format!("/{}", name)),
        };
        let split = canonical
            .rfind('/')
            .ok_or_else(|| SyncError::InvalidArchivePath(name.clone()))?;
        let (dir, file_name) = (&canonical[..split + 1], &canonical[split + 1..]);
        let (prefix, kind, format) = split_datastore_name(file_name);

        if kind == DatastoreKind::Meta && prefix.is_empty() {
            // directory metadata
            let parent_dir = parent_of(dir).ok_or_else(|| {
                SyncError::InvalidArchivePath(name.clone())
            })?;
            let owner = dir_iris
                .get(parent_dir)
                .ok_or_else(|| SyncError::InvalidArchivePath(name.clone()))?
                .clone();
            let metadata = imported_metadata(content, options);
            let iri = metadata.iri.clone();
            store.create_package(Some(&owner), metadata)?;
            dir_iris.insert(dir.to_string(), iri);
            continue;
        }

        if kind == DatastoreKind::Foreign {
            warn!(entry = %name, "skipping foreign archive entry");
            continue;
        }

        let resource_path = format!("{}{}", dir, prefix);
        if kind == DatastoreKind::Meta {
            let owner = dir_iris
                .get(dir)
                .ok_or_else(|| SyncError::InvalidArchivePath(name.clone()))?
                .clone();
            let metadata = imported_metadata(content, options);
            let iri = metadata.iri.clone();
            store.create_resource(&owner, metadata)?;
            resource_iris.insert(resource_path, iri);
            continue;
        }

        let iri = resource_iris
            .get(&resource_path)
            .ok_or_else(|| SyncError::MissingMetaDatastore(resource_path.clone()))?;
        if format != crate::types::DataFormat::Json {
            warn!(entry = %name, "skipping non-JSON archive entry");
            continue;
        }
        let value: Value = serde_json::from_slice(content)?;
        store.set_datastore_json(iri, kind.as_str(), value)?;
    }

    Ok(root_iri)
}

fn imported_metadata(content: &[u8], options: &ImportOptions) -> NodeMetadata {
    let mut metadata = parse_meta(content, "");
    if options.mint_fresh_iris || metadata.iri.is_empty() {
        metadata.iri = format!("urn:uuid:{}", Uuid::new_v4());
    }
    metadata
}

/// Canonical path of a directory's parent directory
fn parent_of(dir: &str) -> Option<&str> {
    let trimmed = dir.strip_suffix('/')?;
    trimmed.rfind('/').map(|i| &dir[..i + 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::compare;
    use crate::store::{DatabaseFilesystem, MemoryResourceStore};
    use serde_json::json;
    use std::io::Cursor;

    fn seeded_store() -> Arc<MemoryResourceStore> {
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
                NodeMetadata::new("urn:m1")
                    .with_type_tags(vec!["SemanticModel".to_string()]),
            )
            .unwrap();
        store
            .set_datastore_json("urn:m1", "model", json!({"a": 1}))
            .unwrap();
        store
            .create_resource(
                "urn:pkg",
                NodeMetadata::new("urn:v1").with_type_tags(vec!["VisualModel".to_string()]),
            )
            .unwrap();
        store
            .set_datastore_json("urn:v1", "visual", json!({"x": 0}))
            .unwrap();
        store
    }

    #[test]
    fn test_flat_entry_names() {
        let fs = DatabaseFilesystem::build(seeded_store(), "urn:root").unwrap();
        let entries = entries(&fs, ExportVersion::Flat).unwrap();
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&".meta.json"));
        assert!(names.contains(&"urn:pkg/.meta.json"));
        assert!(names.contains(&"urn:pkg/urn:m1.model.json"));
        assert!(names.contains(&"urn:pkg/urn:m1.meta.json"));
    }

    #[test]
    fn test_bucketed_entry_names() {
        let fs = DatabaseFilesystem::build(seeded_store(), "urn:root").unwrap();
        let entries = entries(&fs, ExportVersion::Bucketed).unwrap();
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"urn:pkg/semantic-models/urn:m1.model.json"));
        assert!(names.contains(&"urn:pkg/visual-models/urn:v1.visual.json"));
        // directories stay unbucketed
        assert!(names.contains(&"urn:pkg/.meta.json"));
    }

    #[test]
    fn test_root_meta_carries_version_tag() {
        let fs = DatabaseFilesystem::build(seeded_store(), "urn:root").unwrap();
        let entries = entries(&fs, ExportVersion::Bucketed).unwrap();
        let (_, root) = entries.iter().find(|(n, _)| n == ".meta.json").unwrap();
        let value: Value = serde_json::from_slice(root).unwrap();
        assert_eq!(value[EXPORT_VERSION_KEY], json!(2));
    }

    #[test]
    fn test_bucketed_roundtrip_preserves_structure() {
        let source = DatabaseFilesystem::build(seeded_store(), "urn:root").unwrap();
        let mut buffer = Cursor::new(Vec::new());
        export_zip(&source, &mut buffer, ExportVersion::Bucketed).unwrap();
        buffer.set_position(0);

        let target: Arc<dyn ResourceStore> = Arc::new(MemoryResourceStore::new());
        let root_iri =
            import_zip(buffer, &target, None, &ImportOptions::default()).unwrap();
        assert_eq!(root_iri, "urn:root");

        let imported = DatabaseFilesystem::build(target, "urn:root").unwrap();
        let result = compare(&source, &imported).unwrap();
        assert!(result.is_identical(), "differences: {:?}", result.diff_tree);
    }

    #[test]
    fn test_import_mints_fresh_iris() {
        let source = DatabaseFilesystem::build(seeded_store(), "urn:root").unwrap();
        let mut buffer = Cursor::new(Vec::new());
        export_zip(&source, &mut buffer, ExportVersion::Flat).unwrap();
        buffer.set_position(0);

        let target: Arc<dyn ResourceStore> = Arc::new(MemoryResourceStore::new());
        let root_iri = import_zip(
            buffer,
            &target,
            None,
            &ImportOptions { mint_fresh_iris: true },
        )
        .unwrap();
        assert!(root_iri.starts_with("urn:uuid:"));
        assert!(target.resource("urn:m1").unwrap().is_none());
    }

    #[test]
    fn test_import_rejects_missing_root_meta() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buffer);
            zip.start_file("orphan.model.json", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"{}").unwrap();
            zip.finish().unwrap();
        }
        buffer.set_position(0);
        let target: Arc<dyn ResourceStore> = Arc::new(MemoryResourceStore::new());
        let err = import_zip(buffer, &target, None, &ImportOptions::default()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidArchive(_)));
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/a/b/"), Some("/a/"));
        assert_eq!(parent_of("/a/"), Some("/"));
        assert_eq!(parent_of("/"), None);
    }
}
