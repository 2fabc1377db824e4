//! Structural comparison of two filesystem abstractions
//!
//! The comparator walks the union of both trees' canonical paths and records
//! one [`DiffEntry`] per differing datastore. The `old` side of every entry is
//! `merge_to`, the `new` side `merge_from`; a datastore present only on
//! `merge_from` is `Created`, only on `merge_to` is `Removed`.
//!
//! JSON payloads are compared structurally, so formatting-only differences
//! between the database serialization and a hand-edited working-tree file do
//! not register as changes. Content hashes are computed over the canonical
//! form for the same reason.

use crate::error::Result;
use crate::filesystem::FilesystemAccess;
use crate::types::{
    ChangeKind, ComparisonResult, DataFormat, DatastoreInfo, DiffEntry, DiffTree,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// Canonical byte form of a datastore payload
///
/// JSON payloads are re-serialized from the parsed value (object keys sorted
/// by the `serde_json` map representation); payloads that fail to parse, and
/// non-JSON formats, compare byte-wise. The export layout tag is transport
/// metadata and never counts as content.
fn canonical_bytes(format: &DataFormat, bytes: Vec<u8>) -> Vec<u8> {
    if *format == DataFormat::Json {
        if let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
            if let Some(object) = value.as_object_mut() {
                object.remove(crate::archive::EXPORT_VERSION_KEY);
            }
            if let Ok(out) = serde_json::to_vec(&value) {
                return out;
            }
        }
    }
    bytes
}

/// Hex SHA-256 fingerprint of a payload's canonical form
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compare two filesystem abstractions down to datastore granularity
///
/// Returns every structural difference; `conflicts` lists all of them as
/// candidates, to be reconciled against merge history by the caller.
///
/// # Errors
///
/// Propagates content-read failures from either backend.
pub fn compare(
    merge_from: &dyn FilesystemAccess,
    merge_to: &dyn FilesystemAccess,
) -> Result<ComparisonResult> {
    let mut paths: BTreeSet<&str> = merge_from.tree().paths().into_iter().collect();
    paths.extend(merge_to.tree().paths());

    let mut result = ComparisonResult::default();
    for path in paths {
        let from_node = merge_from.tree().find(path).map(|id| merge_from.tree().node(id));
        let to_node = merge_to.tree().find(path).map(|id| merge_to.tree().node(id));

        match (from_node, to_node) {
            (Some(from), None) => {
                for info in &from.datastores {
                    let content = merge_from.datastore_content(path, &info.kind)?;
                    let hash = content_hash(&canonical_bytes(&info.format, content));
                    record(&mut result, path, info.clone(), ChangeKind::Created, None, Some(hash));
                }
            }
            (None, Some(to)) => {
                for info in &to.datastores {
                    let content = merge_to.datastore_content(path, &info.kind)?;
                    let hash = content_hash(&canonical_bytes(&info.format, content));
                    record(&mut result, path, info.clone(), ChangeKind::Removed, Some(hash), None);
                }
            }
            (Some(from), Some(to)) => {
                for info in &from.datastores {
                    match to.datastore(&info.kind) {
                        None => {
                            let content = merge_from.datastore_content(path, &info.kind)?;
                            let hash = content_hash(&canonical_bytes(&info.format, content));
                            record(
                                &mut result,
                                path,
                                info.clone(),
                                ChangeKind::Created,
                                None,
                                Some(hash),
                            );
                        }
                        Some(to_info) => {
                            let new_bytes = canonical_bytes(
                                &info.format,
                                merge_from.datastore_content(path, &info.kind)?,
                            );
                            let old_bytes = canonical_bytes(
                                &to_info.format,
                                merge_to.datastore_content(path, &info.kind)?,
                            );
                            if new_bytes != old_bytes {
                                record(
                                    &mut result,
                                    path,
                                    info.clone(),
                                    ChangeKind::Changed,
                                    Some(content_hash(&old_bytes)),
                                    Some(content_hash(&new_bytes)),
                                );
                            }
                        }
                    }
                }
                for info in &to.datastores {
                    if from.datastore(&info.kind).is_none() {
                        let content = merge_to.datastore_content(path, &info.kind)?;
                        let hash = content_hash(&canonical_bytes(&info.format, content));
                        record(
                            &mut result,
                            path,
                            info.clone(),
                            ChangeKind::Removed,
                            Some(hash),
                            None,
                        );
                    }
                }
            }
            (None, None) => unreachable!("path came from one of the two trees"),
        }
    }

    debug!(
        created = result.created.len(),
        removed = result.removed.len(),
        changed = result.changed.len(),
        "comparison finished"
    );
    Ok(result)
}

fn record(
    result: &mut ComparisonResult,
    path: &str,
    datastore: DatastoreInfo,
    change: ChangeKind,
    old_hash: Option<String>,
    new_hash: Option<String>,
) {
    trace!(path, kind = %datastore.kind, ?change, "difference");
    let entry = DiffEntry {
        canonical_path: path.to_string(),
        datastore,
        change,
        old_hash,
        new_hash,
    };
    result.conflicts.push(entry.key());
    match change {
        ChangeKind::Created => result.created.push(entry.clone()),
        ChangeKind::Removed => result.removed.push(entry.clone()),
        ChangeKind::Changed => result.changed.push(entry.clone()),
    }
    result.diff_tree.insert(entry);
}

/// Diff-of-diffs helper: entries of `next` whose key is absent from `previous`
pub fn new_entries<'a>(next: &'a DiffTree, previous: &DiffTree) -> Vec<&'a DiffEntry> {
    next.entries
        .iter()
        .filter(|e| previous.get(&e.key()).is_none())
        .collect()
}
