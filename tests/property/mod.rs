//! Property-based tests for the comparator
//!
//! Generates arbitrary pairs of resource trees and checks invariants that
//! must hold for every input: swapping the comparison direction turns created
//! entries into removed ones and vice versa, a tree compared with itself is
//! identical, and created entries correspond exactly to the resources absent
//! from the target side.

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use treesync::*;

fn filesystem_from(resources: &BTreeMap<String, i64>) -> DatabaseFilesystem {
    let store = Arc::new(MemoryResourceStore::new());
    store
        .create_package(None, NodeMetadata::new("urn:root"))
        .unwrap();
    for (name, value) in resources {
        let iri = format!("urn:{name}");
        store
            .create_resource("urn:root", NodeMetadata::new(&iri))
            .unwrap();
        store
            .set_datastore_json(&iri, "model", serde_json::json!({"value": value}))
            .unwrap();
    }
    DatabaseFilesystem::build(store, "urn:root").unwrap()
}

fn sorted_keys(entries: &[DiffEntry]) -> Vec<DiffKey> {
    let mut keys: Vec<DiffKey> = entries.iter().map(DiffEntry::key).collect();
    keys.sort_by(|a, b| {
        a.canonical_path
            .cmp(&b.canonical_path)
            .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
    });
    keys
}

fn resources_strategy() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..8)
}

proptest! {
    #[test]
    fn prop_comparison_direction_symmetry(
        a in resources_strategy(),
        b in resources_strategy(),
    ) {
        let fs_a = filesystem_from(&a);
        let fs_b = filesystem_from(&b);
        let forward = compare(&fs_a, &fs_b).unwrap();
        let backward = compare(&fs_b, &fs_a).unwrap();

        prop_assert_eq!(sorted_keys(&forward.created), sorted_keys(&backward.removed));
        prop_assert_eq!(sorted_keys(&forward.removed), sorted_keys(&backward.created));
        prop_assert_eq!(sorted_keys(&forward.changed), sorted_keys(&backward.changed));
        prop_assert_eq!(forward.conflicts.len(), backward.conflicts.len());
    }

    #[test]
    fn prop_comparison_with_self_is_identical(a in resources_strategy()) {
        let fs = filesystem_from(&a);
        let result = compare(&fs, &fs).unwrap();
        prop_assert!(result.is_identical());
        prop_assert!(result.conflicts.is_empty());
    }

    #[test]
    fn prop_created_entries_match_resources_absent_from_target(
        a in resources_strategy(),
        b in resources_strategy(),
    ) {
        let forward = compare(&filesystem_from(&a), &filesystem_from(&b)).unwrap();
        let created_paths: BTreeSet<String> = forward
            .created
            .iter()
            .map(|e| e.canonical_path.clone())
            .collect();
        let expected: BTreeSet<String> = a
            .keys()
            .filter(|k| !b.contains_key(*k))
            .map(|k| format!("/urn:{k}"))
            .collect();
        prop_assert_eq!(created_paths, expected);
    }
}
