//! Main test module for treesync
//!
//! This module includes all test suites:
//! - Integration tests driving the orchestrator against local repositories
//! - Property-based tests for comparator invariants

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use std::sync::Arc;
    use treesync::*;

    #[test]
    fn test_empty_root_exports_single_entry() {
        let store = Arc::new(MemoryResourceStore::new());
        store
            .create_package(None, NodeMetadata::new("urn:empty"))
            .unwrap();
        let fs = DatabaseFilesystem::build(store, "urn:empty").unwrap();
        let mut buffer = std::io::Cursor::new(Vec::new());
        export_zip(&fs, &mut buffer, ExportVersion::Flat).unwrap();
        buffer.set_position(0);

        let target: Arc<dyn ResourceStore> = Arc::new(MemoryResourceStore::new());
        let root = import_zip(buffer, &target, None, &ImportOptions::default()).unwrap();
        assert_eq!(root, "urn:empty");
        assert!(target.list_children("urn:empty").unwrap().is_empty());
    }

    #[test]
    fn test_identical_empty_trees_compare_clean() {
        let store = Arc::new(MemoryResourceStore::new());
        store
            .create_package(None, NodeMetadata::new("urn:a"))
            .unwrap();
        let a = DatabaseFilesystem::build(store.clone(), "urn:a").unwrap();
        let b = DatabaseFilesystem::build(store, "urn:a").unwrap();
        let result = compare(&a, &b).unwrap();
        assert!(result.is_identical());
    }

    #[test]
    fn test_iri_with_dots_survives_roundtrip() {
        let store = Arc::new(MemoryResourceStore::new());
        store
            .create_package(None, NodeMetadata::new("urn:root"))
            .unwrap();
        store
            .create_resource("urn:root", NodeMetadata::new("com.example.v2.0"))
            .unwrap();
        store
            .set_datastore_json("com.example.v2.0", "model", serde_json::json!({"x": 1}))
            .unwrap();

        let fs = DatabaseFilesystem::build(store, "urn:root").unwrap();
        let mut buffer = std::io::Cursor::new(Vec::new());
        export_zip(&fs, &mut buffer, ExportVersion::Flat).unwrap();
        buffer.set_position(0);

        let target: Arc<dyn ResourceStore> = Arc::new(MemoryResourceStore::new());
        import_zip(buffer, &target, None, &ImportOptions::default()).unwrap();
        assert!(target.resource("com.example.v2.0").unwrap().is_some());
        assert_eq!(
            target.datastore_names("com.example.v2.0").unwrap(),
            vec!["model"]
        );
    }
}
