//! Store fixtures and registry helpers.

use itemdb_core::{
    AttributeDescriptor, AttributeKind, DeletionPolicy, SchemaRegistry, Store, TypeBuilder, Value,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: Store,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a new in-memory test store.
    pub fn memory(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            store: Store::open_in_memory(registry).expect("Failed to open in-memory store"),
            _temp_dir: None,
        }
    }

    /// Creates a new file-backed test store.
    pub fn file(registry: Arc<SchemaRegistry>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Store::open(&temp_dir.path().join("store"), registry)
            .expect("Failed to open file store");
        Self {
            store,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the store path if file-backed, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("store"))
    }
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test with a temporary in-memory store.
pub fn with_test_store<F, R>(registry: Arc<SchemaRegistry>, f: F) -> R
where
    F: FnOnce(&Store) -> R,
{
    let test_store = TestStore::memory(registry);
    f(&test_store.store)
}

/// Runs a test with a temporary file-backed store.
pub fn with_file_store<F, R>(registry: Arc<SchemaRegistry>, f: F) -> R
where
    F: FnOnce(&Store, &std::path::Path) -> R,
{
    let test_store = TestStore::file(registry);
    let path = test_store.path().expect("file store has a path");
    f(&test_store.store, &path)
}

/// A registry with one sample type covering every attribute kind.
///
/// The type is `testkit.widget` v1; every attribute except `label` is
/// nullable so items can be created attribute by attribute.
pub fn sample_registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new("testkit.widget", 1)
                .module("itemdb_testkit::fixtures")
                .attribute(AttributeDescriptor::new("label", AttributeKind::text()).indexed())
                .attribute(
                    AttributeDescriptor::new("count", AttributeKind::Integer)
                        .default_value(Value::Integer(0)),
                )
                .attribute(AttributeDescriptor::new("ratio", AttributeKind::Float).allow_none())
                .attribute(
                    AttributeDescriptor::new("price", AttributeKind::decimal(4)).allow_none(),
                )
                .attribute(
                    AttributeDescriptor::new("active", AttributeKind::Boolean)
                        .default_value(Value::Boolean(true)),
                )
                .attribute(
                    AttributeDescriptor::new("nickname", AttributeKind::text_case_insensitive())
                        .allow_none(),
                )
                .attribute(AttributeDescriptor::new("payload", AttributeKind::Bytes).allow_none())
                .attribute(
                    AttributeDescriptor::new("created_at", AttributeKind::Timestamp).allow_none(),
                )
                .attribute(AttributeDescriptor::new("artwork", AttributeKind::Path).allow_none())
                .attribute(AttributeDescriptor::new("tags", AttributeKind::TextList).allow_none())
                .attribute(
                    AttributeDescriptor::new(
                        "sibling",
                        AttributeKind::reference(DeletionPolicy::Nullify),
                    )
                    .allow_none(),
                )
                .build()
                .expect("sample type is valid"),
        )
        .expect("sample type registers cleanly");
    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_fixture_works() {
        with_test_store(sample_registry(), |store| {
            let item = store
                .create("testkit.widget", &[("label", Value::from("w"))])
                .unwrap();
            assert_eq!(item.get("count").unwrap(), Value::Integer(0));
            assert_eq!(item.get("active").unwrap(), Value::Boolean(true));
        });
    }

    #[test]
    fn file_fixture_round_trips() {
        with_file_store(sample_registry(), |store, path| {
            assert!(path.join("db.sqlite").exists());
            store
                .create("testkit.widget", &[("label", Value::from("w"))])
                .unwrap();
            assert_eq!(store.query("testkit.widget").count().unwrap(), 1);
        });
    }
}
