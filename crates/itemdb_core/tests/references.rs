//! Reference semantics across stores, deletions, and reopen.

use itemdb_core::{
    AttributeDescriptor, AttributeKind, DeletionPolicy, EngineError, SchemaRegistry, Store,
    TypeBuilder, Value,
};
use std::sync::Arc;

fn registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new("r.node", 1)
                .attribute(AttributeDescriptor::new("label", AttributeKind::text()))
                .attribute(
                    AttributeDescriptor::new(
                        "next",
                        AttributeKind::reference(DeletionPolicy::Nullify),
                    )
                    .allow_none()
                    .indexed(),
                )
                .build()
                .unwrap(),
        )
        .unwrap();
    Arc::new(registry)
}

#[test]
fn references_survive_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");

    let (a_id, b_id) = {
        let store = Store::open(&path, registry()).unwrap();
        let a = store.create("r.node", &[("label", Value::from("a"))]).unwrap();
        let b = store.create("r.node", &[("label", Value::from("b"))]).unwrap();
        a.set_reference("next", &b).unwrap();
        (a.store_id(), b.store_id())
    };

    let store = Store::open(&path, registry()).unwrap();
    let a = store.load(a_id).unwrap();
    let next = a.reference("next").unwrap().unwrap();
    assert_eq!(next.store_id(), b_id);
    assert_eq!(next.get("label").unwrap(), Value::from("b"));

    // Resolving twice hands back the same live instance.
    let again = a.reference("next").unwrap().unwrap();
    assert!(next.same_item(&again));
}

#[test]
fn cross_store_references_are_rejected_even_between_separate_files() {
    let temp = tempfile::tempdir().unwrap();
    let store_a = Store::open(&temp.path().join("a"), registry()).unwrap();
    let store_b = Store::open(&temp.path().join("b"), registry()).unwrap();

    let a = store_a.create("r.node", &[("label", Value::from("a"))]).unwrap();
    let b = store_b.create("r.node", &[("label", Value::from("b"))]).unwrap();

    let err = a.set_reference("next", &b).unwrap_err();
    assert!(matches!(err, EngineError::NoCrossStoreReferences));
}

#[test]
fn nullified_reference_reads_none_after_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");

    let a_id = {
        let store = Store::open(&path, registry()).unwrap();
        let a = store.create("r.node", &[("label", Value::from("a"))]).unwrap();
        let b = store.create("r.node", &[("label", Value::from("b"))]).unwrap();
        a.set_reference("next", &b).unwrap();
        b.delete().unwrap();
        a.store_id()
    };

    // The stale id is still in the column; the nullify policy resolves it
    // to nothing, in this process and after reopen.
    let store = Store::open(&path, registry()).unwrap();
    let a = store.load(a_id).unwrap();
    assert!(a.reference("next").unwrap().is_none());
}

#[test]
fn self_references_are_allowed() {
    let store = Store::open_in_memory(registry()).unwrap();
    let a = store.create("r.node", &[("label", Value::from("loop"))]).unwrap();
    a.set_reference("next", &a).unwrap();
    let resolved = a.reference("next").unwrap().unwrap();
    assert!(resolved.same_item(&a));
}

#[test]
fn chained_resolution_walks_the_graph() {
    let store = Store::open_in_memory(registry()).unwrap();
    let nodes: Vec<_> = (0..4)
        .map(|n| {
            store
                .create("r.node", &[("label", Value::from(format!("n{n}").as_str()))])
                .unwrap()
        })
        .collect();
    for pair in nodes.windows(2) {
        pair[0].set_reference("next", &pair[1]).unwrap();
    }

    let mut current = nodes[0].clone();
    let mut labels = vec![current.get("label").unwrap()];
    while let Some(next) = current.reference("next").unwrap() {
        labels.push(next.get("label").unwrap());
        current = next;
    }
    assert_eq!(
        labels,
        vec![
            Value::from("n0"),
            Value::from("n1"),
            Value::from("n2"),
            Value::from("n3"),
        ]
    );
}

#[test]
fn reference_assignment_rolls_back_with_the_transaction() {
    let store = Store::open_in_memory(registry()).unwrap();
    let a = store.create("r.node", &[("label", Value::from("a"))]).unwrap();
    let b = store.create("r.node", &[("label", Value::from("b"))]).unwrap();

    let result: Result<(), EngineError> = store.transact(|_| {
        a.set_reference("next", &b)?;
        Err(EngineError::misuse("abort"))
    });
    assert!(result.is_err());
    assert!(a.reference("next").unwrap().is_none());
}
