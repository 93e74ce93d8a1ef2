//! Deletion policies and tombstoning.

use itemdb_core::{
    column, AttributeDescriptor, AttributeKind, DeletionPolicy, EngineError, SchemaRegistry,
    Store, TypeBuilder, Value,
};
use std::sync::Arc;

fn registry_with_policy(policy: DeletionPolicy) -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new("d.b", 1)
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .declare(
            TypeBuilder::new("d.a", 1)
                .attribute(
                    AttributeDescriptor::new("ref_to_b", AttributeKind::reference(policy))
                        .allow_none()
                        .indexed(),
                )
                .attribute(AttributeDescriptor::new("tag", AttributeKind::text()))
                .build()
                .unwrap(),
        )
        .unwrap();
    Arc::new(registry)
}

fn seed(store: &Store) -> (itemdb_core::ItemRef, Vec<itemdb_core::ItemRef>) {
    let b = store.create("d.b", &[("name", Value::from("target"))]).unwrap();
    let refs = (0..3)
        .map(|n| {
            store
                .create(
                    "d.a",
                    &[
                        ("ref_to_b", Value::Reference(b.store_id())),
                        ("tag", Value::from(format!("a{n}").as_str())),
                    ],
                )
                .unwrap()
        })
        .collect();
    (b, refs)
}

#[test]
fn cascade_deletes_every_referrer_in_one_transaction() {
    let store = Store::open_in_memory(registry_with_policy(DeletionPolicy::Cascade)).unwrap();
    let (b, referrers) = seed(&store);
    // An unrelated item survives.
    let other_b = store.create("d.b", &[("name", Value::from("other"))]).unwrap();
    let unrelated = store
        .create(
            "d.a",
            &[
                ("ref_to_b", Value::Reference(other_b.store_id())),
                ("tag", Value::from("keep")),
            ],
        )
        .unwrap();

    store.transact(|_| b.delete()).unwrap();

    assert_eq!(store.query("d.a").count().unwrap(), 1);
    assert_eq!(store.query("d.b").count().unwrap(), 1);
    for a in &referrers {
        assert!(a.is_detached());
    }
    assert!(!unrelated.is_detached());
}

#[test]
fn cascade_rolls_back_with_the_transaction() {
    let store = Store::open_in_memory(registry_with_policy(DeletionPolicy::Cascade)).unwrap();
    let (b, referrers) = seed(&store);

    let result: Result<(), EngineError> = store.transact(|_| {
        b.delete()?;
        Err(EngineError::misuse("abort"))
    });
    assert!(result.is_err());

    assert_eq!(store.query("d.a").count().unwrap(), 3);
    assert_eq!(store.query("d.b").count().unwrap(), 1);
    assert!(!b.is_detached());
    for a in &referrers {
        assert!(!a.is_detached());
        assert_eq!(
            a.get("ref_to_b").unwrap(),
            Value::Reference(b.store_id())
        );
    }
}

#[test]
fn nullify_leaves_referrers_reading_null() {
    let store = Store::open_in_memory(registry_with_policy(DeletionPolicy::Nullify)).unwrap();
    let (b, referrers) = seed(&store);

    b.delete().unwrap();

    assert_eq!(store.query("d.a").count().unwrap(), 3);
    for a in &referrers {
        assert!(!a.is_detached());
        assert!(a.reference("ref_to_b").unwrap().is_none());
    }
}

#[test]
fn disallow_blocks_deletion_while_a_referrer_exists() {
    let store = Store::open_in_memory(registry_with_policy(DeletionPolicy::Disallow)).unwrap();
    let (b, referrers) = seed(&store);

    let err = b.delete().unwrap_err();
    assert!(matches!(err, EngineError::DeletionDisallowed { .. }));
    assert!(!b.is_detached());
    assert_eq!(store.query("d.b").count().unwrap(), 1);

    // Once the referrers are gone the deletion goes through.
    for a in referrers {
        a.delete().unwrap();
    }
    b.delete().unwrap();
    assert_eq!(store.query("d.b").count().unwrap(), 0);
}

#[test]
fn deleted_ids_are_never_reassigned() {
    let store = Store::open_in_memory(registry_with_policy(DeletionPolicy::Nullify)).unwrap();
    let doomed = store.create("d.b", &[("name", Value::from("doomed"))]).unwrap();
    let id = doomed.store_id();
    doomed.delete().unwrap();

    for n in 0..5 {
        let item = store
            .create("d.b", &[("name", Value::from(format!("n{n}").as_str()))])
            .unwrap();
        assert!(item.store_id() > id);
    }
    assert!(matches!(store.load(id), Err(EngineError::ItemNotFound)));
}

#[test]
fn deleting_twice_is_a_no_op_inside_a_transaction() {
    let store = Store::open_in_memory(registry_with_policy(DeletionPolicy::Nullify)).unwrap();
    let b = store.create("d.b", &[("name", Value::from("x"))]).unwrap();
    store
        .transact(|_| {
            b.delete()?;
            b.delete()
        })
        .unwrap();
    assert_eq!(store.query("d.b").count().unwrap(), 0);
}

#[test]
fn queries_stop_seeing_rows_deleted_in_the_transaction() {
    let store = Store::open_in_memory(registry_with_policy(DeletionPolicy::Nullify)).unwrap();
    let (b, _) = seed(&store);
    store
        .transact(|s| {
            b.delete()?;
            // The delete flushes before the SELECT runs.
            assert_eq!(
                s.query("d.b")
                    .filter(column("d.b", "name").eq("target"))
                    .count()?,
                0
            );
            Ok(())
        })
        .unwrap();
}
