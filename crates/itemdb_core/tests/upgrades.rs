//! Schema evolution: legacy shapes, upgrader chains, and the work loop.

use itemdb_core::{
    AttributeDescriptor, AttributeKind, EngineError, SchemaRegistry, Store, TypeBuilder, Value,
};
use std::path::Path;
use std::sync::Arc;

const SWORD: &str = "z.sword";

fn v1_registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new(SWORD, 1)
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()))
                .attribute(AttributeDescriptor::new("hurtfulness", AttributeKind::Integer))
                .build()
                .unwrap(),
        )
        .unwrap();
    Arc::new(registry)
}

fn v2_registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new(SWORD, 2)
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()))
                .attribute(AttributeDescriptor::new(
                    "damage_per_hit",
                    AttributeKind::Integer,
                ))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register_upgrader(SWORD, 1, |store, old| {
            let name = old.get("name")?;
            let hurtfulness = old.get("hurtfulness")?.as_integer().unwrap();
            let new = store.upgrade_replace(
                old,
                &[
                    ("name", name),
                    ("damage_per_hit", Value::Integer(hurtfulness * 2)),
                ],
            )?;
            Ok(Some(new))
        })
        .unwrap();
    Arc::new(registry)
}

fn seed_v1(path: &Path, count: i64) -> Vec<itemdb_core::StoreId> {
    let store = Store::open(path, v1_registry()).unwrap();
    (0..count)
        .map(|n| {
            store
                .create(
                    SWORD,
                    &[
                        ("name", Value::from(format!("blade-{n}").as_str())),
                        ("hurtfulness", Value::Integer(n + 1)),
                    ],
                )
                .unwrap()
                .store_id()
        })
        .collect()
}

fn old_rows(store: &Store) -> u64 {
    store
        .type_counts()
        .unwrap()
        .iter()
        .filter(|c| c.type_name == SWORD && c.version.as_u32() == 1)
        .map(|c| c.rows)
        .sum()
}

#[test]
fn loading_an_outdated_item_upgrades_it_on_demand() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    let ids = seed_v1(&path, 1);

    let store = Store::open(&path, v2_registry()).unwrap();
    assert!(store.needs_upgrade());

    let sword = store.load(ids[0]).unwrap();
    assert_eq!(sword.schema_version().as_u32(), 2);
    assert_eq!(sword.get("damage_per_hit").unwrap(), Value::Integer(2));
    assert_eq!(sword.get("name").unwrap(), Value::from("blade-0"));
    assert_eq!(old_rows(&store), 0);
}

#[test]
fn run_to_completion_drains_every_old_row() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    let ids = seed_v1(&path, 5);

    let store = Store::open(&path, v2_registry()).unwrap();
    let report = store.run_upgrades_to_completion().unwrap();
    assert!(report.failures.is_empty());
    assert!(report.steps >= 5);
    assert_eq!(old_rows(&store), 0);

    // Ids survived the upgrade; values transformed.
    for (n, id) in ids.iter().enumerate() {
        let sword = store.load(*id).unwrap();
        assert_eq!(
            sword.get("damage_per_hit").unwrap(),
            Value::Integer((n as i64 + 1) * 2)
        );
    }
    assert!(!store.upgrade_step().unwrap());
}

#[test]
fn step_is_bounded_and_reports_remaining_work() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    seed_v1(&path, 3);

    let store = Store::open(&path, v2_registry()).unwrap();
    assert_eq!(old_rows(&store), 3);

    assert!(store.upgrade_step().unwrap());
    assert_eq!(old_rows(&store), 2);
    assert!(store.upgrade_step().unwrap());
    assert!(store.upgrade_step().unwrap());
    assert_eq!(old_rows(&store), 0);
    assert!(!store.upgrade_step().unwrap());
}

#[test]
fn open_fails_without_an_upgrade_path() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    seed_v1(&path, 1);

    // Current version moved to 2 but no upgrader was registered.
    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new(SWORD, 2)
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()))
                .attribute(AttributeDescriptor::new(
                    "damage_per_hit",
                    AttributeKind::Integer,
                ))
                .build()
                .unwrap(),
        )
        .unwrap();
    let err = Store::open(&path, Arc::new(registry)).unwrap_err();
    assert!(matches!(err, EngineError::NoUpgradePath { .. }));
}

#[test]
fn open_fails_on_unknown_stored_types() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    seed_v1(&path, 1);

    let err = Store::open(&path, Arc::new(SchemaRegistry::new())).unwrap_err();
    assert!(matches!(err, EngineError::UnknownItemType { .. }));
}

#[test]
fn upgrader_returning_none_deletes_the_item() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    let ids = seed_v1(&path, 2);

    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new(SWORD, 2)
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()))
                .attribute(AttributeDescriptor::new(
                    "damage_per_hit",
                    AttributeKind::Integer,
                ))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register_upgrader(SWORD, 1, |_, _| Ok(None))
        .unwrap();
    let store = Store::open(&path, Arc::new(registry)).unwrap();

    let report = store.run_upgrades_to_completion().unwrap();
    assert!(report.failures.is_empty());
    assert_eq!(old_rows(&store), 0);
    for id in ids {
        assert!(matches!(store.load(id), Err(EngineError::ItemNotFound)));
    }
}

#[test]
fn two_step_chain_passes_through_the_intermediate_shape() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    let ids = seed_v1(&path, 1);

    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new(SWORD, 3)
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()))
                .attribute(AttributeDescriptor::new("damage", AttributeKind::Integer))
                .attribute(
                    AttributeDescriptor::new("magical", AttributeKind::Boolean)
                        .default_value(Value::Boolean(false)),
                )
                .build()
                .unwrap(),
        )
        .unwrap();
    // The intermediate shape must be declared for the chain to pass
    // through it.
    registry
        .declare(
            TypeBuilder::new(SWORD, 2)
                .legacy()
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()))
                .attribute(AttributeDescriptor::new("damage", AttributeKind::Integer))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register_upgrader(SWORD, 1, |store, old| {
            let damage = old.get("hurtfulness")?.as_integer().unwrap() * 2;
            let new = store.upgrade_replace(
                old,
                &[("name", old.get("name")?), ("damage", Value::Integer(damage))],
            )?;
            // The intermediate is an ordinary, loadable item of its shape.
            assert_eq!(new.schema_version().as_u32(), 2);
            assert_eq!(new.get("damage")?, Value::Integer(damage));
            Ok(Some(new))
        })
        .unwrap();
    registry
        .register_upgrader(SWORD, 2, |store, old| {
            let new = store.upgrade_replace(
                old,
                &[
                    ("name", old.get("name")?),
                    ("damage", old.get("damage")?),
                    ("magical", Value::Boolean(true)),
                ],
            )?;
            Ok(Some(new))
        })
        .unwrap();

    let store = Store::open(&path, Arc::new(registry)).unwrap();
    let sword = store.load(ids[0]).unwrap();
    assert_eq!(sword.schema_version().as_u32(), 3);
    assert_eq!(sword.get("damage").unwrap(), Value::Integer(2));
    assert_eq!(sword.get("magical").unwrap(), Value::Boolean(true));
}

#[test]
fn upgrader_recursion_is_fatal_and_writes_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    let ids = seed_v1(&path, 1);

    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new(SWORD, 2)
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()))
                .attribute(AttributeDescriptor::new(
                    "damage_per_hit",
                    AttributeKind::Integer,
                ))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register_upgrader(SWORD, 1, |store, old| {
            // Loading the item being upgraded re-enters its own chain.
            let _ = store.load(old.store_id())?;
            unreachable!("the load above must fail");
        })
        .unwrap();
    let store = Store::open(&path, Arc::new(registry)).unwrap();

    let err = store.load(ids[0]).unwrap_err();
    assert!(matches!(err, EngineError::UpgraderRecursion { .. }));

    // Nothing was half-written: the old row survives, nothing landed in
    // the new table.
    assert_eq!(old_rows(&store), 1);
    let new_rows: u64 = store
        .type_counts()
        .unwrap()
        .iter()
        .filter(|c| c.type_name == SWORD && c.version.as_u32() == 2)
        .map(|c| c.rows)
        .sum();
    assert_eq!(new_rows, 0);
}

#[test]
fn failed_upgrades_are_recorded_and_skipped() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    let ids = seed_v1(&path, 3);

    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new(SWORD, 2)
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()))
                .attribute(AttributeDescriptor::new(
                    "damage_per_hit",
                    AttributeKind::Integer,
                ))
                .build()
                .unwrap(),
        )
        .unwrap();
    let poison = ids[1];
    registry
        .register_upgrader(SWORD, 1, move |store, old| {
            if old.store_id() == poison {
                return Err(EngineError::misuse("intentional upgrader failure"));
            }
            let new = store.upgrade_replace(
                old,
                &[
                    ("name", old.get("name")?),
                    ("damage_per_hit", Value::Integer(1)),
                ],
            )?;
            Ok(Some(new))
        })
        .unwrap();
    let store = Store::open(&path, Arc::new(registry)).unwrap();

    // The loop terminates despite the poisoned item.
    let report = store.run_upgrades_to_completion().unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].store_id, poison);
    assert_eq!(report.failures[0].version.as_u32(), 1);
    assert!(report.failures[0].message.contains("intentional"));

    // The two healthy items upgraded; the poisoned row remains at v1.
    assert_eq!(old_rows(&store), 1);
    assert!(store.load(ids[0]).is_ok());
    assert!(store.load(ids[2]).is_ok());
}

#[test]
fn upgraded_items_keep_a_single_live_instance() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("store");
    let ids = seed_v1(&path, 1);

    let store = Store::open(&path, v2_registry()).unwrap();
    let first = store.load(ids[0]).unwrap();
    let second = store.load(ids[0]).unwrap();
    assert!(first.same_item(&second));
}
