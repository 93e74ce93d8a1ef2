//! Query compilation and materialization, end to end.

use itemdb_core::{
    and, column, store_id_column, AttributeDescriptor, AttributeKind, Decimal, DeletionPolicy,
    EngineError, SchemaRegistry, SortDirection, Store, TypeBuilder, Value,
};
use std::sync::Arc;

fn registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new("q.c", 1)
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()).indexed())
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .declare(
            TypeBuilder::new("q.a", 1)
                .attribute(AttributeDescriptor::new(
                    "ref_to_c",
                    AttributeKind::reference(DeletionPolicy::Cascade),
                ))
                .attribute(AttributeDescriptor::new("kind", AttributeKind::text()))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .declare(
            TypeBuilder::new("q.b", 1)
                .attribute(AttributeDescriptor::new(
                    "ref_to_c",
                    AttributeKind::reference(DeletionPolicy::Cascade),
                ))
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .declare(
            TypeBuilder::new("q.priced", 1)
                .attribute(AttributeDescriptor::new("value", AttributeKind::decimal(4)))
                .attribute(
                    AttributeDescriptor::new("label", AttributeKind::text())
                        .default_value(Value::from("")),
                )
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .declare(
            TypeBuilder::new("q.maybe", 1)
                .attribute(AttributeDescriptor::new("note", AttributeKind::text()).allow_none())
                .build()
                .unwrap(),
        )
        .unwrap();
    Arc::new(registry)
}

fn store() -> Store {
    Store::open_in_memory(registry()).unwrap()
}

#[test]
fn join_across_three_types() {
    let store = store();
    let c1 = store.create("q.c", &[("name", Value::from("yes"))]).unwrap();
    let c2 = store.create("q.c", &[("name", Value::from("no"))]).unwrap();

    for (target, kind) in [(&c1, "k"), (&c2, "k"), (&c1, "x")] {
        store
            .create(
                "q.a",
                &[
                    ("ref_to_c", Value::Reference(target.store_id())),
                    ("kind", Value::from(kind)),
                ],
            )
            .unwrap();
    }
    let b1 = store
        .create(
            "q.b",
            &[
                ("ref_to_c", Value::Reference(c1.store_id())),
                ("name", Value::from("correct")),
            ],
        )
        .unwrap();
    store
        .create(
            "q.b",
            &[
                ("ref_to_c", Value::Reference(c2.store_id())),
                ("name", Value::from("wrong")),
            ],
        )
        .unwrap();

    let results = store
        .query("q.b")
        .filter(and(vec![
            column("q.c", "name").eq("yes"),
            column("q.a", "kind").eq("k"),
            store_id_column("q.c").eq_column(column("q.b", "ref_to_c")),
            column("q.a", "ref_to_c").eq_column(store_id_column("q.c")),
        ]))
        .fetch()
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].same_item(&b1));
    assert_eq!(results[0].get("name").unwrap(), Value::from("correct"));
}

#[test]
fn fixed_point_sum_is_exact() {
    let store = store();
    let tenth = Decimal::parse("0.10", 4).unwrap();
    for _ in 0..10 {
        store
            .create("q.priced", &[("value", Value::Decimal(tenth))])
            .unwrap();
    }
    let total = store.query("q.priced").sum("value").unwrap();
    assert_eq!(total, Value::Decimal(Decimal::parse("1.0", 4).unwrap()));
    assert_eq!(total.as_decimal().unwrap().to_f64(), 1.0);
}

#[test]
fn sum_over_no_rows_is_zero() {
    let store = store();
    let total = store.query("q.priced").sum("value").unwrap();
    assert_eq!(total.as_decimal().unwrap().scaled(), 0);
}

#[test]
fn min_max_require_rows_or_defaults() {
    let store = store();
    assert!(store.query("q.priced").min("value").is_err());
    let fallback = Value::Decimal(Decimal::parse("9.99", 4).unwrap());
    assert_eq!(
        store.query("q.priced").min_or("value", fallback.clone()).unwrap(),
        fallback
    );

    for text in ["1.5", "0.5", "2.5"] {
        store
            .create(
                "q.priced",
                &[("value", Value::Decimal(Decimal::parse(text, 4).unwrap()))],
            )
            .unwrap();
    }
    assert_eq!(
        store.query("q.priced").min("value").unwrap(),
        Value::Decimal(Decimal::parse("0.5", 4).unwrap())
    );
    assert_eq!(
        store.query("q.priced").max("value").unwrap(),
        Value::Decimal(Decimal::parse("2.5", 4).unwrap())
    );
    assert_eq!(store.query("q.priced").average("value").unwrap(), Some(15000.0));
}

#[test]
fn count_matches_fetch_length() {
    let store = store();
    for kind in ["k", "k", "x", "y", "k"] {
        let c = store.create("q.c", &[("name", Value::from("c"))]).unwrap();
        store
            .create(
                "q.a",
                &[
                    ("ref_to_c", Value::Reference(c.store_id())),
                    ("kind", Value::from(kind)),
                ],
            )
            .unwrap();
    }
    let query = store.query("q.a").filter(column("q.a", "kind").eq("k"));
    assert_eq!(query.count().unwrap() as usize, query.fetch().unwrap().len());

    let all = store.query("q.a");
    assert_eq!(all.count().unwrap() as usize, all.fetch().unwrap().len());
}

#[test]
fn one_of_and_empty_one_of() {
    let store = store();
    for name in ["ant", "bee", "cat"] {
        store.create("q.c", &[("name", Value::from(name))]).unwrap();
    }
    let hits = store
        .query("q.c")
        .filter(column("q.c", "name").one_of(vec![Value::from("ant"), Value::from("cat")]))
        .fetch()
        .unwrap();
    assert_eq!(hits.len(), 2);

    let none = store
        .query("q.c")
        .filter(column("q.c", "name").one_of(vec![]))
        .count()
        .unwrap();
    assert_eq!(none, 0);

    let all = store
        .query("q.c")
        .filter(column("q.c", "name").not_one_of(vec![]))
        .count()
        .unwrap();
    assert_eq!(all, 3);
}

#[test]
fn like_family() {
    let store = store();
    for name in ["prefix_one", "prefix_two", "other", "100%done"] {
        store.create("q.c", &[("name", Value::from(name))]).unwrap();
    }
    assert_eq!(
        store
            .query("q.c")
            .filter(column("q.c", "name").starts_with("prefix"))
            .count()
            .unwrap(),
        2
    );
    assert_eq!(
        store
            .query("q.c")
            .filter(column("q.c", "name").ends_with("done"))
            .count()
            .unwrap(),
        1
    );
    // starts_with escapes wildcards: "100%" only matches the literal.
    assert_eq!(
        store
            .query("q.c")
            .filter(column("q.c", "name").starts_with("100%"))
            .count()
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .query("q.c")
            .filter(column("q.c", "name").like("%o%"))
            .count()
            .unwrap(),
        4
    );
    assert_eq!(
        store
            .query("q.c")
            .filter(column("q.c", "name").not_like("prefix%"))
            .count()
            .unwrap(),
        2
    );
}

#[test]
fn null_comparisons() {
    let store = store();
    store.create("q.maybe", &[]).unwrap();
    store.create("q.maybe", &[("note", Value::from("set"))]).unwrap();

    assert_eq!(
        store
            .query("q.maybe")
            .filter(column("q.maybe", "note").is_null())
            .count()
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .query("q.maybe")
            .filter(column("q.maybe", "note").not_null())
            .count()
            .unwrap(),
        1
    );
    // Equality against null folds into the null tests.
    assert_eq!(
        store
            .query("q.maybe")
            .filter(column("q.maybe", "note").eq(Value::Null))
            .count()
            .unwrap(),
        1
    );
}

#[test]
fn empty_boolean_aggregates_are_rejected() {
    let store = store();
    let err = store.query("q.c").filter(and(vec![])).count().unwrap_err();
    assert!(matches!(err, EngineError::Query { .. }));
    let err = store
        .query("q.c")
        .filter(itemdb_core::or(vec![]))
        .count()
        .unwrap_err();
    assert!(matches!(err, EngineError::Query { .. }));
}

#[test]
fn sort_limit_offset() {
    let store = store();
    for name in ["d", "b", "a", "c"] {
        store.create("q.c", &[("name", Value::from(name))]).unwrap();
    }
    let page = store
        .query("q.c")
        .sort(column("q.c", "name"), SortDirection::Ascending)
        .limit(2)
        .offset(1)
        .fetch()
        .unwrap();
    let names: Vec<Value> = page.iter().map(|i| i.get("name").unwrap()).collect();
    assert_eq!(names, vec![Value::from("b"), Value::from("c")]);
}

#[test]
fn distinct_values() {
    let store = store();
    for kind in ["k", "x", "k"] {
        let c = store.create("q.c", &[("name", Value::from("c"))]).unwrap();
        store
            .create(
                "q.a",
                &[
                    ("ref_to_c", Value::Reference(c.store_id())),
                    ("kind", Value::from(kind)),
                ],
            )
            .unwrap();
    }
    let mut kinds: Vec<String> = store
        .query("q.a")
        .distinct("kind")
        .unwrap()
        .into_iter()
        .map(|v| v.as_text().unwrap().to_string())
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec!["k".to_string(), "x".to_string()]);
}

#[test]
fn querying_an_unknown_attribute_fails() {
    let store = store();
    let err = store
        .query("q.c")
        .filter(column("q.c", "missing").eq("x"))
        .count()
        .unwrap_err();
    assert!(matches!(err, EngineError::Query { .. }));
}

#[test]
fn live_instances_win_over_row_data() {
    let store = store();
    let item = store.create("q.c", &[("name", Value::from("old"))]).unwrap();

    store
        .transact(|s| {
            item.set("name", Value::from("new"))?;
            // The fetch flushes the touched set and must hand back the
            // same live instance, not a second copy built from the row.
            let fetched = s.query("q.c").fetch()?;
            assert_eq!(fetched.len(), 1);
            assert!(fetched[0].same_item(&item));
            assert_eq!(fetched[0].get("name")?, Value::from("new"));
            Ok(())
        })
        .unwrap();
}
