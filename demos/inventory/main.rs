//! Basic itemdb Example - Inventory Application
//!
//! This example demonstrates core itemdb functionality:
//! - Declaring versioned item types in a registry
//! - Opening an in-memory store
//! - CRUD operations, references, and transactions
//! - Typed queries with sorting and aggregates
//! - Powerups for extension
//!
//! Run with: cargo run -p inventory

use itemdb_core::{
    and, column, AttributeDescriptor, AttributeKind, Decimal, DeletionPolicy, EngineResult,
    SchemaRegistry, SortDirection, Store, TypeBuilder, Value,
};
use std::sync::Arc;

fn build_registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry
        .declare(
            TypeBuilder::new("inventory.shelf", 1)
                .module("inventory")
                .attribute(AttributeDescriptor::new("label", AttributeKind::text()).indexed())
                .build()
                .expect("valid shelf type"),
        )
        .expect("shelf declares");
    registry
        .declare(
            TypeBuilder::new("inventory.product", 1)
                .module("inventory")
                .attribute(AttributeDescriptor::new("name", AttributeKind::text()).indexed())
                .attribute(AttributeDescriptor::new("price", AttributeKind::decimal(2)))
                .attribute(
                    AttributeDescriptor::new("stock", AttributeKind::Integer)
                        .default_value(Value::Integer(0)),
                )
                .attribute(
                    AttributeDescriptor::new(
                        "shelf",
                        AttributeKind::reference(DeletionPolicy::Cascade),
                    )
                    .indexed(),
                )
                .build()
                .expect("valid product type"),
        )
        .expect("product declares");
    registry
        .declare(
            TypeBuilder::new("inventory.discount", 1)
                .module("inventory")
                .attribute(AttributeDescriptor::new("percent", AttributeKind::Integer))
                .build()
                .expect("valid discount type"),
        )
        .expect("discount declares");
    Arc::new(registry)
}

fn main() -> EngineResult<()> {
    let store = Store::open_in_memory(build_registry())?;

    // Create shelves and stock them inside one transaction.
    let (front, back) = store.transact(|s| {
        let front = s.create("inventory.shelf", &[("label", Value::from("front"))])?;
        let back = s.create("inventory.shelf", &[("label", Value::from("back"))])?;

        for (name, price, stock, shelf) in [
            ("apple", "0.50", 120, &front),
            ("banana", "0.25", 80, &front),
            ("cherry crate", "12.00", 7, &back),
        ] {
            s.create(
                "inventory.product",
                &[
                    ("name", Value::from(name)),
                    (
                        "price",
                        Value::Decimal(Decimal::parse(price, 2).expect("valid price")),
                    ),
                    ("stock", Value::Integer(stock)),
                    ("shelf", Value::Reference(shelf.store_id())),
                ],
            )?;
        }
        Ok((front, back))
    })?;

    // Typed queries: everything on the front shelf, cheapest first.
    let front_products = store
        .query("inventory.product")
        .filter(column("inventory.product", "shelf").eq(Value::Reference(front.store_id())))
        .sort(column("inventory.product", "price"), SortDirection::Ascending)
        .fetch()?;
    println!("front shelf:");
    for product in &front_products {
        println!(
            "  {} @ {}",
            product.get("name")?.as_text().unwrap_or("?"),
            product.get("price")?.as_decimal().expect("price is decimal"),
        );
    }

    // Aggregates.
    let total_stock = store.query("inventory.product").sum("stock")?;
    println!("total stock: {total_stock:?}");
    let priciest = store.query("inventory.product").max("price")?;
    println!("priciest: {:?}", priciest.as_decimal());

    // Powerups: attach a discount to one product.
    let apple = store.find_unique(
        "inventory.product",
        and(vec![column("inventory.product", "name").eq("apple")]),
    )?;
    let sale = store.create("inventory.discount", &[("percent", Value::Integer(20))])?;
    store.power_up(&apple, "inventory.pricing", &sale, 0)?;
    let discounts = store.powerups_for(&apple, "inventory.pricing")?;
    println!(
        "apple discounts: {:?}",
        discounts
            .iter()
            .map(|d| d.get("percent").unwrap())
            .collect::<Vec<_>>()
    );

    // Cascade: deleting the back shelf removes its products too.
    back.delete()?;
    println!(
        "products after clearing the back shelf: {}",
        store.query("inventory.product").count()?
    );

    Ok(())
}
