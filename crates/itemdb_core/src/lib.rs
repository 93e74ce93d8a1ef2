//! # itemdb Core
//!
//! An embedded object-relational persistence engine on SQLite.
//!
//! Schema-versioned item types map onto per-type tables; callers get a
//! transactional, cache-coherent, reference-preserving object model:
//!
//! - Declare types in a [`SchemaRegistry`] (name, version, typed
//!   attributes), then open a [`Store`] against a directory or in memory.
//! - [`Store::create`] / [`ItemRef::set`] / [`ItemRef::get`] move data
//!   through per-attribute in/out filters; writes are dirty-tracked and
//!   flushed at checkpoints.
//! - [`Store::transact`] wraps work in BEGIN IMMEDIATE / COMMIT /
//!   ROLLBACK with in-memory revert on rollback.
//! - [`Store::query`] compiles a typed comparison algebra into
//!   parameterized SQL and materializes rows through the identity cache.
//! - Registered upgraders carry old on-disk shapes forward, one version
//!   step at a time, in the background or on demand.
//! - Powerups extend host items through a priority-ordered,
//!   interface-keyed link table.
//!
//! ## Example
//!
//! ```rust
//! use itemdb_core::{
//!     AttributeDescriptor, AttributeKind, SchemaRegistry, Store, TypeBuilder, Value,
//! };
//! use std::sync::Arc;
//!
//! let registry = SchemaRegistry::new();
//! registry
//!     .declare(
//!         TypeBuilder::new("demo.book", 1)
//!             .attribute(AttributeDescriptor::new("title", AttributeKind::text()).indexed())
//!             .attribute(AttributeDescriptor::new("pages", AttributeKind::Integer))
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let store = Store::open_in_memory(Arc::new(registry)).unwrap();
//! let book = store
//!     .create("demo.book", &[("title", Value::from("Ulysses")), ("pages", Value::Integer(730))])
//!     .unwrap();
//! assert_eq!(book.get("pages").unwrap(), Value::Integer(730));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attribute;
mod cache;
mod config;
mod dir;
mod error;
mod item;
pub mod layout;
mod powerup;
mod query;
mod schema;
mod store;
mod transaction;
mod types;
mod upgrade;
mod value;

pub use attribute::{AttributeDescriptor, AttributeKind, DefaultValue, DeletionPolicy};
pub use config::Config;
pub use dir::StoreDir;
pub use error::{EngineError, EngineResult};
pub use item::ItemRef;
pub use query::{
    and, column, or, store_id_column, AttributeRef, LikeFragment, PagedQuery, Predicate, Query,
    SortDirection,
};
pub use schema::{
    Indirector, ItemHook, SchemaRegistry, TypeBuilder, TypeDescriptor, Upgrader,
    INDIRECTOR_INTERFACE, POWERUP_LINK_TYPE,
};
pub use store::{Store, TypeCount};
pub use types::{SchemaVersion, StoreId, TypeId, TOMBSTONE_TYPE_ID};
pub use upgrade::{UpgradeFailure, UpgradeReport};
pub use value::{Decimal, Value};

/// Version of the core engine crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
