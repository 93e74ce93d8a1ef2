//! # itemdb Testkit
//!
//! Test utilities for itemdb.
//!
//! This crate provides:
//! - Store fixtures with automatic cleanup
//! - A sample registry covering every attribute kind
//! - Property-based value generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use itemdb_testkit::prelude::*;
//! use itemdb_core::Value;
//!
//! with_test_store(sample_registry(), |store| {
//!     let item = store
//!         .create("testkit.widget", &[("label", Value::from("w"))])
//!         .unwrap();
//!     assert_eq!(item.get("label").unwrap(), Value::from("w"));
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
