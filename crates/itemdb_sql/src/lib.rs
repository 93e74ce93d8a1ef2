//! # itemdb SQL adapter
//!
//! Thin adapter over the SQLite driver for itemdb.
//!
//! This crate is the lowest layer of the engine. It knows nothing about
//! item types, schemas, or the object model - it executes statements and
//! hands rows back as [`SqlValue`] vectors. It owns exactly three concerns:
//!
//! - Translating driver failures into the adapter's error taxonomy
//!   ([`SqlError`]), so everything above this boundary sees typed errors.
//! - Retrying statements while the database file is locked, with a fixed
//!   backoff up to a configured timeout.
//! - Re-executing a statement once when the driver reports that the schema
//!   changed underneath a prepared statement.
//!
//! ## Example
//!
//! ```rust
//! use itemdb_sql::{SqlConnection, SqlValue};
//!
//! let conn = SqlConnection::open_in_memory().unwrap();
//! conn.execute("CREATE TABLE t (x INTEGER)", &[]).unwrap();
//! conn.execute("INSERT INTO t VALUES (?)", &[SqlValue::Integer(7)]).unwrap();
//! let rows = conn.fetch("SELECT x FROM t", &[]).unwrap();
//! assert_eq!(rows[0][0], SqlValue::Integer(7));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod error;
mod value;

pub use connection::{ConnectionOptions, SqlConnection};
pub use error::{SqlError, SqlResult};
pub use value::SqlValue;
