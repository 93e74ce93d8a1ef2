//! CLI command implementations.

pub mod check;
pub mod inspect;

use itemdb_sql::{ConnectionOptions, SqlConnection};
use std::path::Path;

/// Opens the database inside a store directory.
///
/// Fails rather than creating a fresh database when nothing is there.
pub fn open_store_db(path: &Path) -> Result<SqlConnection, Box<dyn std::error::Error>> {
    let db_path = path.join("db.sqlite");
    if !db_path.exists() {
        return Err(format!("no store found at {}", path.display()).into());
    }
    Ok(SqlConnection::open(&db_path, ConnectionOptions::default())?)
}
