//! Check command implementation.
//!
//! Verifies the internal consistency of a store's metadata:
//!
//! - every live `objects` row points at an existing `types` row
//! - every stored type has its data table
//! - every data-table row has a matching `objects` row of its type

use itemdb_core::layout;
use itemdb_core::SchemaVersion;
use itemdb_sql::{SqlConnection, SqlValue};
use std::path::Path;

/// Runs the check command. Exits with an error when problems are found.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let conn = super::open_store_db(path)?;
    let mut problems = Vec::new();

    check_object_types(&conn, &mut problems)?;
    check_data_tables(&conn, &mut problems)?;

    if problems.is_empty() {
        println!("ok: store at {} is consistent", path.display());
        Ok(())
    } else {
        for problem in &problems {
            println!("problem: {problem}");
        }
        Err(format!("{} problem(s) found", problems.len()).into())
    }
}

/// Every live object must reference a known type.
fn check_object_types(
    conn: &SqlConnection,
    problems: &mut Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let rows = conn.fetch(
        "SELECT o.oid, o.type_id FROM objects o \
         LEFT JOIN types t ON o.type_id = t.oid \
         WHERE o.type_id != -1 AND t.oid IS NULL",
        &[],
    )?;
    for row in rows {
        problems.push(format!(
            "object {} references unknown type {}",
            row[0].as_integer().unwrap_or_default(),
            row[1].as_integer().unwrap_or_default()
        ));
    }
    Ok(())
}

/// Every stored type needs its table, and every data row its object row.
fn check_data_tables(
    conn: &SqlConnection,
    problems: &mut Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    for row in conn.fetch("SELECT oid, type_name, version FROM types", &[])? {
        let type_id = row[0].as_integer().unwrap_or_default();
        let type_name = row[1].as_text().unwrap_or_default().to_string();
        let version = row[2].as_integer().unwrap_or_default() as u32;
        let table = layout::table_name("", &type_name, SchemaVersion::new(version));

        let exists = conn
            .fetch_one(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                &[SqlValue::Text(table.clone())],
            )?
            .is_some();
        if !exists {
            problems.push(format!(
                "type {type_name} v{version} has no data table {table}"
            ));
            continue;
        }

        let orphans = conn.fetch(
            &format!(
                "SELECT d.oid FROM {table} d \
                 LEFT JOIN objects o ON d.oid = o.oid AND o.type_id = ? \
                 WHERE o.oid IS NULL"
            ),
            &[SqlValue::Integer(type_id)],
        )?;
        for orphan in orphans {
            problems.push(format!(
                "row {} in {table} has no matching object of type {type_name} v{version}",
                orphan[0].as_integer().unwrap_or_default()
            ));
        }
    }
    Ok(())
}
