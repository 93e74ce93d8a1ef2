//! Inspect command implementation.

use itemdb_core::layout;
use itemdb_core::SchemaVersion;
use itemdb_sql::SqlValue;
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Total `objects` rows, live and tombstoned.
    pub object_count: u64,
    /// Tombstoned `objects` rows.
    pub tombstone_count: u64,
    /// Stored types.
    pub types: Vec<StoredType>,
}

/// One stored `(type_name, version)` and its data table.
#[derive(Debug, Serialize)]
pub struct StoredType {
    /// Metadata row id.
    pub type_id: i64,
    /// The type name.
    pub type_name: String,
    /// The stored version.
    pub version: u32,
    /// Rows in the data table.
    pub rows: u64,
    /// Per-attribute details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<StoredAttribute>>,
}

/// One stored attribute descriptor.
#[derive(Debug, Serialize)]
pub struct StoredAttribute {
    /// Attribute name.
    pub name: String,
    /// Canonical kind string.
    pub value_type: String,
    /// SQL column type.
    pub sql_type: String,
    /// Whether the attribute is indexed.
    pub indexed: bool,
    /// Whether null is permitted.
    pub allow_none: bool,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_attributes: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let conn = super::open_store_db(path)?;

    let object_count = count(&conn, "SELECT COUNT(*) FROM objects")?;
    let tombstone_count = count(&conn, "SELECT COUNT(*) FROM objects WHERE type_id = -1")?;

    let mut types = Vec::new();
    for row in conn.fetch(
        "SELECT oid, type_name, version FROM types ORDER BY type_name, version",
        &[],
    )? {
        let type_id = row[0].as_integer().unwrap_or_default();
        let type_name = row[1].as_text().unwrap_or_default().to_string();
        let version = row[2].as_integer().unwrap_or_default() as u32;
        let table = layout::table_name("", &type_name, SchemaVersion::new(version));
        let rows = count(&conn, &format!("SELECT COUNT(*) FROM {table}"))?;

        let attributes = if show_attributes {
            let mut attrs = Vec::new();
            for attr in conn.fetch(
                "SELECT attribute_name, value_type, sql_type, indexed, allow_none \
                 FROM attributes WHERE type_id = ? ORDER BY row_offset",
                &[SqlValue::Integer(type_id)],
            )? {
                attrs.push(StoredAttribute {
                    name: attr[0].as_text().unwrap_or_default().to_string(),
                    value_type: attr[1].as_text().unwrap_or_default().to_string(),
                    sql_type: attr[2].as_text().unwrap_or_default().to_string(),
                    indexed: attr[3].as_integer() == Some(1),
                    allow_none: attr[4].as_integer() == Some(1),
                });
            }
            Some(attrs)
        } else {
            None
        };

        types.push(StoredType {
            type_id,
            type_name,
            version,
            rows,
            attributes,
        });
    }

    let result = InspectResult {
        path: path.display().to_string(),
        object_count,
        tombstone_count,
        types,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn count(
    conn: &itemdb_sql::SqlConnection,
    sql: &str,
) -> Result<u64, Box<dyn std::error::Error>> {
    Ok(conn
        .fetch_one(sql, &[])?
        .and_then(|row| row[0].as_integer())
        .unwrap_or_default() as u64)
}

fn print_text_output(result: &InspectResult) {
    println!("itemdb Store Inspection");
    println!("=======================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Objects:");
    println!(
        "  Live:       {}",
        result.object_count - result.tombstone_count
    );
    println!("  Tombstones: {}", result.tombstone_count);
    println!();
    println!("Types:");
    for stored in &result.types {
        println!(
            "  [{}] {} v{}: {} rows",
            stored.type_id, stored.type_name, stored.version, stored.rows
        );
        if let Some(attributes) = &stored.attributes {
            for attr in attributes {
                let mut flags = Vec::new();
                if attr.indexed {
                    flags.push("indexed");
                }
                if attr.allow_none {
                    flags.push("nullable");
                }
                let suffix = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", flags.join(", "))
                };
                println!(
                    "      {} {} [{}]{suffix}",
                    attr.name, attr.value_type, attr.sql_type
                );
            }
        }
    }
}
