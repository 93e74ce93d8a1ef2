//! Storage layout: metadata tables, per-type tables, and index DDL.
//!
//! Table names are derived deterministically from `(type_name, version)` so
//! two processes provisioning the same type agree without coordination.
//! Attached child stores prepend a table prefix so they can live in the
//! same database file as their parent.

use crate::attribute::{AttributeDescriptor, AttributeKind};
use crate::schema::TypeDescriptor;
use crate::types::SchemaVersion;

/// Normalizes a dotted type name into a table-name fragment.
#[must_use]
pub fn normalized_type_name(type_name: &str) -> String {
    type_name.replace('.', "_")
}

/// Returns the data table name for `(type_name, version)`.
#[must_use]
pub fn table_name(prefix: &str, type_name: &str, version: SchemaVersion) -> String {
    format!(
        "{prefix}item_{}_v{}",
        normalized_type_name(type_name),
        version.as_u32()
    )
}

/// DDL for the `objects` metadata table.
#[must_use]
pub fn create_objects_sql(prefix: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {prefix}objects (\
         oid INTEGER PRIMARY KEY, \
         type_id INTEGER NOT NULL REFERENCES {prefix}types(oid))"
    )
}

/// DDL for the `types` metadata table.
#[must_use]
pub fn create_types_sql(prefix: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {prefix}types (\
         oid INTEGER PRIMARY KEY, \
         type_name TEXT, \
         module_name TEXT, \
         version INTEGER)"
    )
}

/// DDL for the `attributes` metadata table.
#[must_use]
pub fn create_attributes_sql(prefix: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {prefix}attributes (\
         type_id INTEGER, \
         row_offset INTEGER, \
         indexed BOOLEAN, \
         sql_type TEXT, \
         allow_none BOOLEAN, \
         value_type TEXT, \
         attribute_name TEXT, \
         docstring TEXT)"
    )
}

/// Index DDL for the metadata tables.
#[must_use]
pub fn create_metadata_index_sqls(prefix: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE INDEX IF NOT EXISTS {prefix}idx_types_name_version \
             ON {prefix}types (type_name, version)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {prefix}idx_attributes_type \
             ON {prefix}attributes (type_id)"
        ),
    ]
}

fn column_def(attribute: &AttributeDescriptor) -> String {
    let collation = match attribute.kind() {
        AttributeKind::Text {
            case_sensitive: false,
        } => " COLLATE NOCASE",
        _ => "",
    };
    format!(
        "{} {}{collation}",
        attribute.name(),
        attribute.kind().sql_type()
    )
}

/// DDL for one type's data table: `oid` plus attribute columns in
/// declaration order.
#[must_use]
pub fn create_table_sql(prefix: &str, descriptor: &TypeDescriptor) -> String {
    let mut columns = vec!["oid INTEGER PRIMARY KEY".to_string()];
    columns.extend(descriptor.attributes().iter().map(column_def));
    format!(
        "CREATE TABLE {} ({})",
        table_name(prefix, descriptor.type_name(), descriptor.version()),
        columns.join(", ")
    )
}

/// Index DDL for one type's data table: a single-column index per indexed
/// attribute and one index per declared compound tuple.
#[must_use]
pub fn create_index_sqls(prefix: &str, descriptor: &TypeDescriptor) -> Vec<String> {
    let table = table_name(prefix, descriptor.type_name(), descriptor.version());
    let mut sqls = Vec::new();
    for attribute in descriptor.attributes() {
        if attribute.is_indexed() {
            sqls.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table} ({col})",
                col = attribute.name()
            ));
        }
    }
    for index in descriptor.compound_indexes() {
        let joined = index.join("_");
        let cols = index.join(", ");
        sqls.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_{joined} ON {table} ({cols})"
        ));
    }
    sqls
}
