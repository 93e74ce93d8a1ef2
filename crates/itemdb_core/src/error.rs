//! Error types for the itemdb engine.

use crate::types::{SchemaVersion, StoreId};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in engine operations.
///
/// Backend failures are wrapped at the adapter boundary; everything above
/// it surfaces as one of these. `CacheFault` and `CacheInconsistency` are
/// internal signals that the store resolves by reloading - they never
/// escape the public API in normal operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An attribute in-filter rejected a value.
    #[error("constraint violated on attribute {attribute}: {message}")]
    Constraint {
        /// The attribute that rejected the value.
        attribute: String,
        /// Description of the violation.
        message: String,
    },

    /// The SQL adapter reported a failure.
    #[error("sql error: {0}")]
    Sql(#[from] itemdb_sql::SqlError),

    /// A find-unique helper matched no rows.
    #[error("no item matched the query")]
    ItemNotFound,

    /// A find-unique helper matched more than one row.
    #[error("query matched {count} items where exactly one was expected")]
    DuplicateUniqueItem {
        /// Number of rows that matched.
        count: u64,
    },

    /// A reference attribute was assigned an item from a different store.
    #[error("references cannot cross stores")]
    NoCrossStoreReferences,

    /// Deletion was blocked by a disallow-policy reference.
    #[error("cannot delete {target}: still referenced by {referrer} via {attribute}")]
    DeletionDisallowed {
        /// The item being deleted.
        target: StoreId,
        /// An item still pointing at it.
        referrer: StoreId,
        /// The referencing attribute, as `type.attribute`.
        attribute: String,
    },

    /// A reference's referent does not exist.
    #[error("broken reference: {referent} does not exist")]
    BrokenReference {
        /// The missing referent.
        referent: StoreId,
    },

    /// No chain of upgraders reaches the current version.
    #[error("no upgrade path for {type_name} from {from} to {to}")]
    NoUpgradePath {
        /// The affected type name.
        type_name: String,
        /// Version found on disk.
        from: SchemaVersion,
        /// Version currently declared.
        to: SchemaVersion,
    },

    /// The database contains a type the registry does not know.
    #[error("unknown item type {type_name} {version} in database")]
    UnknownItemType {
        /// The stored type name.
        type_name: String,
        /// The stored version.
        version: SchemaVersion,
    },

    /// An upgrader triggered a load of the item it was upgrading.
    #[error("upgrader recursion on {store_id}")]
    UpgraderRecursion {
        /// The item being upgraded.
        store_id: StoreId,
    },

    /// A registered upgrader failed.
    #[error("upgrade of {store_id} ({type_name} {from} -> {to}) failed: {source}")]
    ItemUpgrade {
        /// The affected type name.
        type_name: String,
        /// Version being upgraded from.
        from: SchemaVersion,
        /// Version being upgraded to.
        to: SchemaVersion,
        /// The item that failed.
        store_id: StoreId,
        /// The upgrader's error.
        #[source]
        source: Box<EngineError>,
    },

    /// A post-commit callback attempted to mutate the database.
    #[error("mutation rejected inside a post-commit callback")]
    ChangeRejected,

    /// The identity cache held a dead entry for this id.
    #[error("cache fault for {store_id}")]
    CacheFault {
        /// The id whose entry was dead.
        store_id: StoreId,
    },

    /// The identity cache was asked to replace a live entry.
    #[error("cache inconsistency for {store_id}: live entry already present")]
    CacheInconsistency {
        /// The id with a conflicting live entry.
        store_id: StoreId,
    },

    /// A type declaration or registration was invalid.
    #[error("schema error: {message}")]
    Schema {
        /// Description of the problem.
        message: String,
    },

    /// A query could not be compiled or executed.
    #[error("query error: {message}")]
    Query {
        /// Description of the problem.
        message: String,
    },

    /// An operation was used against the store's lifecycle rules.
    #[error("store misuse: {message}")]
    Misuse {
        /// Description of the misuse.
        message: String,
    },
}

impl EngineError {
    /// Creates a constraint error.
    pub fn constraint(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Constraint {
            attribute: attribute.into(),
            message: message.into(),
        }
    }

    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Creates a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Creates a misuse error.
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse {
            message: message.into(),
        }
    }
}
