//! Error types for the SQL adapter.

use std::time::Duration;
use thiserror::Error;

/// Result type for adapter operations.
pub type SqlResult<T> = Result<T, SqlError>;

/// Errors that can occur at the SQL adapter boundary.
///
/// Driver errors never escape this crate raw; they are classified here so
/// the engine above can react to the cases that matter (lock timeouts and
/// the benign create-table race) and wrap the rest.
#[derive(Debug, Error)]
pub enum SqlError {
    /// The database file could not be opened.
    #[error("cannot open database at {path}: {source}")]
    Open {
        /// Path that was being opened.
        path: String,
        /// The underlying driver error.
        source: rusqlite::Error,
    },

    /// The database stayed locked beyond the configured timeout.
    #[error("database locked for longer than {timeout:?} while executing: {statement}")]
    Timeout {
        /// The statement that could not run.
        statement: String,
        /// The configured busy timeout.
        timeout: Duration,
        /// The last busy error observed from the driver.
        source: rusqlite::Error,
    },

    /// A CREATE statement lost the table-creation race to another process.
    ///
    /// Callers that provision tables treat this as a signal to re-scan the
    /// metadata; it is never surfaced through the engine's public API.
    #[error("table already exists: {statement}")]
    TableAlreadyExists {
        /// The CREATE statement that collided.
        statement: String,
    },

    /// The backend rejected a statement.
    #[error("statement failed: {statement} (args: {args}): {source}")]
    Statement {
        /// The offending statement.
        statement: String,
        /// Rendered argument list.
        args: String,
        /// The underlying driver error.
        source: rusqlite::Error,
    },
}

impl SqlError {
    /// Creates a statement error from a statement, its arguments, and the
    /// driver failure.
    pub fn statement(
        statement: impl Into<String>,
        args: &[crate::SqlValue],
        source: rusqlite::Error,
    ) -> Self {
        Self::Statement {
            statement: statement.into(),
            args: format!("{args:?}"),
            source,
        }
    }
}
