//! Shared connection handle and statement execution.

use crate::error::{SqlError, SqlResult};
use crate::value::SqlValue;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Options controlling how a connection behaves.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long to keep retrying while the database file is locked.
    pub busy_timeout: Duration,
    /// Pause between retries while locked.
    pub busy_backoff: Duration,
    /// Whether to put file-backed databases into WAL journal mode.
    pub journal_wal: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            busy_backoff: Duration::from_millis(10),
            journal_wal: true,
        }
    }
}

/// A cloneable handle to one SQLite connection.
///
/// Clones share the same underlying connection; the engine hands clones to
/// attached child stores so they run under the parent's transaction. The
/// handle is deliberately not `Send`: a connection belongs to the thread
/// that opened it.
///
/// Statement text is compiled through the driver's prepared-statement cache,
/// so repeated executions of the same fragment reuse the compiled form.
#[derive(Clone)]
pub struct SqlConnection {
    inner: Rc<ConnInner>,
}

struct ConnInner {
    conn: Connection,
    options: ConnectionOptions,
}

impl SqlConnection {
    /// Opens (or creates) a database file.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError::Open`] if the file cannot be opened, and
    /// [`SqlError::Statement`] if pragma configuration fails.
    pub fn open(path: &Path, options: ConnectionOptions) -> SqlResult<Self> {
        let conn = Connection::open(path).map_err(|source| SqlError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let handle = Self {
            inner: Rc::new(ConnInner { conn, options }),
        };
        handle.configure(true)?;
        Ok(handle)
    }

    /// Opens a fresh in-memory database.
    pub fn open_in_memory() -> SqlResult<Self> {
        Self::open_in_memory_with(ConnectionOptions::default())
    }

    /// Opens a fresh in-memory database with explicit options.
    pub fn open_in_memory_with(options: ConnectionOptions) -> SqlResult<Self> {
        let conn = Connection::open_in_memory().map_err(|source| SqlError::Open {
            path: ":memory:".to_string(),
            source,
        })?;
        let handle = Self {
            inner: Rc::new(ConnInner { conn, options }),
        };
        handle.configure(false)?;
        Ok(handle)
    }

    /// Applies the standing pragmas.
    ///
    /// WAL only applies to file-backed databases; in-memory databases report
    /// a `memory` journal mode and ignore the request.
    fn configure(&self, file_backed: bool) -> SqlResult<()> {
        let conn = &self.inner.conn;
        if file_backed && self.inner.options.journal_wal {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|source| SqlError::statement("PRAGMA journal_mode", &[], source))?;
        }
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|source| SqlError::statement("PRAGMA synchronous", &[], source))?;
        conn.pragma_update(None, "foreign_keys", "OFF")
            .map_err(|source| SqlError::statement("PRAGMA foreign_keys", &[], source))?;
        Ok(())
    }

    /// Executes a statement, returning the number of affected rows.
    ///
    /// Retries with a fixed backoff while the database is locked, up to the
    /// configured timeout; a schema-changed report from the driver causes
    /// exactly one re-execution.
    ///
    /// # Errors
    ///
    /// - [`SqlError::Timeout`] if the lock outlasts the timeout.
    /// - [`SqlError::TableAlreadyExists`] for the create-table race.
    /// - [`SqlError::Statement`] for everything else the driver rejects.
    pub fn execute(&self, sql: &str, args: &[SqlValue]) -> SqlResult<usize> {
        self.with_retry(sql, args, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            stmt.execute(params_from_iter(args.iter()))
        })
    }

    /// Runs a query and collects every row.
    ///
    /// Row shape is positional: one `SqlValue` per selected column.
    pub fn fetch(&self, sql: &str, args: &[SqlValue]) -> SqlResult<Vec<Vec<SqlValue>>> {
        self.with_retry(sql, args, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let column_count = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(args.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut fields = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    fields.push(row.get::<_, SqlValue>(i)?);
                }
                out.push(fields);
            }
            Ok(out)
        })
    }

    /// Runs a query expected to produce at most one row.
    pub fn fetch_one(&self, sql: &str, args: &[SqlValue]) -> SqlResult<Option<Vec<SqlValue>>> {
        Ok(self.fetch(sql, args)?.into_iter().next())
    }

    /// Returns the rowid assigned by the most recent INSERT.
    #[must_use]
    pub fn last_insert_rowid(&self) -> i64 {
        self.inner.conn.last_insert_rowid()
    }

    /// Checks whether the connection is outside any explicit transaction.
    #[must_use]
    pub fn is_autocommit(&self) -> bool {
        self.inner.conn.is_autocommit()
    }

    /// Checks whether two handles share the same underlying connection.
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs `op` with busy-retry and one schema-changed re-execution.
    fn with_retry<T>(
        &self,
        sql: &str,
        args: &[SqlValue],
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> SqlResult<T> {
        let deadline = Instant::now() + self.inner.options.busy_timeout;
        let mut schema_retried = false;
        loop {
            match op(&self.inner.conn) {
                Ok(value) => {
                    tracing::trace!(statement = sql, "sql ok");
                    return Ok(value);
                }
                Err(err) if is_busy(&err) => {
                    if Instant::now() >= deadline {
                        return Err(SqlError::Timeout {
                            statement: sql.to_string(),
                            timeout: self.inner.options.busy_timeout,
                            source: err,
                        });
                    }
                    tracing::debug!(statement = sql, "database busy, backing off");
                    std::thread::sleep(self.inner.options.busy_backoff);
                }
                Err(err) if is_schema_changed(&err) && !schema_retried => {
                    tracing::debug!(statement = sql, "schema changed, re-executing once");
                    schema_retried = true;
                }
                Err(err) if is_already_exists(&err) => {
                    return Err(SqlError::TableAlreadyExists {
                        statement: sql.to_string(),
                    });
                }
                Err(err) => return Err(SqlError::statement(sql, args, err)),
            }
        }
    }
}

impl std::fmt::Debug for SqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnection")
            .field("autocommit", &self.is_autocommit())
            .finish_non_exhaustive()
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

fn is_schema_changed(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::SchemaChanged
    )
}

fn is_already_exists(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => message.contains("already exists"),
        _ => false,
    }
}
