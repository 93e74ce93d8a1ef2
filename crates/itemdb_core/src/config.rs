//! Store configuration.

use itemdb_sql::ConnectionOptions;
use std::time::Duration;

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to error if the store already exists.
    pub error_if_exists: bool,

    /// How long to retry while the database file is locked.
    pub busy_timeout: Duration,

    /// Pause between lock retries.
    pub busy_backoff: Duration,

    /// Whether file-backed databases use WAL journal mode.
    pub journal_wal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            busy_timeout: Duration::from_secs(5),
            busy_backoff: Duration::from_millis(10),
            journal_wal: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to error if the store exists.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets the pause between lock retries.
    #[must_use]
    pub const fn busy_backoff(mut self, backoff: Duration) -> Self {
        self.busy_backoff = backoff;
        self
    }

    /// Sets whether to use WAL journal mode for file-backed stores.
    #[must_use]
    pub const fn journal_wal(mut self, value: bool) -> Self {
        self.journal_wal = value;
        self
    }

    /// Renders the connection options for the SQL adapter.
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            busy_timeout: self.busy_timeout,
            busy_backoff: self.busy_backoff,
            journal_wal: self.journal_wal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(!config.error_if_exists);
        assert!(config.journal_wal);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .journal_wal(false)
            .busy_timeout(Duration::from_secs(1));

        assert!(!config.create_if_missing);
        assert!(!config.journal_wal);
        assert_eq!(config.busy_timeout, Duration::from_secs(1));
        assert_eq!(
            config.connection_options().busy_timeout,
            Duration::from_secs(1)
        );
    }
}
