//! Database and retry configuration.

use corral_core::error::ConfigError;
use corral_core::{Dialect, Error, ErrorKind, IsolationLevel, Result};
use corral_pool::PoolConfig;
use corral_session::{SessionConfig, TransactionMode};
use corral_sqlite::SqliteConfig;

/// Everything needed to open a [`Database`](crate::Database).
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Store dialect; only SQLite has a bundled driver
    pub dialect: Dialect,
    pub pool: PoolConfig,
    /// Defaults for every session opened by the database
    pub session: SessionConfig,
    pub sqlite: SqliteConfig,
}

impl DatabaseConfig {
    /// In-memory SQLite database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// SQLite database file at `path`, created when missing.
    pub fn sqlite_file(path: impl Into<String>) -> Self {
        Self {
            sqlite: SqliteConfig::file(path),
            ..Self::default()
        }
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn sqlite(mut self, sqlite: SqliteConfig) -> Self {
        self.sqlite = sqlite;
        self
    }

    pub fn mode(mut self, mode: TransactionMode) -> Self {
        self.session.mode = mode;
        self
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.session.isolation = Some(level);
        self
    }

    /// Whether every connection would open its own private database.
    pub fn is_memory(&self) -> bool {
        self.sqlite.path.is_empty() || self.sqlite.path == ":memory:"
    }

    /// Check the combination before any connection is opened.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.dialect != Dialect::Sqlite {
            return Err(Error::Config(ConfigError {
                message: format!("no bundled driver for {:?}", self.dialect),
                source: None,
            }));
        }
        self.pool.validate()
    }
}

/// Re-run a whole session when it fails with one of the listed error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of runs, including the first
    pub attempts: u32,
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_on: vec![ErrorKind::Conflict, ErrorKind::Busy],
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Whether `err` earns another run after `attempt` runs.
    pub fn should_retry(&self, err: &Error, attempt: u32) -> bool {
        attempt < self.attempts && self.retry_on.contains(&err.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::error::ConflictError;

    fn conflict() -> Error {
        Error::Conflict(ConflictError {
            entity: "Person".into(),
            key: Vec::new(),
            attrs: vec!["age".into()],
        })
    }

    #[test]
    fn test_retry_policy_counts_runs() {
        let policy = RetryPolicy::new(2);
        assert!(policy.should_retry(&conflict(), 1));
        assert!(!policy.should_retry(&conflict(), 2));
        assert!(!policy.should_retry(&Error::Custom("boom".into()), 1));

        let none = RetryPolicy::new(5).retry_on([]);
        assert!(!none.should_retry(&conflict(), 1));
    }

    #[test]
    fn test_config_builders() {
        let config = DatabaseConfig::sqlite_file("/tmp/x.db")
            .mode(TransactionMode::Strict)
            .isolation(IsolationLevel::Serializable);
        assert!(!config.is_memory());
        assert_eq!(config.session.mode, TransactionMode::Strict);
        assert_eq!(config.session.isolation, Some(IsolationLevel::Serializable));
        assert!(DatabaseConfig::memory().is_memory());
    }

    #[test]
    fn test_validate_rejects_driverless_dialect() {
        let config = DatabaseConfig {
            dialect: Dialect::Postgres,
            ..DatabaseConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(DatabaseConfig::memory().validate().is_ok());
    }
}
