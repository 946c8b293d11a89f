//! Pooled database handle.

use std::sync::Arc;

use corral_core::{Result, Schema};
use corral_pool::{Pool, PoolConfig, PoolStats, PooledConnection};
use corral_session::Session;
use corral_sqlite::SqliteConnection;
use tracing::{debug, warn};

use crate::config::{DatabaseConfig, RetryPolicy};

/// A schema bound to a pool of store connections.
///
/// Work happens in sessions: each call to [`Database::session`] borrows a
/// connection, runs the closure in a fresh [`Session`] and commits or rolls
/// back when the closure returns.
#[derive(Debug, Clone)]
pub struct Database {
    schema: Arc<Schema>,
    pool: Pool<SqliteConnection>,
    config: DatabaseConfig,
}

impl Database {
    /// Open a database for `schema`.
    ///
    /// An in-memory store lives inside a single connection, so its pool is
    /// limited to that one connection and never recycles it.
    #[allow(clippy::result_large_err)]
    pub fn open(schema: Schema, mut config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        if config.is_memory() {
            config.pool = PoolConfig {
                min_connections: 1,
                max_connections: 1,
                idle_timeout_ms: 0,
                max_lifetime_ms: 0,
                ..config.pool
            };
        }
        let sqlite = config.sqlite.clone();
        let pool = Pool::new(config.pool.clone(), move || SqliteConnection::open(&sqlite))?;
        debug!(path = %config.sqlite.path, entities = schema.entities().count(), "Database opened");
        Ok(Self {
            schema: Arc::new(schema),
            pool,
            config,
        })
    }

    /// In-memory database with default settings.
    #[allow(clippy::result_large_err)]
    pub fn memory(schema: Schema) -> Result<Self> {
        Self::open(schema, DatabaseConfig::memory())
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    #[allow(clippy::result_large_err)]
    fn connection(&self) -> Result<PooledConnection<SqliteConnection>> {
        self.pool.acquire()
    }

    /// Open a session the caller manages; the connection returns to the pool
    /// when the session drops.
    #[allow(clippy::result_large_err)]
    pub fn open_session(&self) -> Result<Session> {
        let conn = self.connection()?;
        Ok(Session::with_config(
            self.schema.clone(),
            Box::new(conn),
            self.config.session.clone(),
        ))
    }

    /// Run `f` in a new session. `Ok` commits, `Err` rolls back.
    #[allow(clippy::result_large_err)]
    pub fn session<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        self.open_session()?.scope(f)
    }

    /// Like [`Database::session`], re-running `f` from scratch in a new
    /// session while it fails with an error the policy retries.
    #[allow(clippy::result_large_err)]
    pub fn session_with_retry<T>(
        &self,
        policy: &RetryPolicy,
        mut f: impl FnMut(&Session) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            match self.session(&mut f) {
                Err(e) if policy.should_retry(&e, attempt) => {
                    warn!(attempt, error = %e, "Session failed; retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Create every table of the schema.
    #[allow(clippy::result_large_err)]
    pub fn create_tables(&self) -> Result<()> {
        let conn = self.connection()?;
        corral_schema::create_all(&conn, &self.schema)
    }

    /// Drop every table of the schema, dependents first.
    #[allow(clippy::result_large_err)]
    pub fn drop_tables(&self) -> Result<()> {
        let conn = self.connection()?;
        corral_schema::drop_all(&conn, &self.schema)
    }
}
