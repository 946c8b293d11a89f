//! Blocking connection pooling for corral.
//!
//! A [`Pool`] hands out [`PooledConnection`]s built by a factory closure.
//! Connections go back to the pool when the guard drops; a transaction left
//! open is rolled back first, and a connection that cannot be rolled back is
//! discarded. Idle connections are reused most-recently-returned first.

#![allow(clippy::result_large_err)]

use corral_core::{
    BeginOptions, Connection, Dialect, Error, Result, Row, Value,
    error::{PoolError, PoolErrorKind},
};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Connection pool configuration.
///
/// Timeouts are in milliseconds; `0` disables the idle timeout and the
/// maximum lifetime.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections to maintain
    pub min_connections: usize,
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Connection idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum lifetime of a connection in milliseconds
    pub max_lifetime_ms: u64,
    /// Test connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout_ms: 600_000,   // 10 minutes
            acquire_timeout_ms: 30_000, // 30 seconds
            max_lifetime_ms: 1_800_000, // 30 minutes
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Set minimum connections.
    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    /// Set idle timeout.
    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set max lifetime.
    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    /// Check the bounds before a pool is built.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(pool_error(
                PoolErrorKind::Config,
                "max_connections must be at least 1",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(pool_error(
                PoolErrorKind::Config,
                format!(
                    "min_connections ({}) exceeds max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            ));
        }
        Ok(())
    }

    fn is_stale(&self, idle: &IdleConnection<impl Sized>, now: Instant) -> bool {
        let expired = |since: Instant, ms: u64| {
            ms > 0 && now.duration_since(since) >= Duration::from_millis(ms)
        };
        expired(idle.idle_since, self.idle_timeout_ms) || expired(idle.created_at, self.max_lifetime_ms)
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of active connections
    pub active_connections: usize,
    /// Number of pending acquire requests
    pub pending_requests: usize,
    /// Connections opened over the pool's lifetime
    pub connections_created: u64,
}

/// Builds a new connection for the pool.
pub type ConnectionFactory<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

struct IdleConnection<C> {
    conn: C,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    total: usize,
    waiting: usize,
    created: u64,
    closed: bool,
}

struct Shared<C> {
    config: PoolConfig,
    factory: ConnectionFactory<C>,
    state: Mutex<PoolState<C>>,
    available: Condvar,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, mut idle: IdleConnection<C>) {
        let mut state = self.lock();
        if state.closed {
            state.total -= 1;
        } else {
            idle.idle_since = Instant::now();
            state.idle.push_back(idle);
        }
        drop(state);
        self.available.notify_one();
    }

    fn discard(&self) {
        let mut state = self.lock();
        state.total -= 1;
        drop(state);
        self.available.notify_one();
    }
}

enum Slot<C> {
    Idle(IdleConnection<C>),
    Open,
}

/// A bounded, thread-safe pool of blocking connections.
pub struct Pool<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<C: Connection + 'static> Pool<C> {
    /// Create a new connection pool and open `min_connections` up front.
    pub fn new(
        config: PoolConfig,
        factory: impl Fn() -> Result<C> + Send + Sync + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            shared: Arc::new(Shared {
                config,
                factory: Box::new(factory),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    waiting: 0,
                    created: 0,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        };

        for _ in 0..pool.shared.config.min_connections {
            let conn = pool.open()?;
            let now = Instant::now();
            let mut state = pool.shared.lock();
            state.total += 1;
            state.idle.push_back(IdleConnection {
                conn,
                created_at: now,
                idle_since: now,
            });
        }
        tracing::debug!(
            min = pool.shared.config.min_connections,
            max = pool.shared.config.max_connections,
            "Connection pool created"
        );
        Ok(pool)
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle.len(),
            active_connections: state.total - state.idle.len(),
            pending_requests: state.waiting,
            connections_created: state.created,
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.shared.lock().total >= self.shared.config.max_connections
    }

    /// Check out a connection, waiting up to the acquire timeout.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn acquire(&self) -> Result<PooledConnection<C>> {
        let deadline = Instant::now() + Duration::from_millis(self.shared.config.acquire_timeout_ms);
        loop {
            let slot = self.next_slot(deadline)?;
            let reused = matches!(slot, Slot::Idle(_));
            let idle = match slot {
                Slot::Idle(idle) => idle,
                Slot::Open => {
                    let conn = match self.open() {
                        Ok(conn) => conn,
                        Err(e) => {
                            self.shared.discard();
                            return Err(e);
                        }
                    };
                    let now = Instant::now();
                    IdleConnection {
                        conn,
                        created_at: now,
                        idle_since: now,
                    }
                }
            };

            if self.shared.config.test_on_checkout {
                if let Err(e) = idle.conn.ping() {
                    drop(idle);
                    self.shared.discard();
                    if reused {
                        tracing::warn!(error = %e, "Discarding connection that failed checkout test");
                        continue;
                    }
                    return Err(Error::Pool(PoolError {
                        kind: PoolErrorKind::Connect,
                        message: format!("New connection failed checkout test: {e}"),
                        source: None,
                    }));
                }
            }
            return Ok(PooledConnection {
                conn: Some(idle),
                shared: Arc::clone(&self.shared),
            });
        }
    }

    /// Close the pool. Idle connections are dropped now, checked-out ones
    /// when they are returned.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        let drained = state.idle.len();
        state.idle.clear();
        state.total -= drained;
        drop(state);
        self.shared.available.notify_all();
        tracing::debug!(drained, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn open(&self) -> Result<C> {
        let conn = (self.shared.factory)().map_err(|e| {
            Error::Pool(PoolError {
                kind: PoolErrorKind::Connect,
                message: format!("Failed to open connection: {e}"),
                source: None,
            })
        })?;
        self.shared.lock().created += 1;
        Ok(conn)
    }

    /// Reserve either an idle connection or room to open a new one.
    fn next_slot(&self, deadline: Instant) -> Result<Slot<C>> {
        let config = &self.shared.config;
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(pool_error(PoolErrorKind::Closed, "Pool is closed"));
            }

            let now = Instant::now();
            while let Some(idle) = state.idle.pop_back() {
                if config.is_stale(&idle, now) {
                    state.total -= 1;
                    continue;
                }
                return Ok(Slot::Idle(idle));
            }
            if state.total < config.max_connections {
                state.total += 1;
                return Ok(Slot::Open);
            }

            if now >= deadline {
                return Err(pool_error(
                    PoolErrorKind::Timeout,
                    format!(
                        "Timed out after {}ms waiting for a connection",
                        config.acquire_timeout_ms
                    ),
                ));
            }
            state.waiting += 1;
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            state.waiting -= 1;
        }
    }
}

/// A connection borrowed from the pool.
///
/// Returned to the pool on drop.
pub struct PooledConnection<C: Connection> {
    conn: Option<IdleConnection<C>>,
    shared: Arc<Shared<C>>,
}

impl<C: Connection> PooledConnection<C> {
    fn inner(&self) -> &C {
        // Only taken in Drop.
        match &self.conn {
            Some(idle) => &idle.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Connection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("released", &self.conn.is_none())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.inner()
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(idle) = self.conn.take() else {
            return;
        };
        if idle.conn.in_transaction() {
            tracing::debug!("Rolling back transaction left open on returned connection");
            if let Err(e) = idle.conn.rollback() {
                tracing::warn!(error = %e, "Rollback failed; discarding connection");
                drop(idle);
                self.shared.discard();
                return;
            }
        }
        self.shared.release(idle);
    }
}

impl<C: Connection> Connection for PooledConnection<C> {
    fn dialect(&self) -> Dialect {
        self.inner().dialect()
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.inner().query(sql, params)
    }

    fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        self.inner().query_one(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner().execute(sql, params)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.inner().insert(sql, params)
    }

    fn begin(&self, options: &BeginOptions) -> Result<()> {
        self.inner().begin(options)
    }

    fn commit(&self) -> Result<()> {
        self.inner().commit()
    }

    fn rollback(&self) -> Result<()> {
        self.inner().rollback()
    }

    fn in_transaction(&self) -> bool {
        self.inner().in_transaction()
    }

    fn savepoint(&self, name: &str) -> Result<()> {
        self.inner().savepoint(name)
    }

    fn rollback_to(&self, name: &str) -> Result<()> {
        self.inner().rollback_to(name)
    }

    fn release(&self, name: &str) -> Result<()> {
        self.inner().release(name)
    }

    fn ping(&self) -> Result<()> {
        self.inner().ping()
    }
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}
