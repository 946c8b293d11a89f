//! Database connection traits.
//!
//! - [`Connection`] - blocking interface the session layer drives
//! - [`Dialect`] - SQL spelling differences between backends
//! - [`IsolationLevel`] and [`BeginOptions`] - how a transaction is opened

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// SQL dialect of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// SQLite (uses ?1, ?2 placeholders)
    #[default]
    Sqlite,
    /// PostgreSQL (uses $1, $2 placeholders)
    Postgres,
    /// MySQL (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier, doubling embedded quote characters.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
            Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// Whether `SELECT ... FOR UPDATE` is understood.
    pub const fn supports_row_locks(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Mysql)
    }

    /// Clause allowing an OFFSET without a LIMIT.
    pub const fn unbounded_limit(self) -> Option<&'static str> {
        match self {
            Dialect::Sqlite => Some("LIMIT -1"),
            Dialect::Mysql => Some("LIMIT 18446744073709551615"),
            Dialect::Postgres => None,
        }
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    /// The default for PostgreSQL.
    #[default]
    ReadCommitted,
    RepeatableRead,
    /// SQLite transactions always run at this level.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// How to open a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeginOptions {
    /// Requested isolation; `None` keeps the backend default.
    pub isolation: Option<IsolationLevel>,
    /// Take the write lock up front (`BEGIN IMMEDIATE` on SQLite).
    pub write: bool,
    /// Fail at once instead of waiting for a lock.
    pub nowait: bool,
}

impl BeginOptions {
    pub fn write() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    pub fn isolation(mut self, level: Option<IsolationLevel>) -> Self {
        self.isolation = level;
        self
    }

    pub fn nowait(mut self, nowait: bool) -> Self {
        self.nowait = nowait;
        self
    }
}

/// A blocking database connection.
///
/// Implementations hold at most one open transaction. Statements issued
/// outside [`Connection::begin`]/[`Connection::commit`] run in autocommit mode.
pub trait Connection: Send {
    /// SQL dialect spoken by this connection.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a query and return the first row, if any.
    fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute an INSERT and return the last inserted ID.
    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64>;

    /// Open a transaction.
    fn begin(&self, options: &BeginOptions) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Whether a transaction is currently open.
    fn in_transaction(&self) -> bool;

    /// Create a savepoint within the open transaction.
    fn savepoint(&self, name: &str) -> Result<()> {
        self.execute(&format!("SAVEPOINT {name}"), &[]).map(|_| ())
    }

    /// Discard everything done since the savepoint; the transaction and the
    /// savepoint stay open.
    fn rollback_to(&self, name: &str) -> Result<()> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
            .map(|_| ())
    }

    /// Forget the savepoint, keeping its changes in the transaction.
    fn release(&self, name: &str) -> Result<()> {
        self.execute(&format!("RELEASE SAVEPOINT {name}"), &[]).map(|_| ())
    }

    /// Check that the connection is still usable.
    fn ping(&self) -> Result<()> {
        self.query("SELECT 1", &[]).map(|_| ())
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        (**self).query_one(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute(sql, params)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        (**self).insert(sql, params)
    }

    fn begin(&self, options: &BeginOptions) -> Result<()> {
        (**self).begin(options)
    }

    fn commit(&self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<()> {
        (**self).rollback()
    }

    fn in_transaction(&self) -> bool {
        (**self).in_transaction()
    }

    fn savepoint(&self, name: &str) -> Result<()> {
        (**self).savepoint(name)
    }

    fn rollback_to(&self, name: &str) -> Result<()> {
        (**self).rollback_to(name)
    }

    fn release(&self, name: &str) -> Result<()> {
        (**self).release(name)
    }

    fn ping(&self) -> Result<()> {
        (**self).ping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_and_quoting() {
        assert_eq!(Dialect::Sqlite.placeholder(3), "?3");
        assert_eq!(Dialect::Postgres.placeholder(1), "$1");
        assert_eq!(Dialect::Mysql.placeholder(9), "?");
        assert_eq!(Dialect::Sqlite.quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(Dialect::Mysql.quote_identifier("a`b"), "`a``b`");
    }

    #[test]
    fn row_locks_only_on_server_backends() {
        assert!(!Dialect::Sqlite.supports_row_locks());
        assert!(Dialect::Postgres.supports_row_locks());
        assert_eq!(Dialect::Postgres.unbounded_limit(), None);
    }

    #[test]
    fn begin_options_builder() {
        let opts = BeginOptions::write()
            .isolation(Some(IsolationLevel::Serializable))
            .nowait(true);
        assert!(opts.write && opts.nowait);
        assert_eq!(opts.isolation.map(|i| i.as_sql()), Some("SERIALIZABLE"));
    }
}
