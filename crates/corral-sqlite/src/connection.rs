//! SQLite connection implementation.
//!
//! This module provides safe wrappers around SQLite's C API and implements
//! the Connection trait from corral-core.

// FFI needs exact C integer types
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::result_large_err)] // Error type is defined in corral-core
#![allow(clippy::borrow_as_ptr)] // FFI requires raw pointers

use crate::ffi;
use crate::types;
use corral_core::{
    BeginOptions, Connection, Dialect, Error, IsolationLevel, Row, Value,
    error::{ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind},
    row::ColumnInfo,
};
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:" for in-memory database.
    pub path: String,
    /// Open flags (read-only, read-write, create, etc.)
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Enforce foreign keys (`PRAGMA foreign_keys = ON`).
    pub foreign_keys: bool,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Open for reading and writing.
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
    /// Open in multi-thread mode (connections not shared between threads).
    pub no_mutex: bool,
    /// Open in serialized mode (connections can be shared).
    pub full_mutex: bool,
    /// Enable shared cache mode.
    pub shared_cache: bool,
    /// Disable shared cache mode.
    pub private_cache: bool,
}

impl OpenFlags {
    /// Create flags for read-only access.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access (database must exist).
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access with creation if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;
        let pairs = [
            (self.read_only, ffi::SQLITE_OPEN_READONLY),
            (self.read_write, ffi::SQLITE_OPEN_READWRITE),
            (self.create, ffi::SQLITE_OPEN_CREATE),
            (self.uri, ffi::SQLITE_OPEN_URI),
            (self.no_mutex, ffi::SQLITE_OPEN_NOMUTEX),
            (self.full_mutex, ffi::SQLITE_OPEN_FULLMUTEX),
            (self.shared_cache, ffi::SQLITE_OPEN_SHAREDCACHE),
            (self.private_cache, ffi::SQLITE_OPEN_PRIVATECACHE),
        ];
        for (enabled, flag) in pairs {
            if enabled {
                flags |= flag;
            }
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    /// Create a new config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a new config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Set open flags.
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set busy timeout.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

/// Inner state of the SQLite connection, protected by a mutex.
struct SqliteInner {
    db: *mut ffi::sqlite3,
    in_transaction: bool,
}

// SAFETY: the handle is only used while holding the Mutex, so it is never
// touched by two threads at once.
unsafe impl Send for SqliteInner {}

/// A connection to a SQLite database.
pub struct SqliteConnection {
    inner: Mutex<SqliteInner>,
    path: String,
    busy_timeout_ms: u32,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

impl SqliteConnection {
    /// Open a new SQLite connection with the given configuration.
    #[tracing::instrument(level = "debug", skip(config), fields(path = %config.path))]
    pub fn open(config: &SqliteConfig) -> Result<Self, Error> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "Invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db is a handle returned by open_v2; it is closed right after
                unsafe {
                    let (_, msg) = ffi::last_error(db);
                    ffi::sqlite3_close_v2(db);
                    msg
                }
            };
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("Failed to open database: {msg}"),
                source: None,
            }));
        }

        let conn = Self {
            inner: Mutex::new(SqliteInner {
                db,
                in_transaction: false,
            }),
            path: config.path.clone(),
            busy_timeout_ms: config.busy_timeout_ms,
        };
        conn.set_busy_timeout(config.busy_timeout_ms);
        if config.foreign_keys {
            conn.execute_raw("PRAGMA foreign_keys = ON")?;
        }
        tracing::debug!(version = ffi::version(), "Opened SQLite database");
        Ok(conn)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self, Error> {
        Self::open(&SqliteConfig::memory())
    }

    /// Open a file-based database.
    pub fn open_file(path: impl Into<String>) -> Result<Self, Error> {
        Self::open(&SqliteConfig::file(path))
    }

    /// Get the database path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_busy_timeout(&self, ms: u32) {
        let inner = self.lock();
        let ms = c_int::try_from(ms).unwrap_or(c_int::MAX);
        // SAFETY: db is valid while the connection lives
        unsafe {
            ffi::sqlite3_busy_timeout(inner.db, ms);
        }
    }

    /// Execute SQL directly without preparing (for DDL, etc.)
    pub fn execute_raw(&self, sql: &str) -> Result<(), Error> {
        let inner = self.lock();
        let c_sql = CString::new(sql).map_err(|_| null_byte_error(sql))?;
        let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();

        // SAFETY: All pointers are valid
        let rc = unsafe {
            ffi::sqlite3_exec(inner.db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg)
        };

        if rc != ffi::SQLITE_OK {
            let msg = if errmsg.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: errmsg was allocated by sqlite3_exec and is freed once
                unsafe {
                    let msg = CStr::from_ptr(errmsg).to_string_lossy().into_owned();
                    ffi::sqlite3_free(errmsg.cast());
                    msg
                }
            };
            return Err(query_error(error_code_to_kind(rc), sql, msg));
        }
        Ok(())
    }

    /// Get the last insert rowid.
    pub fn last_insert_rowid(&self) -> i64 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(inner.db) }
    }

    /// Get the number of rows changed by the last statement.
    pub fn changes(&self) -> u64 {
        let inner = self.lock();
        // SAFETY: db is valid
        let changes = unsafe { ffi::sqlite3_changes(inner.db) };
        u64::try_from(changes).unwrap_or(0)
    }

    /// Prepare, bind and run `sql`, collecting every row.
    fn run(&self, sql: &str, params: &[Value]) -> Result<(Vec<Row>, u64), Error> {
        let inner = self.lock();
        let stmt = Statement::prepare(inner.db, sql)?;
        stmt.bind(params)?;

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt.raw) };
        let names: Vec<String> = (0..col_count)
            // SAFETY: stmt is valid and i < column count
            .map(|i| unsafe { types::column_name(stmt.raw, i) }.unwrap_or_else(|| format!("col{i}")))
            .collect();
        let columns = Arc::new(ColumnInfo::new(names));

        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt is valid
            match unsafe { ffi::sqlite3_step(stmt.raw) } {
                ffi::SQLITE_ROW => {
                    let values = (0..col_count)
                        // SAFETY: stmt has just returned SQLITE_ROW
                        .map(|i| unsafe { types::read_column(stmt.raw, i) })
                        .collect();
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                ffi::SQLITE_DONE => break,
                _ => return Err(stmt.error()),
            }
        }
        drop(stmt);

        let changes = if col_count == 0 {
            // SAFETY: db is valid
            u64::try_from(unsafe { ffi::sqlite3_changes(inner.db) }).unwrap_or(0)
        } else {
            0
        };
        tracing::debug!(sql = %sql, params = params.len(), rows = rows.len(), changes, "SQLite statement");
        Ok((rows, changes))
    }

    fn begin_sql(options: &BeginOptions) -> &'static str {
        match (options.write, options.isolation) {
            (true, Some(IsolationLevel::Serializable)) => "BEGIN EXCLUSIVE",
            (true, _) => "BEGIN IMMEDIATE",
            (false, _) => "BEGIN DEFERRED",
        }
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if !inner.db.is_null() {
            // SAFETY: db is valid and no statement outlives a call
            unsafe {
                ffi::sqlite3_close_v2(inner.db);
            }
            inner.db = ptr::null_mut();
        }
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        self.run(sql, params).map(|(rows, _)| rows)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        self.run(sql, params).map(|(_, changes)| changes)
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64, Error> {
        self.run(sql, params)?;
        Ok(self.last_insert_rowid())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn begin(&self, options: &BeginOptions) -> Result<(), Error> {
        if self.in_transaction() {
            return Err(query_error(
                QueryErrorKind::Database,
                "BEGIN",
                "Already in a transaction".to_string(),
            ));
        }
        if options.nowait {
            self.set_busy_timeout(0);
        }
        let result = self.execute_raw(Self::begin_sql(options));
        if options.nowait {
            self.set_busy_timeout(self.busy_timeout_ms);
        }
        result?;
        self.lock().in_transaction = true;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn commit(&self) -> Result<(), Error> {
        if !self.in_transaction() {
            return Err(query_error(
                QueryErrorKind::Database,
                "COMMIT",
                "Not in a transaction".to_string(),
            ));
        }
        self.execute_raw("COMMIT")?;
        self.lock().in_transaction = false;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn rollback(&self) -> Result<(), Error> {
        if !self.in_transaction() {
            return Err(query_error(
                QueryErrorKind::Database,
                "ROLLBACK",
                "Not in a transaction".to_string(),
            ));
        }
        let result = self.execute_raw("ROLLBACK");
        self.lock().in_transaction = false;
        result
    }

    fn in_transaction(&self) -> bool {
        let inner = self.lock();
        // SAFETY: db is valid
        let autocommit = unsafe { ffi::sqlite3_get_autocommit(inner.db) } != 0;
        inner.in_transaction && !autocommit
    }

    fn ping(&self) -> Result<(), Error> {
        self.query("SELECT 1", &[]).map(|_| ())
    }
}

/// A prepared statement, finalized on drop.
struct Statement<'a> {
    raw: *mut ffi::sqlite3_stmt,
    db: *mut ffi::sqlite3,
    sql: &'a str,
}

impl<'a> Statement<'a> {
    fn prepare(db: *mut ffi::sqlite3, sql: &'a str) -> Result<Self, Error> {
        let c_sql = CString::new(sql).map_err(|_| null_byte_error(sql))?;
        let len = c_int::try_from(c_sql.as_bytes().len())
            .map_err(|_| query_error(QueryErrorKind::DataTruncation, sql, "SQL too long".into()))?;
        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();

        // SAFETY: All pointers are valid
        let rc =
            unsafe { ffi::sqlite3_prepare_v2(db, c_sql.as_ptr(), len, &mut raw, ptr::null_mut()) };
        let stmt = Self { raw, db, sql };
        if rc != ffi::SQLITE_OK {
            return Err(stmt.error());
        }
        Ok(stmt)
    }

    fn bind(&self, params: &[Value]) -> Result<(), Error> {
        for (i, param) in params.iter().enumerate() {
            let index = c_int::try_from(i + 1).unwrap_or(c_int::MAX);
            // SAFETY: stmt is valid, index is 1-based
            let rc = unsafe { types::bind_value(self.raw, index, param) };
            if rc != ffi::SQLITE_OK {
                // SAFETY: db is valid
                let (_, msg) = unsafe { ffi::last_error(self.db) };
                return Err(query_error(
                    QueryErrorKind::Database,
                    self.sql,
                    format!("Failed to bind parameter {}: {msg}", i + 1),
                ));
            }
        }
        Ok(())
    }

    fn error(&self) -> Error {
        // SAFETY: db is valid
        let (code, msg) = unsafe { ffi::last_error(self.db) };
        query_error(error_code_to_kind(code), self.sql, msg)
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            // SAFETY: raw was produced by prepare_v2 and is finalized once
            unsafe { ffi::sqlite3_finalize(self.raw) };
        }
    }
}

fn query_error(kind: QueryErrorKind, sql: &str, message: String) -> Error {
    Error::Query(QueryError {
        kind,
        sql: Some(sql.to_string()),
        message,
        detail: None,
        source: None,
    })
}

fn null_byte_error(sql: &str) -> Error {
    query_error(QueryErrorKind::Syntax, sql, "SQL contains null byte".to_string())
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    // Extended codes keep the primary code in the low byte.
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH | ffi::SQLITE_READONLY => QueryErrorKind::Permission,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        ffi::SQLITE_TOOBIG => QueryErrorKind::DataTruncation,
        ffi::SQLITE_INTERRUPT => QueryErrorKind::Cancelled,
        ffi::SQLITE_ERROR => QueryErrorKind::Syntax,
        _ => QueryErrorKind::Database,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::ErrorKind;

    fn people() -> SqliteConnection {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .unwrap();
        conn
    }

    #[test]
    fn test_open_memory() {
        let conn = SqliteConnection::open_memory().unwrap();
        assert_eq!(conn.path(), ":memory:");
        assert!(conn.ping().is_ok());
    }

    #[test]
    fn test_parameterized_query() {
        let conn = people();
        let id = conn
            .insert(
                "INSERT INTO test (name, age) VALUES (?1, ?2)",
                &[Value::Text("Alice".to_string()), Value::Int(30)],
            )
            .unwrap();
        assert_eq!(id, 1);

        let rows = conn
            .query("SELECT * FROM test WHERE name = ?1", &[Value::from("Alice")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "Alice");
        assert_eq!(rows[0].get_named::<i32>("age").unwrap(), 30);
    }

    #[test]
    fn test_execute_reports_changes() {
        let conn = people();
        conn.execute_raw("INSERT INTO test (name, age) VALUES ('a', 1), ('b', 2), ('c', 3)")
            .unwrap();
        let changed = conn
            .execute("UPDATE test SET age = age + 1 WHERE age > ?1", &[Value::Int(1)])
            .unwrap();
        assert_eq!(changed, 2);
        let changed = conn
            .execute("UPDATE test SET age = 0 WHERE id = ?1", &[Value::Int(99)])
            .unwrap();
        assert_eq!(changed, 0);
    }

    #[test]
    fn test_null_handling() {
        let conn = people();
        conn.execute("INSERT INTO test (name) VALUES (?1)", &[Value::Null])
            .unwrap();
        let rows = conn.query("SELECT name FROM test", &[]).unwrap();
        assert_eq!(rows[0].get(0), Some(&Value::Null));
    }

    #[test]
    fn test_transaction() {
        let conn = people();
        conn.begin(&BeginOptions::default()).unwrap();
        assert!(conn.in_transaction());
        conn.execute("INSERT INTO test (name) VALUES (?1)", &[Value::from("Alice")])
            .unwrap();
        conn.rollback().unwrap();
        assert!(!conn.in_transaction());
        assert!(conn.query("SELECT * FROM test", &[]).unwrap().is_empty());

        conn.begin(&BeginOptions::write()).unwrap();
        conn.execute("INSERT INTO test (name) VALUES (?1)", &[Value::from("Bob")])
            .unwrap();
        conn.commit().unwrap();
        assert_eq!(conn.query("SELECT * FROM test", &[]).unwrap().len(), 1);
        assert!(conn.commit().is_err());
    }

    #[test]
    fn test_savepoint_rollback_keeps_earlier_rows() {
        let conn = people();
        conn.begin(&BeginOptions::write()).unwrap();
        conn.execute("INSERT INTO test (name) VALUES (?1)", &[Value::from("kept")])
            .unwrap();
        conn.savepoint("sp1").unwrap();
        conn.execute("INSERT INTO test (name) VALUES (?1)", &[Value::from("undone")])
            .unwrap();
        conn.rollback_to("sp1").unwrap();
        conn.release("sp1").unwrap();
        assert!(conn.in_transaction());
        conn.commit().unwrap();

        let rows = conn.query("SELECT name FROM test", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "kept");
    }

    #[test]
    fn test_value_storage() {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE types (b BOOLEAN, d DATE, j TEXT, bl BLOB, f REAL)")
            .unwrap();
        conn.execute(
            "INSERT INTO types VALUES (?1, ?2, ?3, ?4, ?5)",
            &[
                Value::Bool(true),
                Value::Date(19_000),
                Value::Json(serde_json::json!({"a": [1, 2]})),
                Value::Bytes(vec![1, 2, 3]),
                Value::Double(2.5),
            ],
        )
        .unwrap();
        let row = conn.query("SELECT * FROM types", &[]).unwrap().remove(0);
        assert_eq!(row.get(0), Some(&Value::Int(1)));
        assert_eq!(row.get(1), Some(&Value::Int(19_000)));
        assert_eq!(row.get(2), Some(&Value::Text("{\"a\":[1,2]}".to_string())));
        assert_eq!(row.get(3), Some(&Value::Bytes(vec![1, 2, 3])));
        assert_eq!(row.get(4), Some(&Value::Double(2.5)));
    }

    #[test]
    fn test_constraint_errors() {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE u (name TEXT UNIQUE)").unwrap();
        conn.execute("INSERT INTO u VALUES (?1)", &[Value::from("x")])
            .unwrap();
        let err = conn
            .execute("INSERT INTO u VALUES (?1)", &[Value::from("x")])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        assert!(err.sql().is_some());
    }

    #[test]
    fn test_busy_nowait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db").to_string_lossy().to_string();
        let first = SqliteConnection::open_file(path.clone()).unwrap();
        first.execute_raw("CREATE TABLE t (x INTEGER)").unwrap();
        let second = SqliteConnection::open(&SqliteConfig::file(path).busy_timeout(50)).unwrap();

        first.begin(&BeginOptions::write()).unwrap();
        let err = second
            .begin(&BeginOptions::write().nowait(true))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(err.is_retryable());
        first.commit().unwrap();
        second.begin(&BeginOptions::write()).unwrap();
        second.rollback().unwrap();
    }

    #[test]
    fn test_open_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flags.db").to_string_lossy().to_string();
        let conn = SqliteConnection::open(
            &SqliteConfig::file(path.clone()).flags(OpenFlags::create_read_write()),
        )
        .unwrap();
        conn.execute_raw("CREATE TABLE test (id INTEGER)").unwrap();
        drop(conn);

        let conn =
            SqliteConnection::open(&SqliteConfig::file(path).flags(OpenFlags::read_only()))
                .unwrap();
        assert!(conn.query("SELECT * FROM test", &[]).unwrap().is_empty());
        assert!(conn.execute_raw("INSERT INTO test VALUES (1)").is_err());
    }
}
