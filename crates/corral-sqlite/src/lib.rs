//! SQLite driver for corral.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! This crate provides a blocking SQLite driver on top of `libsqlite3-sys`
//! (bundled amalgamation). It implements the `Connection` trait from
//! corral-core so sessions and pools can run against it.
//!
//! # Features
//!
//! - Full Connection trait implementation
//! - `BEGIN DEFERRED`/`IMMEDIATE`/`EXCLUSIVE` selected from [`BeginOptions`](corral_core::BeginOptions)
//! - Lock contention reported as retryable `Busy` errors
//! - In-memory and file-based databases
//! - Configurable open flags, busy timeout and foreign key enforcement
//!
//! # Example
//!
//! ```rust,ignore
//! use corral_sqlite::SqliteConnection;
//! use corral_core::{Connection, Value};
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//! let id = conn.insert("INSERT INTO users (name) VALUES (?1)", &[Value::from("Alice")])?;
//! ```
//!
//! See [`types`] for how values map onto SQLite storage classes.
//!
//! # Thread Safety
//!
//! `SqliteConnection` is `Send` and `Sync`; an internal mutex serializes
//! access to the underlying handle.

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteConnection};

/// Re-export the SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// Re-export the SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(
            version.starts_with('3'),
            "Expected SQLite 3.x, got {}",
            version
        );
    }

    #[test]
    fn test_sqlite_version_number() {
        let num = sqlite_version_number();
        assert!(
            num >= 3_000_000,
            "Expected SQLite 3.x.x (>= 3000000), got {}",
            num
        );
    }
}
