//! corral - an identity-mapped object store over SQL.
//!
//! corral maps declared entities onto relational tables and gives you back
//! live objects:
//!
//! - Entities, attributes and relationships declared at runtime, with
//!   single-table inheritance
//! - One in-memory object per row and session, with change tracking and
//!   dependency-ordered writes
//! - Optimistic concurrency checks on every UPDATE and DELETE
//! - A small query language translated to SQL per dialect
//! - JSON packets with permission rules for browser clients
//!
//! # Quick Start
//!
//! ```ignore
//! use corral::prelude::*;
//!
//! let schema = Schema::builder()
//!     .entity(
//!         EntityDef::new("Person")
//!             .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
//!             .attr(Attribute::required("name", SqlType::Text))
//!             .attr(Attribute::optional("age", SqlType::Integer)),
//!     )
//!     .build()?;
//!
//! let db = Database::memory(schema)?;
//! db.create_tables()?;
//!
//! db.session(|s| {
//!     s.create("Person", vec![("name", "Ann".into()), ("age", 30.into())])?;
//!     Ok(())
//! })?;
//!
//! let adults = db.session(|s| {
//!     s.fetch_entities(&Query::select("p", "Person").filter(var("p").attr("age").ge(lit(18))))
//! })?;
//! ```

pub mod config;
pub mod database;

pub use config::{DatabaseConfig, RetryPolicy};
pub use database::Database;

pub use corral_core::{
    AttrKind, Attribute, BeginOptions, Connection, Dialect, EntityDef, EntityInfo, Error,
    ErrorKind, IsolationLevel, RelationshipKind, Result, Row, Schema, SchemaBuilder, SqlType,
    ValidationError, ValidationErrorKind, Value,
};

pub use corral_query::{Query, RawSql, lit, var};

pub use corral_schema::{create_all, create_statements, drop_all, drop_statements};

pub use corral_pool::{Pool, PoolConfig, PoolStats, PooledConnection};

pub use corral_session::{
    AttrValue, Entity, FlushResult, IntoKey, Item, Session, SessionConfig, Status, ToJsonOptions,
    TransactionMode, TransactionState,
};

pub use corral_sqlite::{OpenFlags, SqliteConfig, SqliteConnection};

pub use corral_bridge::{
    Applied, Mutation, Packet, Permission, PermissionContext, Permissions, RemoteCache, Rule,
    SaveResponse, SerializeOptions, Transport, UpdatePacket, deserialize, serialize,
};

#[cfg(feature = "http")]
pub use corral_bridge::HttpTransport;

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        // Schema
        Attribute,
        // Database
        Database,
        DatabaseConfig,
        Entity,
        EntityDef,
        Error,
        ErrorKind,
        Item,
        Packet,
        Permission,
        PermissionContext,
        Permissions,
        // Queries
        Query,
        RawSql,
        RemoteCache,
        Result,
        RetryPolicy,
        Rule,
        Schema,
        SerializeOptions,
        Session,
        SqlType,
        TransactionMode,
        UpdatePacket,
        Value,
        // Bridge
        deserialize,
        lit,
        serialize,
        var,
    };
}
