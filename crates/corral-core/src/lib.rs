//! Core types and traits for corral.
//!
//! - [`Value`] and [`SqlType`] for dynamically typed column data
//! - [`Attribute`], [`EntityDef`] and the validated [`Schema`] registry
//! - [`Connection`] for blocking database access
//! - [`Error`] and [`Result`] shared by every corral crate

pub mod attribute;
pub mod connection;
pub mod entity;
pub mod error;
pub mod relationship;
pub mod row;
pub mod schema;
pub mod types;
pub mod validate;
pub mod value;

pub use attribute::{AttrKind, Attribute};
pub use connection::{BeginOptions, Connection, Dialect, IsolationLevel};
pub use entity::{EntityDef, EntityInfo};
pub use error::{Error, ErrorKind, Result, ValidationError, ValidationErrorKind};
pub use relationship::{LinkTableInfo, RelationshipInfo, RelationshipKind};
pub use row::{ColumnInfo, Row};
pub use schema::{ColumnDef, Schema, SchemaBuilder};
pub use types::SqlType;
pub use value::Value;
