//! Declarative queries and SQL generation for corral.
//!
//! `corral-query` is the **query construction layer**. It turns declarative
//! [`Query`] values over a [`Schema`](corral_core::Schema) into executable SQL
//! plus parameters.
//!
//! # Role In The Architecture
//!
//! - **Terms**: [`var`], attribute paths, operators, functions and aggregates
//!   build conditions and projections.
//! - **Translation**: [`Translator`] resolves paths into aliases and joins,
//!   places aggregates in joins or correlated subqueries, and splits filters
//!   between WHERE and HAVING.
//! - **Dialect support**: generates SQL for Postgres, MySQL, and SQLite.
//! - **DML**: [`Insert`], [`Update`] and [`Delete`] statements for session flushes.
//!
//! The resulting statements execute through the `Connection` trait from
//! `corral-core`. Most users access these types via the `corral` facade crate.

pub mod cache;
pub mod clause;
pub mod dml;
pub mod expr;
pub mod join;
pub mod query;
pub mod raw;
pub mod select;
pub mod term;
pub mod translate;

pub use cache::TranslationCache;
pub use clause::{Limit, Offset, OrderBy, OrderDirection};
pub use corral_core::Dialect;
pub use dml::{Delete, Insert, Update, column_matches, key_matches};
pub use expr::{BinaryOp, Expr, FragmentPart, UnaryOp};
pub use join::{Join, JoinType};
pub use query::{IterVar, Ordering, Query, Source};
pub use raw::{RawSql, raw};
pub use select::{FromItem, SelectStatement};
pub use term::{
    AggFunc, Func, Term, abs, avg, coalesce, count, count_all, count_distinct, exists, length,
    lit, lower, max, min, param, sum, upper, var,
};
pub use translate::{ItemShape, Translated, Translator};
