//! JOIN clause types.

use crate::expr::Expr;
use corral_core::{Dialect, Value};

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// Type of join
    pub join_type: JoinType,
    /// Table to join
    pub table: String,
    /// Table alias
    pub alias: String,
    /// ON condition; `None` for CROSS JOIN
    pub on: Option<Expr>,
}

/// Types of SQL joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Cross,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Cross => "CROSS JOIN",
        }
    }
}

impl Join {
    /// Create an INNER JOIN.
    pub fn inner(table: impl Into<String>, alias: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type: JoinType::Inner,
            table: table.into(),
            alias: alias.into(),
            on: Some(on),
        }
    }

    /// Create a LEFT JOIN.
    pub fn left(table: impl Into<String>, alias: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type: JoinType::Left,
            table: table.into(),
            alias: alias.into(),
            on: Some(on),
        }
    }

    /// Create a CROSS JOIN.
    pub fn cross(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            join_type: JoinType::Cross,
            table: table.into(),
            alias: alias.into(),
            on: None,
        }
    }

    /// Generate SQL for this JOIN clause.
    pub fn build(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        let mut sql = format!(
            " {} {} AS {}",
            self.join_type.as_str(),
            dialect.quote_identifier(&self.table),
            dialect.quote_identifier(&self.alias)
        );
        if let Some(on) = &self.on {
            sql.push_str(" ON ");
            sql.push_str(&on.build_with_dialect(dialect, params));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_rendering() {
        let mut params = Vec::new();
        let join = Join::left(
            "Car",
            "p_cars",
            Expr::qualified("p_cars", "owner").eq(Expr::qualified("p", "id")),
        );
        assert_eq!(
            join.build(Dialect::Sqlite, &mut params),
            " LEFT JOIN \"Car\" AS \"p_cars\" ON \"p_cars\".\"owner\" = \"p\".\"id\""
        );
        assert_eq!(
            Join::cross("Person", "q").build(Dialect::Postgres, &mut params),
            " CROSS JOIN \"Person\" AS \"q\""
        );
        assert!(params.is_empty());
    }
}
