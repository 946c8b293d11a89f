//! SELECT statement rendering.

use crate::clause::{Limit, Offset, OrderBy};
use crate::expr::Expr;
use crate::join::Join;
use corral_core::{Dialect, Value};

/// Source of a SELECT.
#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table { table: String, alias: String },
    Subquery { select: Box<SelectStatement>, alias: String },
}

/// A fully resolved SELECT statement.
///
/// Built by the translator; rendering only concatenates clauses and binds
/// values in textual order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectStatement {
    pub distinct: bool,
    pub columns: Vec<Expr>,
    pub from: Option<FromItem>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<Limit>,
    pub offset: Option<Offset>,
    /// `FOR UPDATE`, with `NOWAIT` when true
    pub lock: Option<bool>,
}

impl SelectStatement {
    /// SELECT from a table under an alias.
    pub fn from_table(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            from: Some(FromItem::Table {
                table: table.into(),
                alias: alias.into(),
            }),
            ..Self::default()
        }
    }

    /// Add a select-list expression.
    pub fn column(mut self, expr: Expr) -> Self {
        self.columns.push(expr);
        self
    }

    /// AND a condition onto WHERE.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Render with `?N`/`$N`/`?` placeholders, appending bound values to `params`.
    pub fn build(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        if self.columns.is_empty() {
            sql.push('*');
        } else {
            let cols: Vec<String> = self
                .columns
                .iter()
                .map(|c| c.build_with_dialect(dialect, params))
                .collect();
            sql.push_str(&cols.join(", "));
        }

        match &self.from {
            Some(FromItem::Table { table, alias }) => {
                sql.push_str(" FROM ");
                sql.push_str(&dialect.quote_identifier(table));
                sql.push_str(" AS ");
                sql.push_str(&dialect.quote_identifier(alias));
            }
            Some(FromItem::Subquery { select, alias }) => {
                let inner = select.build(dialect, params);
                sql.push_str(&format!(
                    " FROM ({inner}) AS {}",
                    dialect.quote_identifier(alias)
                ));
            }
            None => {}
        }

        for join in &self.joins {
            sql.push_str(&join.build(dialect, params));
        }

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.build_with_dialect(dialect, params));
        }

        if !self.group_by.is_empty() {
            let cols: Vec<String> = self
                .group_by
                .iter()
                .map(|e| e.build_with_dialect(dialect, params))
                .collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&cols.join(", "));
        }

        if let Some(having) = &self.having {
            sql.push_str(" HAVING ");
            sql.push_str(&having.build_with_dialect(dialect, params));
        }

        if !self.order_by.is_empty() {
            let items: Vec<String> = self
                .order_by
                .iter()
                .map(|o| o.build(dialect, params))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&items.join(", "));
        }

        match (self.limit, self.offset) {
            (Some(Limit(limit)), offset) => {
                sql.push_str(&format!(" LIMIT {limit}"));
                if let Some(Offset(offset)) = offset {
                    sql.push_str(&format!(" OFFSET {offset}"));
                }
            }
            (None, Some(Offset(offset))) => {
                if let Some(unbounded) = dialect.unbounded_limit() {
                    sql.push(' ');
                    sql.push_str(unbounded);
                }
                sql.push_str(&format!(" OFFSET {offset}"));
            }
            (None, None) => {}
        }

        if let Some(nowait) = self.lock {
            if dialect.supports_row_locks() {
                sql.push_str(" FOR UPDATE");
                if nowait {
                    sql.push_str(" NOWAIT");
                }
            }
        }

        sql
    }

    /// Render as a standalone statement.
    pub fn to_sql(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.build(dialect, &mut params);
        (sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> SelectStatement {
        SelectStatement::from_table("Person", "p")
            .column(Expr::qualified("p", "id"))
            .column(Expr::qualified("p", "name"))
    }

    #[test]
    fn basic_select() {
        let (sql, params) = people()
            .filter(Expr::qualified("p", "age").gt(20))
            .to_sql(Dialect::Sqlite);
        assert_eq!(
            sql,
            "SELECT \"p\".\"id\", \"p\".\"name\" FROM \"Person\" AS \"p\" WHERE \"p\".\"age\" > ?1"
        );
        assert_eq!(params, vec![Value::Int(20)]);
    }

    #[test]
    fn offset_without_limit() {
        let mut select = people();
        select.offset = Some(Offset(10));
        assert!(select.to_sql(Dialect::Sqlite).0.ends_with(" LIMIT -1 OFFSET 10"));
        assert!(select.to_sql(Dialect::Postgres).0.ends_with("\"p\" OFFSET 10"));
    }

    #[test]
    fn row_locks_only_where_supported() {
        let mut select = people();
        select.lock = Some(true);
        assert!(select.to_sql(Dialect::Postgres).0.ends_with(" FOR UPDATE NOWAIT"));
        assert!(!select.to_sql(Dialect::Sqlite).0.contains("FOR UPDATE"));
    }

    #[test]
    fn subquery_params_keep_textual_order() {
        let inner = SelectStatement::from_table("Car", "c")
            .column(Expr::count_star())
            .filter(Expr::qualified("c", "price").gt(5));
        let select = people()
            .column(Expr::Subquery(Box::new(inner)))
            .filter(Expr::qualified("p", "age").gt(20));
        let (sql, params) = select.to_sql(Dialect::Postgres);
        assert!(sql.contains("\"c\".\"price\" > $1"));
        assert!(sql.contains("\"p\".\"age\" > $2"));
        assert_eq!(params, vec![Value::Int(5), Value::Int(20)]);
    }

    #[test]
    fn wrapped_count() {
        let mut inner = people();
        inner.distinct = true;
        let outer = SelectStatement {
            columns: vec![Expr::count_star()],
            from: Some(FromItem::Subquery {
                select: Box::new(inner),
                alias: "t".to_string(),
            }),
            ..SelectStatement::default()
        };
        let (sql, _) = outer.to_sql(Dialect::Sqlite);
        assert!(sql.starts_with("SELECT COUNT(*) FROM (SELECT DISTINCT "));
        assert!(sql.ends_with(") AS \"t\""));
    }
}
