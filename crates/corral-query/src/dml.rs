//! INSERT, UPDATE and DELETE statements issued by a session flush.

use crate::expr::Expr;
use corral_core::{Dialect, Value};

/// INSERT of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    table: String,
    columns: Vec<String>,
    values: Vec<Value>,
    returning: Option<String>,
}

impl Insert {
    pub fn into_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            values: Vec::new(),
            returning: None,
        }
    }

    pub fn value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.push(column.into());
        self.values.push(value.into());
        self
    }

    /// Return the generated key column. Rendered on Postgres only; the other
    /// dialects report the key through the driver.
    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning = Some(column.into());
        self
    }

    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let table = dialect.quote_identifier(&self.table);
        let mut params = Vec::new();
        let mut sql = if self.columns.is_empty() {
            match dialect {
                Dialect::Mysql => format!("INSERT INTO {table} () VALUES ()"),
                Dialect::Sqlite | Dialect::Postgres => {
                    format!("INSERT INTO {table} DEFAULT VALUES")
                }
            }
        } else {
            let columns: Vec<String> = self
                .columns
                .iter()
                .map(|c| dialect.quote_identifier(c))
                .collect();
            let values: Vec<String> = self
                .values
                .iter()
                .map(|v| Expr::Literal(v.clone()).build_with_dialect(dialect, &mut params))
                .collect();
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                values.join(", ")
            )
        };
        if let (Some(column), Dialect::Postgres) = (&self.returning, dialect) {
            sql.push_str(" RETURNING ");
            sql.push_str(&dialect.quote_identifier(column));
        }
        (sql, params)
    }
}

/// UPDATE of the rows matching a condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    table: String,
    sets: Vec<(String, Value)>,
    where_clause: Option<Expr>,
}

impl Update {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            sets: Vec::new(),
            where_clause: None,
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sets.push((column.into(), value.into()));
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

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sets: Vec<String> = self
            .sets
            .iter()
            .map(|(column, value)| {
                format!(
                    "{} = {}",
                    dialect.quote_identifier(column),
                    Expr::Literal(value.clone()).build_with_dialect(dialect, &mut params)
                )
            })
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            dialect.quote_identifier(&self.table),
            sets.join(", ")
        );
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.build_with_dialect(dialect, &mut params));
        }
        (sql, params)
    }
}

/// DELETE of the rows matching a condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    table: String,
    where_clause: Option<Expr>,
}

impl Delete {
    pub fn from_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
        }
    }

    /// AND a condition onto WHERE.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn build_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", dialect.quote_identifier(&self.table));
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.build_with_dialect(dialect, &mut params));
        }
        (sql, params)
    }
}

/// `col = ?` for a value, `col IS NULL` for NULL.
pub fn column_matches(column: &str, value: &Value) -> Expr {
    if value.is_null() {
        Expr::col(column).is_null()
    } else {
        Expr::col(column).eq(Expr::Literal(value.clone()))
    }
}

/// Equality on every `(column, value)` pair.
pub fn key_matches<'v>(pairs: impl IntoIterator<Item = (&'v str, &'v Value)>) -> Option<Expr> {
    Expr::all(pairs.into_iter().map(|(c, v)| column_matches(c, v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rendering() {
        let insert = Insert::into_table("Person")
            .value("name", "Ann")
            .value("age", 30)
            .returning("id");
        let (sql, params) = insert.build_with_dialect(Dialect::Sqlite);
        assert_eq!(sql, "INSERT INTO \"Person\" (\"name\", \"age\") VALUES (?1, ?2)");
        assert_eq!(params, vec![Value::from("Ann"), Value::Int(30)]);
        let (sql, _) = insert.build_with_dialect(Dialect::Postgres);
        assert!(sql.ends_with("VALUES ($1, $2) RETURNING \"id\""));
    }

    #[test]
    fn empty_insert_uses_defaults() {
        let insert = Insert::into_table("Tag");
        assert_eq!(
            insert.build_with_dialect(Dialect::Sqlite).0,
            "INSERT INTO \"Tag\" DEFAULT VALUES"
        );
        assert_eq!(
            insert.build_with_dialect(Dialect::Mysql).0,
            "INSERT INTO `Tag` () VALUES ()"
        );
    }

    #[test]
    fn optimistic_update_rendering() {
        let update = Update::table("Person")
            .set("age", 31)
            .filter(column_matches("id", &Value::BigInt(1)))
            .filter(column_matches("nick", &Value::Null));
        let (sql, params) = update.build_with_dialect(Dialect::Sqlite);
        assert_eq!(
            sql,
            "UPDATE \"Person\" SET \"age\" = ?1 WHERE \"id\" = ?2 AND \"nick\" IS NULL"
        );
        assert_eq!(params, vec![Value::Int(31), Value::BigInt(1)]);
    }

    #[test]
    fn delete_rendering() {
        let key = [Value::Int(1), Value::Int(2)];
        let filter = key_matches([("student", &key[0]), ("course", &key[1])]).unwrap();
        let (sql, params) = Delete::from_table("Course_Student")
            .filter(filter)
            .build_with_dialect(Dialect::Postgres);
        assert_eq!(
            sql,
            "DELETE FROM \"Course_Student\" WHERE \"student\" = $1 AND \"course\" = $2"
        );
        assert_eq!(params.len(), 2);
    }
}
