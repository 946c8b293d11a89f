//! Table creation for corral schemas.
//!
//! This crate provides:
//! - Table definitions derived from a validated [`Schema`]
//! - DDL generation for SQLite, MySQL, PostgreSQL
//! - Creation and removal of every table of a schema

#![allow(clippy::result_large_err)]

pub mod create;
pub mod ddl;
pub mod tables;

pub use create::SchemaBuilder;
pub use ddl::{
    DdlGenerator, MysqlDdlGenerator, PostgresDdlGenerator, SqliteDdlGenerator,
    generator_for_dialect,
};
pub use tables::{ForeignKeyDef, IndexDef, TableDef, schema_tables};

use corral_core::{Connection, Dialect, Result, Schema};

/// CREATE statements for every table of `schema`.
pub fn create_statements(schema: &Schema, dialect: Dialect) -> Result<Vec<String>> {
    let builder = schema_tables(schema)?
        .iter()
        .fold(SchemaBuilder::new(dialect), SchemaBuilder::create_table);
    Ok(builder.build())
}

/// DROP statements for every table of `schema`, dependents first.
pub fn drop_statements(schema: &Schema, dialect: Dialect) -> Result<Vec<String>> {
    let generator = generator_for_dialect(dialect);
    Ok(schema_tables(schema)?
        .iter()
        .rev()
        .map(|t| generator.drop_table(&t.name))
        .collect())
}

/// Create all tables of `schema` that do not exist yet.
#[tracing::instrument(level = "debug", skip_all)]
pub fn create_all(conn: &dyn Connection, schema: &Schema) -> Result<()> {
    let statements = create_statements(schema, conn.dialect())?;
    tracing::info!(statements = statements.len(), "Creating tables");
    for sql in &statements {
        conn.execute(sql, &[])?;
    }
    Ok(())
}

/// Drop all tables of `schema`.
#[tracing::instrument(level = "debug", skip_all)]
pub fn drop_all(conn: &dyn Connection, schema: &Schema) -> Result<()> {
    for sql in drop_statements(schema, conn.dialect())? {
        conn.execute(&sql, &[])?;
    }
    Ok(())
}

/// Generate DROP TABLE SQL (for testing/inspection).
pub fn drop_table_sql(table_name: &str, dialect: Dialect) -> String {
    generator_for_dialect(dialect).drop_table(table_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{Attribute, EntityDef, SqlType};

    fn garage() -> Schema {
        Schema::builder()
            .entity(
                EntityDef::new("Person")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required("name", SqlType::Text))
                    .attr(Attribute::set("cars", "Car")),
            )
            .entity(
                EntityDef::new("Car")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required_ref("owner", "Person")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_statements_sqlite() {
        let statements = create_statements(&garage(), Dialect::Sqlite).unwrap();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS \"Person\""));
        assert!(statements[1].starts_with("CREATE TABLE IF NOT EXISTS \"Car\""));
        assert!(statements[1].contains("\"owner\" INTEGER NOT NULL"));
        assert!(statements[1].contains("FOREIGN KEY (\"owner\") REFERENCES \"Person\"(\"id\")"));
        assert_eq!(
            statements[2],
            "CREATE INDEX IF NOT EXISTS \"idx_Car_owner\" ON \"Car\" (\"owner\")"
        );
    }

    #[test]
    fn test_drop_statements_reverse_order() {
        let statements = drop_statements(&garage(), Dialect::Postgres).unwrap();
        assert_eq!(
            statements,
            vec![
                "DROP TABLE IF EXISTS \"Car\" CASCADE".to_string(),
                "DROP TABLE IF EXISTS \"Person\" CASCADE".to_string(),
            ]
        );
    }

    #[test]
    fn test_drop_table_sql_sql_injection_attempt_neutralized() {
        let malicious = "users\"; DROP TABLE secrets; --";
        let sql = drop_table_sql(malicious, Dialect::Sqlite);
        assert_eq!(
            sql,
            "DROP TABLE IF EXISTS \"users\"\"; DROP TABLE secrets; --\""
        );
        assert_eq!(sql.matches('"').count(), 4);
    }
}
