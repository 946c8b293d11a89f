//! DDL (Data Definition Language) generation for table definitions.
//!
//! This module converts [`TableDef`]s into executable SQL statements for each
//! supported database dialect (SQLite, MySQL, PostgreSQL).

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MysqlDdlGenerator;
pub use postgres::PostgresDdlGenerator;
pub use sqlite::SqliteDdlGenerator;

use crate::tables::{ForeignKeyDef, IndexDef, TableDef};
use corral_core::{ColumnDef, Dialect, SqlType};

/// Generates DDL SQL statements for one dialect.
pub trait DdlGenerator {
    /// The database dialect.
    fn dialect(&self) -> Dialect;

    /// Column type spelling for a declared type.
    fn column_type(&self, sql_type: &SqlType) -> String;

    /// Full column definition.
    ///
    /// `sole_auto_key` is set when the column is the table's only primary key
    /// column and is assigned by the store.
    fn column_def(&self, column: &ColumnDef, sole_auto_key: bool) -> String {
        let mut def = format!(
            "{} {}",
            quote_identifier(&column.name, self.dialect()),
            self.column_type(&column.sql_type)
        );
        if !column.nullable || sole_auto_key {
            def.push_str(" NOT NULL");
        }
        def
    }

    /// Whether the key constraint is written inside the auto-increment column.
    fn inline_auto_key(&self) -> bool {
        false
    }

    /// Whether foreign keys can be added after the table exists.
    fn supports_add_constraint(&self) -> bool {
        true
    }

    /// Whether foreign key columns need an explicit index.
    fn indexes_foreign_keys(&self) -> bool {
        true
    }

    /// Generate DROP TABLE SQL.
    fn drop_table(&self, table: &str) -> String {
        generate_drop_table(table, self.dialect())
    }
}

/// Create a DDL generator for the given dialect.
pub fn generator_for_dialect(dialect: Dialect) -> Box<dyn DdlGenerator> {
    match dialect {
        Dialect::Sqlite => Box::new(SqliteDdlGenerator),
        Dialect::Mysql => Box::new(MysqlDdlGenerator),
        Dialect::Postgres => Box::new(PostgresDdlGenerator),
    }
}

// ============================================================================
// Shared Helpers
// ============================================================================

/// Quote an identifier (table/column name) for SQL.
pub(crate) fn quote_identifier(name: &str, dialect: Dialect) -> String {
    dialect.quote_identifier(name)
}

fn quote_list(names: &[String], dialect: Dialect) -> String {
    names
        .iter()
        .map(|n| quote_identifier(n, dialect))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Format a foreign key constraint clause.
fn format_fk_constraint(fk: &ForeignKeyDef, dialect: Dialect) -> String {
    let mut sql = format!(
        "FOREIGN KEY ({}) REFERENCES {}({})",
        quote_list(&fk.columns, dialect),
        quote_identifier(&fk.ref_table, dialect),
        quote_list(&fk.ref_columns, dialect),
    );
    if fk.on_delete_cascade {
        sql.push_str(" ON DELETE CASCADE");
    }
    sql
}

/// Generate CREATE TABLE SQL with the given foreign keys written inline.
pub(crate) fn generate_create_table(
    generator: &dyn DdlGenerator,
    table: &TableDef,
    inline_fks: &[&ForeignKeyDef],
) -> String {
    let dialect = generator.dialect();
    tracing::debug!(
        dialect = ?dialect,
        table = %table.name,
        columns = table.columns.len(),
        "Generating CREATE TABLE DDL"
    );

    let sole_auto = table.primary_key.len() == 1
        && table
            .columns
            .iter()
            .any(|c| c.auto_increment && c.name == table.primary_key[0]);

    let mut parts = Vec::new();
    for col in &table.columns {
        let auto_key = sole_auto && col.name == table.primary_key[0];
        parts.push(format!("  {}", generator.column_def(col, auto_key)));
    }

    if !table.primary_key.is_empty() && !(sole_auto && generator.inline_auto_key()) {
        parts.push(format!(
            "  PRIMARY KEY ({})",
            quote_list(&table.primary_key, dialect)
        ));
    }

    for unique in &table.unique {
        parts.push(format!("  UNIQUE ({})", quote_list(unique, dialect)));
    }

    for fk in inline_fks {
        parts.push(format!("  {}", format_fk_constraint(fk, dialect)));
    }

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        quote_identifier(&table.name, dialect),
        parts.join(",\n")
    );
    tracing::trace!(sql = %sql, "Generated CREATE TABLE statement");
    sql
}

/// Generate ALTER TABLE ... ADD CONSTRAINT for a deferred foreign key.
pub(crate) fn generate_add_foreign_key(table: &str, fk: &ForeignKeyDef, dialect: Dialect) -> String {
    tracing::debug!(table = %table, constraint = %fk.name, "Generating ADD FOREIGN KEY DDL");
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {}",
        quote_identifier(table, dialect),
        quote_identifier(&fk.name, dialect),
        format_fk_constraint(fk, dialect)
    )
}

/// Generate CREATE INDEX SQL.
pub(crate) fn generate_create_index(table: &str, index: &IndexDef, dialect: Dialect) -> String {
    let unique = if index.unique { "UNIQUE " } else { "" };
    // MySQL has no IF NOT EXISTS for indexes
    let guard = if dialect == Dialect::Mysql {
        ""
    } else {
        "IF NOT EXISTS "
    };
    format!(
        "CREATE {}INDEX {}{} ON {} ({})",
        unique,
        guard,
        quote_identifier(&index.name, dialect),
        quote_identifier(table, dialect),
        quote_list(&index.columns, dialect)
    )
}

/// Generate DROP TABLE SQL.
pub(crate) fn generate_drop_table(table_name: &str, dialect: Dialect) -> String {
    tracing::debug!(table = %table_name, "Generating DROP TABLE DDL");
    format!(
        "DROP TABLE IF EXISTS {}",
        quote_identifier(table_name, dialect)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, sql_type: SqlType, nullable: bool) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            sql_type,
            nullable,
            primary_key: false,
            auto_increment: false,
            unique: false,
            attr: name.to_string(),
            entity: "Hero".to_string(),
            references: None,
        }
    }

    fn heroes() -> TableDef {
        let mut id = column("id", SqlType::BigInt, false);
        id.primary_key = true;
        id.auto_increment = true;
        TableDef {
            name: "heroes".to_string(),
            entity: Some("Hero".to_string()),
            columns: vec![
                id,
                column("name", SqlType::VarChar(100), false),
                column("team", SqlType::BigInt, true),
            ],
            primary_key: vec!["id".to_string()],
            unique: vec![vec!["name".to_string()]],
            foreign_keys: vec![ForeignKeyDef {
                name: "fk_heroes_team".to_string(),
                columns: vec!["team".to_string()],
                ref_table: "teams".to_string(),
                ref_columns: vec!["id".to_string()],
                on_delete_cascade: false,
            }],
            indexes: vec![IndexDef {
                name: "idx_heroes_team".to_string(),
                columns: vec!["team".to_string()],
                unique: false,
            }],
        }
    }

    #[test]
    fn test_sqlite_create_table() {
        let table = heroes();
        let fks: Vec<_> = table.foreign_keys.iter().collect();
        let sql = generate_create_table(&SqliteDdlGenerator, &table, &fks);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"heroes\" ("));
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(!sql.contains("  PRIMARY KEY ("));
        assert!(sql.contains("\"name\" TEXT NOT NULL"));
        assert!(sql.contains("\"team\" INTEGER,"));
        assert!(sql.contains("UNIQUE (\"name\")"));
        assert!(sql.contains("FOREIGN KEY (\"team\") REFERENCES \"teams\"(\"id\")"));
    }

    #[test]
    fn test_postgres_create_table() {
        let table = heroes();
        let sql = generate_create_table(&PostgresDdlGenerator, &table, &[]);
        assert!(sql.contains("\"id\" BIGSERIAL NOT NULL"));
        assert!(sql.contains("\"name\" VARCHAR(100) NOT NULL"));
        assert!(sql.contains("PRIMARY KEY (\"id\")"));
        assert!(!sql.contains("FOREIGN KEY"));
    }

    #[test]
    fn test_mysql_create_table() {
        let table = heroes();
        let sql = generate_create_table(&MysqlDdlGenerator, &table, &[]);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `heroes`"));
        assert!(sql.contains("`id` BIGINT NOT NULL AUTO_INCREMENT"));
        assert!(sql.contains("PRIMARY KEY (`id`)"));
    }

    #[test]
    fn test_add_foreign_key() {
        let table = heroes();
        let sql = generate_add_foreign_key("heroes", &table.foreign_keys[0], Dialect::Postgres);
        assert_eq!(
            sql,
            "ALTER TABLE \"heroes\" ADD CONSTRAINT \"fk_heroes_team\" FOREIGN KEY (\"team\") REFERENCES \"teams\"(\"id\")"
        );
    }

    #[test]
    fn test_create_index() {
        let table = heroes();
        assert_eq!(
            generate_create_index("heroes", &table.indexes[0], Dialect::Sqlite),
            "CREATE INDEX IF NOT EXISTS \"idx_heroes_team\" ON \"heroes\" (\"team\")"
        );
        assert_eq!(
            generate_create_index("heroes", &table.indexes[0], Dialect::Mysql),
            "CREATE INDEX `idx_heroes_team` ON `heroes` (`team`)"
        );
    }

    #[test]
    fn test_drop_table_quoting() {
        assert_eq!(
            SqliteDdlGenerator.drop_table("order"),
            "DROP TABLE IF EXISTS \"order\""
        );
        assert_eq!(
            SqliteDdlGenerator.drop_table("my\"table"),
            "DROP TABLE IF EXISTS \"my\"\"table\""
        );
        assert_eq!(
            PostgresDdlGenerator.drop_table("users"),
            "DROP TABLE IF EXISTS \"users\" CASCADE"
        );
        assert_eq!(
            MysqlDdlGenerator.drop_table("users"),
            "DROP TABLE IF EXISTS `users`"
        );
    }
}
