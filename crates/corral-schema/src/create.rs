//! CREATE TABLE statement builder.

use crate::ddl::{
    DdlGenerator, generate_add_foreign_key, generate_create_index, generate_create_table,
    generator_for_dialect,
};
use crate::tables::{IndexDef, TableDef};
use corral_core::Dialect;
use std::collections::HashSet;

/// Builder for a sequence of DDL statements.
///
/// Foreign keys that point at a table not created yet are added with
/// `ALTER TABLE` at the end, on dialects that support it.
pub struct SchemaBuilder {
    generator: Box<dyn DdlGenerator>,
    statements: Vec<String>,
    deferred: Vec<String>,
    created: HashSet<String>,
}

impl std::fmt::Debug for SchemaBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaBuilder")
            .field("dialect", &self.generator.dialect())
            .field("statements", &self.statements)
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}

impl SchemaBuilder {
    /// Create a new schema builder.
    pub fn new(dialect: Dialect) -> Self {
        Self {
            generator: generator_for_dialect(dialect),
            statements: Vec::new(),
            deferred: Vec::new(),
            created: HashSet::new(),
        }
    }

    /// Add a CREATE TABLE statement and the table's indexes.
    pub fn create_table(mut self, table: &TableDef) -> Self {
        let mut inline = Vec::new();
        for fk in &table.foreign_keys {
            let exists = fk.ref_table == table.name || self.created.contains(&fk.ref_table);
            if exists || !self.generator.supports_add_constraint() {
                inline.push(fk);
            } else {
                self.deferred.push(generate_add_foreign_key(
                    &table.name,
                    fk,
                    self.generator.dialect(),
                ));
            }
        }
        self.statements
            .push(generate_create_table(self.generator.as_ref(), table, &inline));
        self.created.insert(table.name.clone());

        if self.generator.indexes_foreign_keys() {
            for index in &table.indexes {
                self = self.create_index(&table.name, index);
            }
        }
        self
    }

    /// Add a CREATE INDEX statement.
    pub fn create_index(mut self, table: &str, index: &IndexDef) -> Self {
        self.statements
            .push(generate_create_index(table, index, self.generator.dialect()));
        self
    }

    /// Add raw SQL.
    pub fn raw(mut self, sql: impl Into<String>) -> Self {
        self.statements.push(sql.into());
        self
    }

    /// Get all SQL statements, deferred foreign keys last.
    pub fn build(self) -> Vec<String> {
        let mut statements = self.statements;
        statements.extend(self.deferred);
        statements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::ForeignKeyDef;
    use corral_core::{ColumnDef, SqlType};

    fn table(name: &str, refs: &[&str]) -> TableDef {
        let id = ColumnDef {
            name: "id".to_string(),
            sql_type: SqlType::BigInt,
            nullable: false,
            primary_key: true,
            auto_increment: false,
            unique: false,
            attr: "id".to_string(),
            entity: name.to_string(),
            references: None,
        };
        let mut columns = vec![id];
        let mut foreign_keys = Vec::new();
        let mut indexes = Vec::new();
        for target in refs {
            let column = target.to_lowercase();
            columns.push(ColumnDef {
                name: column.clone(),
                nullable: true,
                primary_key: false,
                attr: column.clone(),
                references: Some(((*target).to_string(), "id".to_string())),
                ..columns[0].clone()
            });
            foreign_keys.push(ForeignKeyDef {
                name: format!("fk_{name}_{column}"),
                columns: vec![column.clone()],
                ref_table: (*target).to_string(),
                ref_columns: vec!["id".to_string()],
                on_delete_cascade: false,
            });
            indexes.push(IndexDef {
                name: format!("idx_{name}_{column}"),
                columns: vec![column],
                unique: false,
            });
        }
        TableDef {
            name: name.to_string(),
            entity: Some(name.to_string()),
            columns,
            primary_key: vec!["id".to_string()],
            unique: Vec::new(),
            foreign_keys,
            indexes,
        }
    }

    #[test]
    fn test_schema_builder_single_table() {
        let statements = SchemaBuilder::new(Dialect::Sqlite)
            .create_table(&table("heroes", &[]))
            .build();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS \"heroes\""));
    }

    #[test]
    fn test_indexes_follow_table() {
        let statements = SchemaBuilder::new(Dialect::Sqlite)
            .create_table(&table("teams", &[]))
            .create_table(&table("heroes", &["teams"]))
            .build();
        assert_eq!(statements.len(), 3);
        assert!(statements[2].starts_with("CREATE INDEX IF NOT EXISTS \"idx_heroes_teams\""));

        let mysql = SchemaBuilder::new(Dialect::Mysql)
            .create_table(&table("teams", &[]))
            .create_table(&table("heroes", &["teams"]))
            .build();
        assert_eq!(mysql.len(), 2);
    }

    #[test]
    fn test_forward_reference_deferred_on_postgres() {
        let statements = SchemaBuilder::new(Dialect::Postgres)
            .create_table(&table("a", &["b"]))
            .create_table(&table("b", &["a"]))
            .build();
        assert!(!statements[0].contains("FOREIGN KEY"));
        assert!(statements.iter().any(|s| s.contains("REFERENCES \"a\"(\"id\")") && s.starts_with("CREATE TABLE IF NOT EXISTS \"b\"")));
        assert!(statements.last().unwrap().starts_with("ALTER TABLE \"a\" ADD CONSTRAINT \"fk_a_b\""));
    }

    #[test]
    fn test_forward_reference_inline_on_sqlite() {
        let statements = SchemaBuilder::new(Dialect::Sqlite)
            .create_table(&table("a", &["b"]))
            .create_table(&table("b", &["a"]))
            .build();
        assert!(statements[0].contains("FOREIGN KEY (\"b\") REFERENCES \"b\"(\"id\")"));
        assert!(statements.iter().all(|s| !s.starts_with("ALTER")));
    }

    #[test]
    fn test_schema_builder_raw_sql() {
        let statements = SchemaBuilder::new(Dialect::Sqlite)
            .raw("ALTER TABLE heroes ADD COLUMN power TEXT")
            .build();
        assert_eq!(statements, vec!["ALTER TABLE heroes ADD COLUMN power TEXT".to_string()]);
    }
}
