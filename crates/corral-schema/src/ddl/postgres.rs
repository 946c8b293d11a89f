//! PostgreSQL DDL generator.

use super::{DdlGenerator, generate_drop_table, quote_identifier};
use corral_core::{ColumnDef, Dialect, SqlType};

/// DDL generator for PostgreSQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDdlGenerator;

impl DdlGenerator for PostgresDdlGenerator {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn column_type(&self, sql_type: &SqlType) -> String {
        match sql_type {
            SqlType::TinyInt => "SMALLINT".to_string(),
            SqlType::DateTime => "TIMESTAMP".to_string(),
            SqlType::Binary(_) | SqlType::VarBinary(_) | SqlType::Blob => "BYTEA".to_string(),
            SqlType::Array(inner) => format!("{}[]", self.column_type(inner)),
            other => other.sql_name(),
        }
    }

    fn column_def(&self, column: &ColumnDef, sole_auto_key: bool) -> String {
        let sql_type = if sole_auto_key {
            match column.sql_type {
                SqlType::TinyInt | SqlType::SmallInt => "SMALLSERIAL".to_string(),
                SqlType::Integer => "SERIAL".to_string(),
                _ => "BIGSERIAL".to_string(),
            }
        } else {
            self.column_type(&column.sql_type)
        };
        let mut def = format!("{} {sql_type}", quote_identifier(&column.name, Dialect::Postgres));
        if !column.nullable || sole_auto_key {
            def.push_str(" NOT NULL");
        }
        def
    }

    fn drop_table(&self, table: &str) -> String {
        format!("{} CASCADE", generate_drop_table(table, Dialect::Postgres))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mapping() {
        let generator = PostgresDdlGenerator;
        assert_eq!(generator.column_type(&SqlType::TinyInt), "SMALLINT");
        assert_eq!(generator.column_type(&SqlType::Blob), "BYTEA");
        assert_eq!(generator.column_type(&SqlType::TimestampTz), "TIMESTAMPTZ");
        assert_eq!(generator.column_type(&SqlType::Double), "DOUBLE PRECISION");
        assert_eq!(
            generator.column_type(&SqlType::Array(Box::new(SqlType::Text))),
            "TEXT[]"
        );
    }
}
