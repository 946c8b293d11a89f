//! MySQL DDL generator.
//!
//! InnoDB indexes foreign key columns on its own.

use super::{DdlGenerator, quote_identifier};
use corral_core::{ColumnDef, Dialect, SqlType};

/// DDL generator for MySQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlDdlGenerator;

impl DdlGenerator for MysqlDdlGenerator {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    fn column_type(&self, sql_type: &SqlType) -> String {
        match sql_type {
            SqlType::Double => "DOUBLE".to_string(),
            SqlType::Boolean => "TINYINT(1)".to_string(),
            SqlType::Timestamp | SqlType::TimestampTz => "TIMESTAMP(6)".to_string(),
            SqlType::DateTime => "DATETIME(6)".to_string(),
            SqlType::Time => "TIME(6)".to_string(),
            SqlType::Uuid => "BINARY(16)".to_string(),
            SqlType::Json | SqlType::JsonB | SqlType::Array(_) => "JSON".to_string(),
            other => other.sql_name(),
        }
    }

    fn column_def(&self, column: &ColumnDef, sole_auto_key: bool) -> String {
        let mut def = format!(
            "{} {}",
            quote_identifier(&column.name, Dialect::Mysql),
            self.column_type(&column.sql_type)
        );
        if !column.nullable || sole_auto_key {
            def.push_str(" NOT NULL");
        }
        if sole_auto_key {
            def.push_str(" AUTO_INCREMENT");
        }
        def
    }

    fn indexes_foreign_keys(&self) -> bool {
        false
    }
}
