//! SQLite DDL generator.
//!
//! Values are stored in SQLite's storage classes: temporal values as integer
//! epoch offsets, UUIDs as 16-byte blobs, JSON and arrays as text.

use super::{DdlGenerator, quote_identifier};
use corral_core::{ColumnDef, Dialect, SqlType};

/// DDL generator for SQLite.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDdlGenerator;

impl DdlGenerator for SqliteDdlGenerator {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn column_type(&self, sql_type: &SqlType) -> String {
        match sql_type {
            SqlType::TinyInt
            | SqlType::SmallInt
            | SqlType::Integer
            | SqlType::BigInt
            | SqlType::Boolean
            | SqlType::Date
            | SqlType::Time
            | SqlType::DateTime
            | SqlType::Timestamp
            | SqlType::TimestampTz => "INTEGER".to_string(),
            SqlType::Real | SqlType::Double => "REAL".to_string(),
            SqlType::Numeric { .. } | SqlType::Decimal { .. } => "NUMERIC".to_string(),
            SqlType::Char(_)
            | SqlType::VarChar(_)
            | SqlType::Text
            | SqlType::Json
            | SqlType::JsonB
            | SqlType::Array(_) => "TEXT".to_string(),
            SqlType::Binary(_) | SqlType::VarBinary(_) | SqlType::Blob | SqlType::Uuid => {
                "BLOB".to_string()
            }
            SqlType::Custom(name) => (*name).to_string(),
        }
    }

    fn column_def(&self, column: &ColumnDef, sole_auto_key: bool) -> String {
        let name = quote_identifier(&column.name, Dialect::Sqlite);
        if sole_auto_key {
            // Only an INTEGER PRIMARY KEY column aliases the rowid
            return format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT");
        }
        let mut def = format!("{name} {}", self.column_type(&column.sql_type));
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }

    fn inline_auto_key(&self) -> bool {
        true
    }

    // Forward references are allowed inline and there is no ADD CONSTRAINT.
    fn supports_add_constraint(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mapping() {
        let generator = SqliteDdlGenerator;
        assert_eq!(generator.column_type(&SqlType::Boolean), "INTEGER");
        assert_eq!(generator.column_type(&SqlType::Timestamp), "INTEGER");
        assert_eq!(generator.column_type(&SqlType::Double), "REAL");
        assert_eq!(generator.column_type(&SqlType::Uuid), "BLOB");
        assert_eq!(generator.column_type(&SqlType::Json), "TEXT");
        assert_eq!(
            generator.column_type(&SqlType::Array(Box::new(SqlType::Integer))),
            "TEXT"
        );
        assert_eq!(generator.column_type(&SqlType::Custom("CITEXT")), "CITEXT");
    }
}
