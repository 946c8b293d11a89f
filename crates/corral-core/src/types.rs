//! Declared column types.

/// SQL data types an attribute can be declared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    // Integer types
    TinyInt,
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Real,
    Double,

    // Fixed precision
    Numeric { precision: u8, scale: u8 },
    Decimal { precision: u8, scale: u8 },

    Boolean,

    // String types
    Char(u32),
    VarChar(u32),
    Text,

    // Binary types
    Binary(u32),
    VarBinary(u32),
    Blob,

    // Date/time types
    Date,
    Time,
    DateTime,
    Timestamp,
    TimestampTz,

    Uuid,

    Json,
    JsonB,

    /// Stored natively on PostgreSQL, as JSON text elsewhere
    Array(Box<SqlType>),

    /// Custom type name, passed through to DDL
    Custom(&'static str),
}

impl SqlType {
    /// Get the generic SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::TinyInt => "TINYINT".to_string(),
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Numeric { precision, scale } => format!("NUMERIC({}, {})", precision, scale),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::Char(len) => format!("CHAR({})", len),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Binary(len) => format!("BINARY({})", len),
            SqlType::VarBinary(len) => format!("VARBINARY({})", len),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Time => "TIME".to_string(),
            SqlType::DateTime => "DATETIME".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::TimestampTz => "TIMESTAMPTZ".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
            SqlType::JsonB => "JSONB".to_string(),
            SqlType::Array(inner) => format!("{}[]", inner.sql_name()),
            SqlType::Custom(name) => (*name).to_string(),
        }
    }

    /// Short lowercase name used in schema descriptions and type errors.
    pub fn json_kind(&self) -> &'static str {
        match self {
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt => "int",
            SqlType::Real | SqlType::Double => "float",
            SqlType::Numeric { .. } | SqlType::Decimal { .. } => "decimal",
            SqlType::Boolean => "bool",
            SqlType::Char(_) | SqlType::VarChar(_) | SqlType::Text => "str",
            SqlType::Binary(_) | SqlType::VarBinary(_) | SqlType::Blob => "bytes",
            SqlType::Date => "date",
            SqlType::Time => "time",
            SqlType::DateTime | SqlType::Timestamp | SqlType::TimestampTz => "datetime",
            SqlType::Uuid => "uuid",
            SqlType::Json | SqlType::JsonB => "json",
            SqlType::Array(_) => "array",
            SqlType::Custom(_) => "custom",
        }
    }

    /// Check if this type is an integer type.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt
        )
    }

    /// Check if this type is numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt
                | SqlType::SmallInt
                | SqlType::Integer
                | SqlType::BigInt
                | SqlType::Real
                | SqlType::Double
                | SqlType::Numeric { .. }
                | SqlType::Decimal { .. }
        )
    }

    /// Check if this type is text-based.
    pub const fn is_text(&self) -> bool {
        matches!(self, SqlType::Char(_) | SqlType::VarChar(_) | SqlType::Text)
    }

    /// Maximum declared length for CHAR/VARCHAR.
    pub const fn max_length(&self) -> Option<u32> {
        match self {
            SqlType::Char(n) | SqlType::VarChar(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether attributes of this type take part in optimistic checks unless
    /// told otherwise. Floats and JSON documents do not compare reliably.
    pub const fn optimistic_by_default(&self) -> bool {
        !matches!(
            self,
            SqlType::Real | SqlType::Double | SqlType::Json | SqlType::JsonB | SqlType::Array(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_and_json_skip_optimistic_checks() {
        assert!(SqlType::Integer.optimistic_by_default());
        assert!(SqlType::Text.optimistic_by_default());
        assert!(!SqlType::Double.optimistic_by_default());
        assert!(!SqlType::Json.optimistic_by_default());
        assert!(!SqlType::Array(Box::new(SqlType::Text)).optimistic_by_default());
    }

    #[test]
    fn names() {
        assert_eq!(SqlType::VarChar(20).sql_name(), "VARCHAR(20)");
        assert_eq!(SqlType::Array(Box::new(SqlType::Integer)).sql_name(), "INTEGER[]");
        assert_eq!(SqlType::VarChar(20).max_length(), Some(20));
        assert_eq!(SqlType::BigInt.json_kind(), "int");
    }
}
