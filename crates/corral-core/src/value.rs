//! Dynamic SQL values.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

use crate::error::{Error, TypeError};
use crate::types::SqlType;

/// A dynamically-typed SQL value.
///
/// This enum represents all possible SQL values and is used
/// for parameter binding, result fetching and entity attribute storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Time (microseconds since midnight)
    Time(i64),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// Timestamp with timezone (microseconds since epoch, UTC)
    TimestampTz(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// Array of values
    Array(Vec<Value>),

    /// SQL DEFAULT keyword
    Default,
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::TimestampTz(_) => "TIMESTAMPTZ",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Array(_) => "ARRAY",
            Value::Default => "DEFAULT",
        }
    }

    /// Whether this is one of the integer variants.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_)
        )
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::TinyInt(v) => Some(*v != 0),
            Value::SmallInt(v) => Some(*v != 0),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::TinyInt(v) => Some(f64::from(*v)),
            Value::SmallInt(v) => Some(f64::from(*v)),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Compare two values the way primary keys compare.
    ///
    /// Integer variants compare numerically, so `Int(5)` and `BigInt(5)` are
    /// the same key. Everything else falls back to structural equality.
    pub fn key_eq(&self, other: &Value) -> bool {
        match (self.as_key_int(), other.as_key_int()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self == other,
            _ => false,
        }
    }

    fn as_key_int(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Feed this value into a hasher consistently with [`Value::key_eq`].
    pub fn hash_key<H: Hasher>(&self, hasher: &mut H) {
        if let Some(i) = self.as_key_int() {
            2u8.hash(hasher);
            i.hash(hasher);
            return;
        }
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Float(f) => {
                6u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Double(f) => {
                7u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Decimal(s) => {
                8u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                9u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                10u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Date(d) => {
                11u8.hash(hasher);
                d.hash(hasher);
            }
            Value::Time(t) => {
                12u8.hash(hasher);
                t.hash(hasher);
            }
            Value::Timestamp(ts) | Value::TimestampTz(ts) => {
                13u8.hash(hasher);
                ts.hash(hasher);
            }
            Value::Uuid(u) => {
                15u8.hash(hasher);
                u.hash(hasher);
            }
            Value::Json(j) => {
                16u8.hash(hasher);
                j.to_string().hash(hasher);
            }
            Value::Array(arr) => {
                17u8.hash(hasher);
                arr.len().hash(hasher);
                for item in arr {
                    item.hash_key(hasher);
                }
            }
            Value::Default => 18u8.hash(hasher),
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {}
        }
    }

    /// Convert this value to JSON for the wire.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Default => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::TinyInt(v) => serde_json::Value::Number((*v).into()),
            Value::SmallInt(v) => serde_json::Value::Number((*v).into()),
            Value::Int(v) => serde_json::Value::Number((*v).into()),
            Value::BigInt(v) => serde_json::Value::Number((*v).into()),
            Value::Float(v) => serde_json::Number::from_f64(f64::from(*v))
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::Double(v) => serde_json::Number::from_f64(*v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::Decimal(s) | Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
            Value::Date(d) => serde_json::Value::Number((*d).into()),
            Value::Time(t) | Value::Timestamp(t) | Value::TimestampTz(t) => {
                serde_json::Value::Number((*t).into())
            }
            Value::Uuid(bytes) => serde_json::Value::String(hex::encode(bytes)),
            Value::Json(j) => j.clone(),
            Value::Array(arr) => serde_json::Value::Array(arr.iter().map(Value::to_json).collect()),
        }
    }

    /// Decode a JSON wire value for a column of the given type.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &serde_json::Value, sql_type: &SqlType) -> crate::Result<Value> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = || {
            Error::Type(TypeError {
                expected: sql_type.json_kind(),
                actual: json_kind(json).to_string(),
                column: None,
                rust_type: None,
            })
        };
        let value = match sql_type {
            SqlType::Json | SqlType::JsonB => Value::Json(json.clone()),
            SqlType::Array(inner) => {
                let items = json.as_array().ok_or_else(mismatch)?;
                Value::Array(
                    items
                        .iter()
                        .map(|item| Value::from_json(item, inner))
                        .collect::<crate::Result<Vec<_>>>()?,
                )
            }
            SqlType::Boolean => Value::Bool(json.as_bool().ok_or_else(mismatch)?),
            SqlType::Real | SqlType::Double => Value::Double(json.as_f64().ok_or_else(mismatch)?),
            SqlType::Blob | SqlType::Binary(_) | SqlType::VarBinary(_) => {
                let text = json.as_str().ok_or_else(mismatch)?;
                Value::Bytes(hex::decode(text).map_err(|_| mismatch())?)
            }
            SqlType::Uuid => {
                let text = json.as_str().ok_or_else(mismatch)?;
                let bytes = hex::decode(text).map_err(|_| mismatch())?;
                let arr: [u8; 16] = bytes.try_into().map_err(|_| mismatch())?;
                Value::Uuid(arr)
            }
            SqlType::Date => {
                let days = json.as_i64().ok_or_else(mismatch)?;
                Value::Date(i32::try_from(days).map_err(|_| mismatch())?)
            }
            SqlType::Time => Value::Time(json.as_i64().ok_or_else(mismatch)?),
            SqlType::DateTime | SqlType::Timestamp => {
                Value::Timestamp(json.as_i64().ok_or_else(mismatch)?)
            }
            SqlType::TimestampTz => Value::TimestampTz(json.as_i64().ok_or_else(mismatch)?),
            _ => match json {
                serde_json::Value::Bool(b) => Value::Bool(*b),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Value::BigInt(i)
                    } else {
                        Value::Double(n.as_f64().ok_or_else(mismatch)?)
                    }
                }
                serde_json::Value::String(s) => Value::Text(s.clone()),
                _ => return Err(mismatch()),
            },
        };
        value.coerce(sql_type)
    }

    /// Coerce a value (typically fresh from a driver) to the declared column type.
    ///
    /// SQLite hands back booleans as integers and JSON or arrays as text; this
    /// maps them back so that values read from the store compare equal to the
    /// values that were written.
    #[allow(clippy::result_large_err)]
    pub fn coerce(self, sql_type: &SqlType) -> crate::Result<Value> {
        if matches!(self, Value::Null | Value::Default) {
            return Ok(self);
        }
        let type_error = |actual: &Value| {
            Error::Type(TypeError {
                expected: sql_type.json_kind(),
                actual: actual.type_name().to_string(),
                column: None,
                rust_type: None,
            })
        };
        match sql_type {
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer => match self.as_key_int() {
                Some(i) => i32::try_from(i)
                    .map(Value::Int)
                    .or(Ok(Value::BigInt(i))),
                None => match &self {
                    Value::Bool(b) => Ok(Value::Int(i32::from(*b))),
                    Value::Text(s) => s.parse::<i32>().map(Value::Int).map_err(|_| type_error(&self)),
                    _ => Err(type_error(&self)),
                },
            },
            SqlType::BigInt => match self.as_i64() {
                Some(i) => Ok(Value::BigInt(i)),
                None => match &self {
                    Value::Text(s) => s.parse::<i64>().map(Value::BigInt).map_err(|_| type_error(&self)),
                    _ => Err(type_error(&self)),
                },
            },
            SqlType::Real | SqlType::Double => match self.as_f64() {
                Some(f) => Ok(Value::Double(f)),
                None => Err(type_error(&self)),
            },
            SqlType::Numeric { .. } | SqlType::Decimal { .. } => match &self {
                Value::Decimal(_) => Ok(self),
                Value::Text(s) => Ok(Value::Decimal(s.clone())),
                other => match other.as_f64() {
                    Some(_) if other.is_integer() => Ok(Value::Decimal(
                        other.as_i64().unwrap_or_default().to_string(),
                    )),
                    Some(f) => Ok(Value::Decimal(f.to_string())),
                    None => Err(type_error(&self)),
                },
            },
            SqlType::Boolean => match self.as_bool() {
                Some(b) => Ok(Value::Bool(b)),
                None => Err(type_error(&self)),
            },
            SqlType::Char(_) | SqlType::VarChar(_) | SqlType::Text => match self {
                Value::Text(_) => Ok(self),
                Value::Decimal(s) => Ok(Value::Text(s)),
                other => Err(type_error(&other)),
            },
            SqlType::Binary(_) | SqlType::VarBinary(_) | SqlType::Blob => match self {
                Value::Bytes(_) => Ok(self),
                Value::Text(s) => Ok(Value::Bytes(s.into_bytes())),
                other => Err(type_error(&other)),
            },
            SqlType::Uuid => match self {
                Value::Uuid(_) => Ok(self),
                Value::Bytes(b) if b.len() == 16 => {
                    let mut arr = [0u8; 16];
                    arr.copy_from_slice(&b);
                    Ok(Value::Uuid(arr))
                }
                other => Err(type_error(&other)),
            },
            SqlType::Json | SqlType::JsonB => match self {
                Value::Json(_) => Ok(self),
                Value::Text(s) => serde_json::from_str(&s)
                    .map(Value::Json)
                    .map_err(|e| Error::Serde(e.to_string())),
                other => Ok(Value::Json(other.to_json())),
            },
            SqlType::Array(inner) => match self {
                Value::Array(items) => Ok(Value::Array(
                    items
                        .into_iter()
                        .map(|v| v.coerce(inner))
                        .collect::<crate::Result<Vec<_>>>()?,
                )),
                Value::Text(s) => {
                    let json: serde_json::Value =
                        serde_json::from_str(&s).map_err(|e| Error::Serde(e.to_string()))?;
                    Value::from_json(&json, sql_type)
                }
                Value::Json(json) => Value::from_json(&json, sql_type),
                other => Err(type_error(&other)),
            },
            // Drivers without native temporal types store epoch offsets.
            SqlType::Date => match self {
                Value::Date(_) => Ok(self),
                other => other
                    .as_i64()
                    .and_then(|d| i32::try_from(d).ok())
                    .map(Value::Date)
                    .ok_or_else(|| type_error(&other)),
            },
            SqlType::Time => match self {
                Value::Time(_) => Ok(self),
                other => other.as_i64().map(Value::Time).ok_or_else(|| type_error(&other)),
            },
            SqlType::DateTime | SqlType::Timestamp => match self {
                Value::Timestamp(_) => Ok(self),
                Value::TimestampTz(t) => Ok(Value::Timestamp(t)),
                other => other
                    .as_i64()
                    .map(Value::Timestamp)
                    .ok_or_else(|| type_error(&other)),
            },
            SqlType::TimestampTz => match self {
                Value::TimestampTz(_) => Ok(self),
                Value::Timestamp(t) => Ok(Value::TimestampTz(t)),
                other => other
                    .as_i64()
                    .map(Value::TimestampTz)
                    .ok_or_else(|| type_error(&other)),
            },
            SqlType::Custom(_) => Ok(self),
        }
    }
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// Conversion implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::BigInt(i64::from(v))
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Array(v.into_iter().map(Value::Text).collect())
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::Array(v.into_iter().map(Value::BigInt).collect())
    }
}

// TryFrom implementations for extracting values

fn type_error(expected: &'static str, actual: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.type_name().to_string(),
        column: None,
        rust_type: None,
    })
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| type_error("bool", &value))
    }
}

impl TryFrom<Value> for i32 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value.as_i64() {
            Some(v) => i32::try_from(v).map_err(|_| Error::Type(TypeError {
                expected: "i32",
                actual: format!("integer {v} out of range"),
                column: None,
                rust_type: Some("i32"),
            })),
            None => Err(type_error("i32", &value)),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| type_error("i64", &value))
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64().ok_or_else(|| type_error("f64", &value))
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(v) | Value::Decimal(v) => Ok(v),
            other => Err(type_error("String", &other)),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bytes(v) => Ok(v),
            Value::Text(v) => Ok(v.into_bytes()),
            other => Err(type_error("Vec<u8>", &other)),
        }
    }
}

impl TryFrom<Value> for serde_json::Value {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Json(v) => Ok(v),
            Value::Text(s) => serde_json::from_str(&s).map_err(|e| {
                Error::Type(TypeError {
                    expected: "valid JSON",
                    actual: format!("invalid JSON: {}", e),
                    column: None,
                    rust_type: None,
                })
            }),
            other => Ok(other.to_json()),
        }
    }
}

/// TryFrom for `Option<T>` - returns None for Null, tries to convert otherwise
impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = Error>,
{
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(None),
            v => T::try_from(v).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn key_hash(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash_key(&mut h);
        h.finish()
    }

    #[test]
    fn integer_keys_compare_across_widths() {
        assert!(Value::Int(5).key_eq(&Value::BigInt(5)));
        assert_eq!(key_hash(&Value::Int(5)), key_hash(&Value::BigInt(5)));
        assert!(!Value::Int(5).key_eq(&Value::Text("5".into())));
    }

    #[test]
    fn coerce_sqlite_storage_classes() {
        assert_eq!(Value::Int(1).coerce(&SqlType::Boolean).unwrap(), Value::Bool(true));
        assert_eq!(
            Value::Text("{\"a\":1}".into()).coerce(&SqlType::Json).unwrap(),
            Value::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(
            Value::Text("[1,2]".into())
                .coerce(&SqlType::Array(Box::new(SqlType::BigInt)))
                .unwrap(),
            Value::Array(vec![Value::BigInt(1), Value::BigInt(2)])
        );
        assert_eq!(Value::Int(7).coerce(&SqlType::BigInt).unwrap(), Value::BigInt(7));
        assert!(Value::Text("x".into()).coerce(&SqlType::Integer).is_err());
    }

    #[test]
    fn json_round_trip_by_type() {
        let v = Value::from_json(&serde_json::json!(42), &SqlType::Integer).unwrap();
        assert_eq!(v, Value::Int(42));
        let v = Value::from_json(&serde_json::json!("ab01"), &SqlType::Blob).unwrap();
        assert_eq!(v, Value::Bytes(vec![0xab, 0x01]));
        assert_eq!(v.to_json(), serde_json::json!("ab01"));
        assert!(Value::from_json(&serde_json::json!("x"), &SqlType::Boolean).is_err());
    }

    #[test]
    fn narrowing_conversions() {
        assert_eq!(i32::try_from(Value::BigInt(12)).unwrap(), 12);
        assert!(i32::try_from(Value::BigInt(i64::MAX)).is_err());
        assert_eq!(Option::<String>::try_from(Value::Null).unwrap(), None);
    }
}
