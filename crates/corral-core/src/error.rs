//! Error types for corral operations.

use std::fmt;

use crate::value::Value;

/// The primary error type for all corral operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect)
    Connection(ConnectionError),
    /// Query execution errors reported by the driver
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Session lifecycle errors (expired handles, cross-session use)
    Session(SessionError),
    /// Pool errors
    Pool(PoolError),
    /// Invalid entity or schema declarations
    Schema(SchemaError),
    /// Configuration errors
    Config(ConfigError),
    /// Attribute value validation errors
    Validation(ValidationError),
    /// No object exists for the requested key
    NotFound(NotFoundError),
    /// A lookup expected at most one object and found more
    MultipleFound(MultipleFoundError),
    /// A permission rule denied access
    Permission(PermissionError),
    /// An optimistic check failed while writing
    Conflict(ConflictError),
    /// A relationship or store constraint blocked the change
    Constraint(ConstraintError),
    /// The query (or name list) cannot be translated
    MalformedQuery(String),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// Flat classification of [`Error`], used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Query,
    /// Store busy, deadlock or serialization failure
    Busy,
    Type,
    Session,
    Pool,
    Schema,
    Config,
    Validation,
    NotFound,
    MultipleFound,
    Permission,
    Conflict,
    Constraint,
    MalformedQuery,
    Io,
    Timeout,
    Serde,
    Custom,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost or closed during operation
    Disconnected,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// The database is locked by another connection
    Busy,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Interrupted
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// The session owning the handle has ended
    Expired,
    /// An object from one session was handed to another
    CrossSession,
    /// The object was deleted in this session
    ObjectDeleted,
    /// A transaction operation was called outside a transaction
    NoTransaction,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
    /// Configuration error
    Config,
    /// The connection factory failed
    Connect,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Invalid identifier or option combination
    Invalid,
    /// An entity name that is not declared
    UnknownEntity,
    /// An attribute name that is not declared
    UnknownAttribute,
    /// Relationship without a matching reverse
    Relationship,
    /// Broken inheritance hierarchy
    Inheritance,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Validation error for attribute values.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Entity the attributes belong to
    pub entity: String,
    pub errors: Vec<AttributeValidationError>,
}

/// A single validation failure for an attribute.
#[derive(Debug, Clone)]
pub struct AttributeValidationError {
    pub attr: String,
    pub kind: ValidationErrorKind,
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Value is below minimum
    Min,
    /// Value is above maximum
    Max,
    /// String is shorter than minimum length
    MinLength,
    /// String is longer than maximum length
    MaxLength,
    /// Value doesn't match regex pattern
    Pattern,
    /// Required attribute is missing/null
    Required,
    /// Value does not fit the declared column type
    Type,
    /// The attribute cannot be assigned directly
    ReadOnly,
}

#[derive(Debug)]
pub struct NotFoundError {
    pub entity: String,
    pub key: Vec<Value>,
}

#[derive(Debug)]
pub struct MultipleFoundError {
    pub entity: String,
    pub criteria: String,
}

#[derive(Debug)]
pub struct PermissionError {
    pub entity: String,
    pub attr: Option<String>,
    /// One of `view`, `edit`, `create`, `delete`
    pub operation: String,
}

#[derive(Debug)]
pub struct ConflictError {
    pub entity: String,
    pub key: Vec<Value>,
    /// Attributes whose stored value no longer matches what was read
    pub attrs: Vec<String>,
}

#[derive(Debug)]
pub struct ConstraintError {
    pub entity: String,
    pub key: Vec<Value>,
    pub attr: Option<String>,
    pub message: String,
}

impl ValidationError {
    /// Create an empty error container for an entity.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            errors: Vec::new(),
        }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an attribute validation error.
    pub fn add(
        &mut self,
        attr: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(AttributeValidationError {
            attr: attr.into(),
            kind,
            message: message.into(),
        });
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Error {
    /// Build a `MalformedQuery` error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedQuery(message.into())
    }

    /// Build a session lifecycle error.
    pub fn session(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Error::Session(SessionError {
            kind,
            message: message.into(),
        })
    }

    /// Build a schema declaration error.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// Build a `NotFound` error.
    pub fn not_found(entity: impl Into<String>, key: Vec<Value>) -> Self {
        Error::NotFound(NotFoundError {
            entity: entity.into(),
            key,
        })
    }

    /// Build a `Permission` error.
    pub fn permission(
        entity: impl Into<String>,
        attr: Option<&str>,
        operation: impl Into<String>,
    ) -> Self {
        Error::Permission(PermissionError {
            entity: entity.into(),
            attr: attr.map(str::to_string),
            operation: operation.into(),
        })
    }

    /// Build a relationship `Constraint` error.
    pub fn constraint(
        entity: impl Into<String>,
        key: Vec<Value>,
        attr: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Constraint(ConstraintError {
            entity: entity.into(),
            key,
            attr: attr.map(str::to_string),
            message: message.into(),
        })
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::Query(q) => match q.kind {
                QueryErrorKind::Busy | QueryErrorKind::Deadlock | QueryErrorKind::Serialization => {
                    ErrorKind::Busy
                }
                QueryErrorKind::Constraint => ErrorKind::Constraint,
                _ => ErrorKind::Query,
            },
            Error::Type(_) => ErrorKind::Type,
            Error::Session(_) => ErrorKind::Session,
            Error::Pool(p) if p.kind == PoolErrorKind::Timeout => ErrorKind::Timeout,
            Error::Pool(_) => ErrorKind::Pool,
            Error::Schema(_) => ErrorKind::Schema,
            Error::Config(_) => ErrorKind::Config,
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::MultipleFound(_) => ErrorKind::MultipleFound,
            Error::Permission(_) => ErrorKind::Permission,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Constraint(_) => ErrorKind::Constraint,
            Error::MalformedQuery(_) => ErrorKind::MalformedQuery,
            Error::Io(_) => ErrorKind::Io,
            Error::Timeout => ErrorKind::Timeout,
            Error::Serde(_) => ErrorKind::Serde,
            Error::Custom(_) => ErrorKind::Custom,
        }
    }

    /// Is this a retryable error (conflict, busy, deadlock, serialization, timeouts)?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Conflict | ErrorKind::Busy | ErrorKind::Timeout
        )
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

/// Render a primary key for messages: `5` or `(5, 'a')`.
pub fn format_key(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(format_key_part).collect();
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", parts.join(", "))
    }
}

fn format_key_part(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Text(s) => format!("'{}'", s),
        other => match other.as_i64() {
            Some(i) if other.is_integer() => i.to_string(),
            _ => other.to_json().to_string(),
        },
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Session(e) => write!(f, "Session error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::NotFound(e) => write!(f, "{}[{}] not found", e.entity, format_key(&e.key)),
            Error::MultipleFound(e) => {
                write!(f, "Multiple {} objects found for {}", e.entity, e.criteria)
            }
            Error::Permission(e) => match &e.attr {
                Some(attr) => write!(
                    f,
                    "Permission denied: cannot {} {}.{}",
                    e.operation, e.entity, attr
                ),
                None => write!(f, "Permission denied: cannot {} {}", e.operation, e.entity),
            },
            Error::Conflict(e) => write!(
                f,
                "Concurrent modification of {}[{}]: {}",
                e.entity,
                format_key(&e.key),
                e.attrs.join(", ")
            ),
            Error::Constraint(e) => match &e.attr {
                Some(attr) => write!(
                    f,
                    "Constraint violation on {}[{}].{}: {}",
                    e.entity,
                    format_key(&e.key),
                    attr,
                    e.message
                ),
                None => write!(
                    f,
                    "Constraint violation on {}[{}]: {}",
                    e.entity,
                    format_key(&e.key),
                    e.message
                ),
            },
            Error::MalformedQuery(msg) => write!(f, "Malformed query: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "{}.{} {}", self.entity, err.attr, err.message)
        } else {
            writeln!(f, "{} has invalid attributes:", self.entity)?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.attr, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

/// Result type alias for corral operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn query_error(kind: QueryErrorKind) -> Error {
        Error::Query(QueryError {
            kind,
            sql: Some("UPDATE t SET a = ?".to_string()),
            message: "database is locked".to_string(),
            detail: None,
            source: None,
        })
    }

    #[test]
    fn busy_and_conflict_are_retryable() {
        assert_eq!(query_error(QueryErrorKind::Busy).kind(), ErrorKind::Busy);
        assert!(query_error(QueryErrorKind::Busy).is_retryable());
        assert!(!query_error(QueryErrorKind::Syntax).is_retryable());
        assert_eq!(
            query_error(QueryErrorKind::Constraint).kind(),
            ErrorKind::Constraint
        );

        let conflict = Error::Conflict(ConflictError {
            entity: "Person".to_string(),
            key: vec![Value::BigInt(1)],
            attrs: vec!["age".to_string()],
        });
        assert!(conflict.is_retryable());
        assert_eq!(
            conflict.to_string(),
            "Concurrent modification of Person[1]: age"
        );
        assert_eq!(query_error(QueryErrorKind::Busy).sql(), Some("UPDATE t SET a = ?"));
    }

    #[test]
    fn messages_name_entity_and_key() {
        let err = Error::not_found("Order", vec![Value::Int(3), Value::Text("x".into())]);
        assert_eq!(err.to_string(), "Order[(3, 'x')] not found");

        let err = Error::permission("User", Some("password"), "view");
        assert_eq!(err.to_string(), "Permission denied: cannot view User.password");
        assert_eq!(err.kind(), ErrorKind::Permission);

        let mut validation = ValidationError::new("Person");
        validation.add("age", ValidationErrorKind::Min, "must be at least 0, got -1");
        assert_eq!(
            Error::from(validation).to_string(),
            "Validation error: Person.age must be at least 0, got -1"
        );
    }

    #[test]
    fn pool_timeout_classifies_as_timeout() {
        let err = Error::Pool(PoolError {
            kind: PoolErrorKind::Timeout,
            message: "timed out waiting for a connection".to_string(),
            source: None,
        });
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());
    }
}
