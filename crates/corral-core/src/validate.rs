//! Runtime validation of identifiers and attribute values.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use regex::Regex;

use crate::Result;
use crate::attribute::{AttrKind, Attribute};
use crate::error::{ValidationError, ValidationErrorKind};
use crate::value::Value;

/// Compiled patterns, shared by every schema in the process.
struct RegexCache {
    cache: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compile(&self, pattern: &str) -> std::result::Result<Regex, regex::Error> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(regex) = cache.get(pattern) {
                return Ok(regex.clone());
            }
        }

        let regex = Regex::new(pattern)?;
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Check if a string matches a regex pattern.
///
/// An invalid pattern is logged and treated as a non-match.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
    match regex_cache().get_or_compile(pattern) {
        Ok(regex) => regex.is_match(value),
        Err(e) => {
            tracing::warn!(
                pattern = pattern,
                error = %e,
                "Invalid regex pattern in validation, treating as non-match"
            );
            false
        }
    }
}

/// Returns an error message if the pattern does not compile.
pub fn validate_pattern(pattern: &str) -> Option<String> {
    match regex_cache().get_or_compile(pattern) {
        Ok(_) => None,
        Err(e) => Some(format!("invalid regex pattern: {e}")),
    }
}

/// Whether `name` can be used unquoted as an entity, attribute, table or column name.
pub fn is_identifier(name: &str) -> bool {
    matches_pattern(name, r"^[A-Za-z_][A-Za-z0-9_]*$")
}

/// Check a value about to be assigned to a scalar attribute.
///
/// Returns the value coerced to the declared column type.
#[allow(clippy::result_large_err)]
pub fn check_value(entity: &str, attr: &Attribute, value: Value) -> Result<Value> {
    let mut errors = ValidationError::new(entity);
    let Some(sql_type) = attr.sql_type() else {
        return Ok(value);
    };

    if value.is_null() {
        let may_be_null = attr.kind() == AttrKind::Optional
            || (attr.kind() == AttrKind::PrimaryKey && attr.is_auto());
        if !may_be_null {
            errors.add(attr.name(), ValidationErrorKind::Required, "is required");
            return Err(errors.into());
        }
        return Ok(value);
    }

    let original_type = value.type_name();
    let value = match value.coerce(sql_type) {
        Ok(v) => v,
        Err(_) => {
            errors.add(
                attr.name(),
                ValidationErrorKind::Type,
                format!("expects {}, got {}", sql_type.json_kind(), original_type),
            );
            return Err(errors.into());
        }
    };

    let (min, max) = attr.bounds();
    if let Some(n) = value.as_f64().filter(|_| sql_type.is_numeric()) {
        if let Some(min) = min.filter(|min| n < *min) {
            errors.add(
                attr.name(),
                ValidationErrorKind::Min,
                format!("must be at least {min}, got {n}"),
            );
        }
        if let Some(max) = max.filter(|max| n > *max) {
            errors.add(
                attr.name(),
                ValidationErrorKind::Max,
                format!("must be at most {max}, got {n}"),
            );
        }
    }

    if let Some(text) = value.as_str().filter(|_| sql_type.is_text()) {
        let len = text.chars().count();
        let (min_len, declared_max) = attr.length_bounds();
        let max_len = declared_max.or_else(|| sql_type.max_length().map(|n| n as usize));
        if let Some(min_len) = min_len.filter(|m| len < *m) {
            errors.add(
                attr.name(),
                ValidationErrorKind::MinLength,
                format!("must be at least {min_len} characters, got {len}"),
            );
        }
        if let Some(max_len) = max_len.filter(|m| len > *m) {
            errors.add(
                attr.name(),
                ValidationErrorKind::MaxLength,
                format!("must be at most {max_len} characters, got {len}"),
            );
        }
        if let Some(pattern) = attr.pattern_str() {
            if !matches_pattern(text, pattern) {
                errors.add(
                    attr.name(),
                    ValidationErrorKind::Pattern,
                    format!("must match pattern '{pattern}'"),
                );
            }
        }
    }

    errors.into_result()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::SqlType;

    fn kinds(result: Result<Value>) -> Vec<ValidationErrorKind> {
        match result {
            Err(Error::Validation(v)) => v.errors.iter().map(|e| e.kind).collect(),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("Person"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("a b"));
        assert!(!is_identifier("name\"; DROP"));
    }

    #[test]
    fn coerces_and_checks_bounds() {
        let age = Attribute::required("age", SqlType::BigInt).min(0.0).max(150.0);
        assert_eq!(
            check_value("Person", &age, Value::Int(30)).unwrap(),
            Value::BigInt(30)
        );
        assert_eq!(
            kinds(check_value("Person", &age, Value::Int(-1))),
            vec![ValidationErrorKind::Min]
        );
        assert_eq!(
            kinds(check_value("Person", &age, Value::Null)),
            vec![ValidationErrorKind::Required]
        );
        assert_eq!(
            kinds(check_value("Person", &age, Value::Text("old".into()))),
            vec![ValidationErrorKind::Type]
        );
    }

    #[test]
    fn text_length_and_pattern() {
        let code = Attribute::optional("code", SqlType::VarChar(4)).pattern("^[A-Z]+$");
        assert!(check_value("Item", &code, Value::Null).is_ok());
        assert!(check_value("Item", &code, Value::from("ABC")).is_ok());
        assert_eq!(
            kinds(check_value("Item", &code, Value::from("abcde"))),
            vec![ValidationErrorKind::MaxLength, ValidationErrorKind::Pattern]
        );
    }

    #[test]
    fn invalid_pattern_is_reported() {
        assert!(validate_pattern("(").is_some());
        assert!(validate_pattern("^a+$").is_none());
        assert!(!matches_pattern("a", "("));
    }
}
