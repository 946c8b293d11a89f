//! Raw SQL fragments with named parameters.
//!
//! A fragment such as `raw("p.age > $min")` is spliced into a translated
//! query. `$name` references are resolved first from the fragment's own
//! parameters and then from the query's, and are always bound, never
//! interpolated. `$$` produces a literal `$`; text inside single-quoted
//! literals is left alone.

use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::expr::{Expr, FragmentPart};
use corral_core::{Error, Result, Value};

/// A raw SQL fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSql {
    sql: String,
    params: IndexMap<String, Value>,
    aggregate: bool,
}

/// Create a raw SQL fragment.
pub fn raw(sql: impl Into<String>) -> RawSql {
    RawSql::new(sql)
}

fn token_regex() -> &'static Regex {
    static TOKENS: OnceLock<Regex> = OnceLock::new();
    TOKENS.get_or_init(|| {
        Regex::new(r"\$\$|\$([A-Za-z_][A-Za-z0-9_]*)|'(?:[^']|'')*'")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

impl RawSql {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: IndexMap::new(),
            aggregate: false,
        }
    }

    /// Bind a parameter local to this fragment.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Mark the fragment as an aggregate (it goes to HAVING when filtering).
    pub fn aggregate(mut self) -> Self {
        self.aggregate = true;
        self
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Names referenced with `$name`, in order of appearance.
    pub fn referenced_names(&self) -> Vec<&str> {
        token_regex()
            .captures_iter(&self.sql)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    }

    /// Resolve parameters into an expression.
    #[allow(clippy::result_large_err)]
    pub fn resolve(&self, query_params: &IndexMap<String, Value>) -> Result<Expr> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut last = 0;

        for caps in token_regex().captures_iter(&self.sql) {
            let Some(whole) = caps.get(0) else { continue };
            text.push_str(&self.sql[last..whole.start()]);
            last = whole.end();

            let token = whole.as_str();
            if token == "$$" {
                text.push('$');
                continue;
            }
            let Some(name) = caps.get(1) else {
                // Quoted literal
                text.push_str(token);
                continue;
            };
            let name = name.as_str();
            let value = self
                .params
                .get(name)
                .or_else(|| query_params.get(name))
                .ok_or_else(|| {
                    Error::malformed(format!("raw SQL parameter '${name}' is not bound"))
                })?;

            if !text.is_empty() {
                parts.push(FragmentPart::Sql(std::mem::take(&mut text)));
            }
            parts.push(bind_part(name, value)?);
        }
        text.push_str(&self.sql[last..]);
        if !text.is_empty() {
            parts.push(FragmentPart::Sql(text));
        }
        Ok(Expr::Fragment(parts))
    }
}

#[allow(clippy::result_large_err)]
fn bind_part(name: &str, value: &Value) -> Result<FragmentPart> {
    match value {
        Value::Default => Err(Error::malformed(format!(
            "raw SQL parameter '${name}' cannot be DEFAULT"
        ))),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(Error::malformed(format!(
                    "raw SQL parameter '${name}' is an empty list"
                )));
            }
            if items
                .iter()
                .any(|v| matches!(v, Value::Array(_) | Value::Default))
            {
                return Err(Error::malformed(format!(
                    "raw SQL parameter '${name}' contains a nested list or DEFAULT"
                )));
            }
            Ok(FragmentPart::List(items.clone()))
        }
        other => Ok(FragmentPart::Value(other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::Dialect;

    fn render(raw: &RawSql, query: &IndexMap<String, Value>) -> Result<(String, Vec<Value>)> {
        let expr = raw.resolve(query)?;
        let mut params = Vec::new();
        let sql = expr.build_with_dialect(Dialect::Sqlite, &mut params);
        Ok((sql, params))
    }

    #[test]
    fn own_params_shadow_query_params() {
        let mut query = IndexMap::new();
        query.insert("x".to_string(), Value::Int(1));
        query.insert("y".to_string(), Value::Int(2));
        let fragment = raw("a = $x AND b = $y").param("x", 10);
        let (sql, params) = render(&fragment, &query).unwrap();
        assert_eq!(sql, "a = ?1 AND b = ?2");
        assert_eq!(params, vec![Value::Int(10), Value::Int(2)]);
    }

    #[test]
    fn dollars_and_quotes() {
        let fragment = raw("price || '$x' || $$ || $v").param("v", "z");
        let (sql, params) = render(&fragment, &IndexMap::new()).unwrap();
        assert_eq!(sql, "price || '$x' || $ || ?1");
        assert_eq!(params, vec![Value::from("z")]);
    }

    #[test]
    fn arrays_expand() {
        let fragment = raw("id IN $ids").param(
            "ids",
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        );
        let (sql, params) = render(&fragment, &IndexMap::new()).unwrap();
        assert_eq!(sql, "id IN (?1, ?2, ?3)");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn malformed_parameters() {
        let missing = raw("a = $nope");
        assert!(matches!(
            render(&missing, &IndexMap::new()),
            Err(Error::MalformedQuery(_))
        ));
        let nested = raw("a IN $x").param("x", Value::Array(vec![Value::Array(vec![])]));
        assert!(matches!(
            render(&nested, &IndexMap::new()),
            Err(Error::MalformedQuery(_))
        ));
        let default = raw("a = $x").param("x", Value::Default);
        assert!(matches!(
            render(&default, &IndexMap::new()),
            Err(Error::MalformedQuery(_))
        ));
    }

    #[test]
    fn names_and_aggregate_flag() {
        let fragment = raw("sum(x) > $a and $b").aggregate();
        assert!(fragment.is_aggregate());
        assert_eq!(fragment.referenced_names(), vec!["a", "b"]);
    }
}
