//! Declarative query terms.
//!
//! Terms are built from iteration variables (`var("p").attr("age")`),
//! literals and named parameters, and translated to SQL against a
//! [`Schema`](corral_core::Schema) by the [`Translator`](crate::Translator).

use crate::expr::BinaryOp;
use crate::raw::RawSql;
use corral_core::Value;

/// Scalar functions available in terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Upper,
    Lower,
    Length,
    Abs,
    Coalesce,
}

impl Func {
    pub const fn sql_name(self) -> &'static str {
        match self {
            Func::Upper => "UPPER",
            Func::Lower => "LOWER",
            Func::Length => "LENGTH",
            Func::Abs => "ABS",
            Func::Coalesce => "COALESCE",
        }
    }
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    /// Whether repeating input rows leaves the result unchanged.
    pub const fn duplicate_insensitive(self) -> bool {
        matches!(self, AggFunc::CountDistinct | AggFunc::Min | AggFunc::Max)
    }
}

/// A query term.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// Iteration variable followed by attribute steps
    Path { var: String, attrs: Vec<String> },
    Lit(Value),
    /// Named query parameter, bound with [`Query::param`](crate::Query::param)
    Param(String),
    Binary {
        left: Box<Term>,
        op: BinaryOp,
        right: Box<Term>,
    },
    Not(Box<Term>),
    Neg(Box<Term>),
    InList {
        term: Box<Term>,
        items: Vec<Term>,
        negated: bool,
    },
    Between {
        term: Box<Term>,
        low: Box<Term>,
        high: Box<Term>,
    },
    Like {
        term: Box<Term>,
        pattern: Box<Term>,
        negated: bool,
    },
    IsNull {
        term: Box<Term>,
        negated: bool,
    },
    Func { func: Func, args: Vec<Term> },
    /// Aggregate; `arg` is `None` for `COUNT(*)`
    Agg {
        func: AggFunc,
        arg: Option<Box<Term>>,
    },
    /// Non-empty collection path
    Exists(Box<Term>),
    Raw(RawSql),
    /// A term that cannot be translated
    Invalid(String),
}

/// Reference an iteration variable.
pub fn var(name: impl Into<String>) -> Term {
    Term::Path {
        var: name.into(),
        attrs: Vec::new(),
    }
}

pub fn lit(value: impl Into<Value>) -> Term {
    Term::Lit(value.into())
}

/// Reference a named query parameter.
pub fn param(name: impl Into<String>) -> Term {
    Term::Param(name.into())
}

pub fn upper(term: impl Into<Term>) -> Term {
    Term::Func {
        func: Func::Upper,
        args: vec![term.into()],
    }
}

pub fn lower(term: impl Into<Term>) -> Term {
    Term::Func {
        func: Func::Lower,
        args: vec![term.into()],
    }
}

pub fn length(term: impl Into<Term>) -> Term {
    Term::Func {
        func: Func::Length,
        args: vec![term.into()],
    }
}

pub fn abs(term: impl Into<Term>) -> Term {
    Term::Func {
        func: Func::Abs,
        args: vec![term.into()],
    }
}

pub fn coalesce(terms: impl IntoIterator<Item = Term>) -> Term {
    Term::Func {
        func: Func::Coalesce,
        args: terms.into_iter().collect(),
    }
}

fn agg(func: AggFunc, term: Term) -> Term {
    Term::Agg {
        func,
        arg: Some(Box::new(term)),
    }
}

/// Count rows, or related objects when `term` is a collection path.
pub fn count(term: Term) -> Term {
    agg(AggFunc::Count, term)
}

/// `COUNT(*)` over the query rows.
pub fn count_all() -> Term {
    Term::Agg {
        func: AggFunc::Count,
        arg: None,
    }
}

pub fn count_distinct(term: Term) -> Term {
    agg(AggFunc::CountDistinct, term)
}

/// Sum; an empty input sums to zero.
pub fn sum(term: Term) -> Term {
    agg(AggFunc::Sum, term)
}

pub fn avg(term: Term) -> Term {
    agg(AggFunc::Avg, term)
}

pub fn min(term: Term) -> Term {
    agg(AggFunc::Min, term)
}

pub fn max(term: Term) -> Term {
    agg(AggFunc::Max, term)
}

/// True when the collection path has at least one member.
pub fn exists(path: Term) -> Term {
    Term::Exists(Box::new(path))
}

impl Term {
    /// Append an attribute step to a path.
    ///
    /// On anything other than a path the misuse is reported when the query
    /// is translated.
    #[must_use]
    pub fn attr(self, name: impl Into<String>) -> Self {
        match self {
            Term::Path { var, mut attrs } => {
                attrs.push(name.into());
                Term::Path { var, attrs }
            }
            _ => Term::Invalid(format!(
                "attribute step '{}' applied to a non-path term",
                name.into()
            )),
        }
    }

    fn binary(self, op: BinaryOp, other: impl Into<Term>) -> Self {
        Term::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    pub fn and(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn add(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Div, other)
    }

    pub fn concat(self, other: impl Into<Term>) -> Self {
        self.binary(BinaryOp::Concat, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Term::Not(Box::new(self))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn neg(self) -> Self {
        Term::Neg(Box::new(self))
    }

    pub fn in_list<I, T>(self, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Term>,
    {
        Term::InList {
            term: Box::new(self),
            items: items.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in_list<I, T>(self, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Term>,
    {
        Term::InList {
            term: Box::new(self),
            items: items.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    pub fn between(self, low: impl Into<Term>, high: impl Into<Term>) -> Self {
        Term::Between {
            term: Box::new(self),
            low: Box::new(low.into()),
            high: Box::new(high.into()),
        }
    }

    /// SQL LIKE with `%`/`_` wildcards and `\` as escape character.
    pub fn like(self, pattern: impl Into<Term>) -> Self {
        Term::Like {
            term: Box::new(self),
            pattern: Box::new(pattern.into()),
            negated: false,
        }
    }

    pub fn not_like(self, pattern: impl Into<Term>) -> Self {
        Term::Like {
            term: Box::new(self),
            pattern: Box::new(pattern.into()),
            negated: true,
        }
    }

    /// Substring match; wildcards in `text` match literally.
    pub fn contains(self, text: &str) -> Self {
        let pattern = format!("%{}%", crate::expr::Expr::escape_like(text));
        self.like(Term::Lit(Value::Text(pattern)))
    }

    /// Prefix match; wildcards in `text` match literally.
    pub fn starts_with(self, text: &str) -> Self {
        let pattern = format!("{}%", crate::expr::Expr::escape_like(text));
        self.like(Term::Lit(Value::Text(pattern)))
    }

    pub fn is_null(self) -> Self {
        Term::IsNull {
            term: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Term::IsNull {
            term: Box::new(self),
            negated: true,
        }
    }

    /// Whether the term contains an aggregate or an aggregate raw fragment.
    pub fn has_aggregate(&self) -> bool {
        match self {
            Term::Agg { .. } => true,
            Term::Raw(raw) => raw.is_aggregate(),
            Term::Path { .. }
            | Term::Lit(_)
            | Term::Param(_)
            | Term::Exists(_)
            | Term::Invalid(_) => false,
            Term::Binary { left, right, .. } => left.has_aggregate() || right.has_aggregate(),
            Term::Not(t) | Term::Neg(t) | Term::IsNull { term: t, .. } => t.has_aggregate(),
            Term::InList { term, items, .. } => {
                term.has_aggregate() || items.iter().any(Term::has_aggregate)
            }
            Term::Between { term, low, high } => {
                term.has_aggregate() || low.has_aggregate() || high.has_aggregate()
            }
            Term::Like { term, pattern, .. } => term.has_aggregate() || pattern.has_aggregate(),
            Term::Func { args, .. } => args.iter().any(Term::has_aggregate),
        }
    }

    /// Whether a raw fragment marked [`aggregate`](RawSql::aggregate) occurs
    /// outside aggregate arguments.
    pub fn has_raw_aggregate(&self) -> bool {
        match self {
            Term::Raw(raw) => raw.is_aggregate(),
            Term::Binary { left, right, .. } => {
                left.has_raw_aggregate() || right.has_raw_aggregate()
            }
            Term::Not(t) | Term::Neg(t) | Term::IsNull { term: t, .. } => t.has_raw_aggregate(),
            Term::InList { term, items, .. } => {
                term.has_raw_aggregate() || items.iter().any(Term::has_raw_aggregate)
            }
            Term::Between { term, low, high } => {
                term.has_raw_aggregate() || low.has_raw_aggregate() || high.has_raw_aggregate()
            }
            Term::Like { term, pattern, .. } => {
                term.has_raw_aggregate() || pattern.has_raw_aggregate()
            }
            Term::Func { args, .. } => args.iter().any(Term::has_raw_aggregate),
            Term::Path { .. }
            | Term::Lit(_)
            | Term::Param(_)
            | Term::Agg { .. }
            | Term::Exists(_)
            | Term::Invalid(_) => false,
        }
    }

    /// Aggregates contained in this term (not descending into aggregate arguments).
    pub fn aggregates(&self) -> Vec<(AggFunc, Option<&Term>)> {
        let mut out = Vec::new();
        self.collect_aggregates(&mut out);
        out
    }

    fn collect_aggregates<'a>(&'a self, out: &mut Vec<(AggFunc, Option<&'a Term>)>) {
        match self {
            Term::Agg { func, arg } => out.push((*func, arg.as_deref())),
            Term::Binary { left, right, .. } => {
                left.collect_aggregates(out);
                right.collect_aggregates(out);
            }
            Term::Not(t) | Term::Neg(t) | Term::IsNull { term: t, .. } => {
                t.collect_aggregates(out);
            }
            Term::InList { term, items, .. } => {
                term.collect_aggregates(out);
                for item in items {
                    item.collect_aggregates(out);
                }
            }
            Term::Between { term, low, high } => {
                term.collect_aggregates(out);
                low.collect_aggregates(out);
                high.collect_aggregates(out);
            }
            Term::Like { term, pattern, .. } => {
                term.collect_aggregates(out);
                pattern.collect_aggregates(out);
            }
            Term::Func { args, .. } => {
                for arg in args {
                    arg.collect_aggregates(out);
                }
            }
            Term::Path { .. }
            | Term::Lit(_)
            | Term::Param(_)
            | Term::Exists(_)
            | Term::Raw(_)
            | Term::Invalid(_) => {}
        }
    }
}

impl From<Value> for Term {
    fn from(v: Value) -> Self {
        Term::Lit(v)
    }
}

impl From<&str> for Term {
    fn from(s: &str) -> Self {
        Term::Lit(Value::Text(s.to_string()))
    }
}

impl From<String> for Term {
    fn from(s: String) -> Self {
        Term::Lit(Value::Text(s))
    }
}

impl From<i32> for Term {
    fn from(n: i32) -> Self {
        Term::Lit(Value::Int(n))
    }
}

impl From<i64> for Term {
    fn from(n: i64) -> Self {
        Term::Lit(Value::BigInt(n))
    }
}

impl From<f64> for Term {
    fn from(n: f64) -> Self {
        Term::Lit(Value::Double(n))
    }
}

impl From<bool> for Term {
    fn from(b: bool) -> Self {
        Term::Lit(Value::Bool(b))
    }
}

impl From<RawSql> for Term {
    fn from(raw: RawSql) -> Self {
        Term::Raw(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::raw;

    #[test]
    fn paths_accumulate_steps() {
        let term = var("c").attr("owner").attr("name");
        assert_eq!(
            term,
            Term::Path {
                var: "c".to_string(),
                attrs: vec!["owner".to_string(), "name".to_string()],
            }
        );
    }

    #[test]
    fn aggregate_detection() {
        assert!(!var("p").attr("age").gt(20).has_aggregate());
        assert!(count(var("p").attr("cars")).gt(1).has_aggregate());
        assert!(Term::from(raw("sum(x) > 1").aggregate()).has_aggregate());
        assert!(!exists(var("p").attr("cars")).has_aggregate());

        let term = sum(var("p").attr("cars").attr("price")).add(count_all());
        let aggs = term.aggregates();
        assert_eq!(aggs.len(), 2);
        assert_eq!(aggs[0].0, AggFunc::Sum);
        assert!(aggs[1].1.is_none());
    }

    #[test]
    fn contains_escapes_wildcards() {
        let term = var("p").attr("name").contains("50%");
        match term {
            Term::Like { pattern, .. } => {
                assert_eq!(*pattern, Term::Lit(Value::from("%50\\%%")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_insensitive_aggregates() {
        assert!(AggFunc::Max.duplicate_insensitive());
        assert!(AggFunc::CountDistinct.duplicate_insensitive());
        assert!(!AggFunc::Sum.duplicate_insensitive());
        assert!(!AggFunc::Count.duplicate_insensitive());
    }
}
