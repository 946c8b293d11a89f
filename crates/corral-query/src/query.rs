//! Immutable declarative queries.
//!
//! Every refinement returns a new [`Query`] and leaves the receiver
//! untouched, so a base query can be shared and refined independently.
//!
//! ```ignore
//! let adults = Query::select("p", "Person").filter(var("p").attr("age").gt(20));
//! let names = adults.project([var("p").attr("name")]);
//! ```

use std::ops::Range;

use indexmap::IndexMap;

use crate::clause::OrderDirection;
use crate::raw::RawSql;
use crate::term::{self, Term};
use corral_core::Value;

/// What an iteration variable ranges over.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Every stored object of an entity
    Entity(String),
    /// Members of a to-many path of an earlier variable
    Collection(Term),
}

/// An iteration variable.
#[derive(Debug, Clone, PartialEq)]
pub struct IterVar {
    pub name: String,
    pub source: Source,
}

/// One ORDER BY request.
#[derive(Debug, Clone, PartialEq)]
pub enum Ordering {
    Term(Term, OrderDirection),
    /// 1-based projection position; negative sorts descending
    Position(i64),
    Raw(RawSql),
}

/// What the query computes instead of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrap {
    /// `SELECT COUNT(*) FROM (query)`
    Count,
}

/// A declarative query over entities.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub(crate) vars: Vec<IterVar>,
    pub(crate) outer_collections: bool,
    pub(crate) filters: Vec<Term>,
    pub(crate) projection: Vec<Term>,
    pub(crate) order: Vec<Ordering>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) distinct: Option<bool>,
    pub(crate) join_hints: Vec<Term>,
    pub(crate) prefetch: Vec<String>,
    pub(crate) params: IndexMap<String, Value>,
    pub(crate) lock: Option<bool>,
    pub(crate) wrap: Option<Wrap>,
    pub(crate) error: Option<String>,
}

impl Query {
    fn with_root(var: &str, entity: &str, outer_collections: bool) -> Self {
        Self {
            vars: vec![IterVar {
                name: var.to_string(),
                source: Source::Entity(entity.to_string()),
            }],
            outer_collections,
            filters: Vec::new(),
            projection: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            distinct: None,
            join_hints: Vec::new(),
            prefetch: Vec::new(),
            params: IndexMap::new(),
            lock: None,
            wrap: None,
            error: None,
        }
    }

    /// Iterate `var` over every object of `entity`.
    pub fn select(var: impl AsRef<str>, entity: impl AsRef<str>) -> Self {
        Self::with_root(var.as_ref(), entity.as_ref(), false)
    }

    /// Like [`Query::select`], but collection iterations become outer joins
    /// so rows without related objects are kept.
    pub fn left_join(var: impl AsRef<str>, entity: impl AsRef<str>) -> Self {
        Self::with_root(var.as_ref(), entity.as_ref(), true)
    }

    fn refine(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    fn fail(&self, message: String) -> Self {
        self.refine(|q| {
            if q.error.is_none() {
                q.error = Some(message);
            }
        })
    }

    /// Add an independent iteration variable (cross product).
    pub fn from(&self, var: impl Into<String>, entity: impl Into<String>) -> Self {
        let (var, entity) = (var.into(), entity.into());
        self.refine(|q| {
            q.vars.push(IterVar {
                name: var,
                source: Source::Entity(entity),
            });
        })
    }

    /// Iterate `var` over a to-many path of an earlier variable.
    pub fn from_collection(&self, var: impl Into<String>, path: Term) -> Self {
        let var = var.into();
        self.refine(|q| {
            q.vars.push(IterVar {
                name: var,
                source: Source::Collection(path),
            });
        })
    }

    /// Keep rows matching `condition`; repeated filters are ANDed.
    pub fn filter(&self, condition: impl Into<Term>) -> Self {
        let condition = condition.into();
        self.refine(|q| q.filters.push(condition))
    }

    /// Replace the projection.
    pub fn project<I, T>(&self, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Term>,
    {
        let items: Vec<Term> = items.into_iter().map(Into::into).collect();
        self.refine(|q| q.projection = items)
    }

    pub fn order_by(&self, term: impl Into<Term>) -> Self {
        let term = term.into();
        self.refine(|q| q.order.push(Ordering::Term(term, OrderDirection::Asc)))
    }

    pub fn order_by_desc(&self, term: impl Into<Term>) -> Self {
        let term = term.into();
        self.refine(|q| q.order.push(Ordering::Term(term, OrderDirection::Desc)))
    }

    /// Order by a 1-based projection position; negative positions sort descending.
    pub fn order_by_position(&self, position: i64) -> Self {
        self.refine(|q| q.order.push(Ordering::Position(position)))
    }

    pub fn order_by_raw(&self, raw: RawSql) -> Self {
        self.refine(|q| q.order.push(Ordering::Raw(raw)))
    }

    pub fn limit(&self, limit: u64) -> Self {
        self.refine(|q| q.limit = Some(limit))
    }

    /// Rows `range.start..range.end` of the result.
    pub fn slice(&self, range: Range<u64>) -> Self {
        if range.end < range.start {
            return self.fail(format!(
                "slice end {} is before start {}",
                range.end, range.start
            ));
        }
        self.refine(|q| {
            q.limit = Some(range.end - range.start);
            q.offset = (range.start > 0).then_some(range.start);
        })
    }

    /// Page `page` (1-based) of `size` rows.
    pub fn page(&self, page: u64, size: u64) -> Self {
        if page == 0 {
            return self.fail("page numbers start at 1".to_string());
        }
        let Some(offset) = (page - 1).checked_mul(size) else {
            return self.fail(format!("page {page} of {size} rows is out of range"));
        };
        self.refine(|q| {
            q.limit = Some(size);
            q.offset = (offset > 0).then_some(offset);
        })
    }

    pub fn without_distinct(&self) -> Self {
        self.refine(|q| q.distinct = Some(false))
    }

    pub fn distinct(&self) -> Self {
        self.refine(|q| q.distinct = Some(true))
    }

    /// Force join treatment for aggregates over a collection path.
    pub fn join(&self, path: Term) -> Self {
        self.refine(|q| q.join_hints.push(path))
    }

    /// Load `Entity.attr` together with the results: a lazy column is selected,
    /// a relationship is loaded in bulk after the rows.
    pub fn prefetch(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.refine(|q| {
            if !q.prefetch.contains(&name) {
                q.prefetch.push(name);
            }
        })
    }

    /// Bind a named parameter.
    pub fn param(&self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let (name, value) = (name.into(), value.into());
        self.refine(|q| {
            q.params.insert(name, value);
        })
    }

    /// Lock selected rows for the rest of the transaction.
    pub fn for_update(&self, nowait: bool) -> Self {
        self.refine(|q| q.lock = Some(nowait))
    }

    // ==================== Scalar helpers ====================

    /// Number of result rows.
    pub fn count_of(&self) -> Self {
        self.refine(|q| {
            q.order.clear();
            q.wrap = Some(Wrap::Count);
        })
    }

    fn aggregate_of(&self, term: Term) -> Self {
        self.refine(|q| {
            q.projection = vec![term];
            q.order.clear();
            q.distinct = Some(false);
        })
    }

    /// Sum of `term` over the rows.
    pub fn sum_of(&self, term: impl Into<Term>) -> Self {
        self.aggregate_of(term::sum(term.into()))
    }

    pub fn avg_of(&self, term: impl Into<Term>) -> Self {
        self.aggregate_of(term::avg(term.into()))
    }

    pub fn min_of(&self, term: impl Into<Term>) -> Self {
        self.aggregate_of(term::min(term.into()))
    }

    pub fn max_of(&self, term: impl Into<Term>) -> Self {
        self.aggregate_of(term::max(term.into()))
    }

    // ==================== Accessors ====================

    pub fn vars(&self) -> &[IterVar] {
        &self.vars
    }

    /// `Entity.attr` names requested with [`Query::prefetch`].
    pub fn prefetches(&self) -> &[String] {
        &self.prefetch
    }

    pub fn params(&self) -> &IndexMap<String, Value> {
        &self.params
    }

    /// Whether the query locks rows, and with `NOWAIT`.
    pub fn lock(&self) -> Option<bool> {
        self.lock
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }
}
