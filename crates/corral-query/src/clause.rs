//! ORDER BY and pagination clauses.

use crate::expr::Expr;
use corral_core::{Dialect, Value};

/// ORDER BY item.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: OrderDirection,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    /// The opposite direction.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            OrderDirection::Asc => OrderDirection::Desc,
            OrderDirection::Desc => OrderDirection::Asc,
        }
    }
}

impl OrderBy {
    /// Create an ascending order by clause.
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: OrderDirection::Asc,
        }
    }

    /// Create a descending order by clause.
    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: OrderDirection::Desc,
        }
    }

    /// Generate SQL for this ORDER BY item.
    pub fn build(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        let mut sql = self.expr.build_with_dialect(dialect, params);
        sql.push_str(match self.direction {
            OrderDirection::Asc => "",
            OrderDirection::Desc => " DESC",
        });
        sql
    }
}

/// LIMIT clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit(pub u64);

/// OFFSET clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_by_direction() {
        let mut params = Vec::new();
        let asc = OrderBy::asc(Expr::qualified("p", "name"));
        assert_eq!(asc.build(Dialect::Sqlite, &mut params), "\"p\".\"name\"");
        let desc = Expr::col("age").desc();
        assert_eq!(desc.build(Dialect::Mysql, &mut params), "`age` DESC");
        assert_eq!(OrderDirection::Desc.reverse(), OrderDirection::Asc);
    }
}
