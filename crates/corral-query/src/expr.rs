//! SQL expressions.
//!
//! [`Expr`] is the SQL-level tree the translator emits. Values are carried
//! inline and become placeholders while the statement is rendered, so
//! parameters always end up in textual order.

use crate::clause::OrderBy;
use crate::select::SelectStatement;
use corral_core::{Dialect, Value};

/// A SQL expression that can be used in SELECT lists, WHERE, HAVING, etc.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference with optional table qualifier
    Column {
        table: Option<String>,
        name: String,
    },

    /// Bound value
    Literal(Value),

    /// Binary operation (e.g., a = b, a > b)
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// Unary operation (e.g., NOT a, -a)
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// Function call (e.g., UPPER(name), COUNT(DISTINCT x))
    Function {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
    },

    /// IN expression
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    /// BETWEEN expression
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },

    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },

    /// LIKE / NOT LIKE with a backslash escape
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },

    /// Scalar subquery
    Subquery(Box<SelectStatement>),

    /// EXISTS (subquery)
    Exists {
        select: Box<SelectStatement>,
        negated: bool,
    },

    /// Raw SQL with bound values spliced in
    Fragment(Vec<FragmentPart>),

    /// Special aggregate: COUNT(*)
    CountStar,

    /// Parenthesized tuple, e.g. `(a, b)`
    Tuple(Vec<Expr>),
}

/// Piece of a raw SQL fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentPart {
    Sql(String),
    /// One placeholder
    Value(Value),
    /// `(?, ?, ...)` for each element
    List(Vec<Value>),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// String concatenation (|| or CONCAT on MySQL)
    Concat,
}

impl BinaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Concat => "||",
        }
    }

    /// Get the precedence of this operator (higher = binds tighter).
    pub const fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Concat => 7,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 8,
        }
    }

    /// Whether `a op (b op c)` equals `(a op b) op c`.
    const fn is_associative(self) -> bool {
        matches!(
            self,
            BinaryOp::And | BinaryOp::Or | BinaryOp::Add | BinaryOp::Mul | BinaryOp::Concat
        )
    }

    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Precedence of NOT and of postfix predicates (IS NULL, IN, LIKE, BETWEEN).
const NOT_PRECEDENCE: u8 = 3;
const PREDICATE_PRECEDENCE: u8 = 4;
const ATOM_PRECEDENCE: u8 = 10;

impl Expr {
    // ==================== Constructors ====================

    /// Unqualified column reference.
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    /// Column qualified with a table alias.
    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: column.into(),
        }
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Raw SQL without parameters.
    pub fn raw(sql: impl Into<String>) -> Self {
        Expr::Fragment(vec![FragmentPart::Sql(sql.into())])
    }

    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
            distinct: false,
        }
    }

    pub fn count_star() -> Self {
        Expr::CountStar
    }

    pub fn coalesce(args: Vec<Expr>) -> Self {
        Expr::function("COALESCE", args)
    }

    // ==================== Operators ====================

    pub fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    /// IN list; an empty list is always false.
    pub fn in_list(self, values: Vec<Expr>) -> Self {
        if values.is_empty() {
            return Expr::raw("1 = 0");
        }
        Expr::In {
            expr: Box::new(self),
            values,
            negated: false,
        }
    }

    /// AND all expressions together; `None` when empty.
    pub fn all(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(Expr::and)
    }

    /// Escape LIKE wildcards in user text.
    pub fn escape_like(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if matches!(c, '%' | '_' | '\\') {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }

    /// Whether this expression (outside subqueries) contains an aggregate call.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::CountStar => true,
            Expr::Function { name, args, .. } => {
                is_aggregate_name(name) || args.iter().any(Expr::contains_aggregate)
            }
            Expr::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.contains_aggregate(),
            Expr::In { expr, values, .. } => {
                expr.contains_aggregate() || values.iter().any(Expr::contains_aggregate)
            }
            Expr::Between {
                expr, low, high, ..
            } => expr.contains_aggregate() || low.contains_aggregate() || high.contains_aggregate(),
            Expr::Like { expr, pattern, .. } => {
                expr.contains_aggregate() || pattern.contains_aggregate()
            }
            Expr::Tuple(items) => items.iter().any(Expr::contains_aggregate),
            Expr::Column { .. }
            | Expr::Literal(_)
            | Expr::Subquery(_)
            | Expr::Exists { .. }
            | Expr::Fragment(_) => false,
        }
    }

    /// Column references outside aggregate calls and subqueries.
    pub fn bare_columns(&self, out: &mut Vec<Expr>) {
        match self {
            Expr::Column { .. } => {
                if !out.contains(self) {
                    out.push(self.clone());
                }
            }
            Expr::Function { name, args, .. } => {
                if !is_aggregate_name(name) {
                    for arg in args {
                        arg.bare_columns(out);
                    }
                }
            }
            Expr::Binary { left, right, .. } => {
                left.bare_columns(out);
                right.bare_columns(out);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.bare_columns(out),
            Expr::In { expr, values, .. } => {
                expr.bare_columns(out);
                for v in values {
                    v.bare_columns(out);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.bare_columns(out);
                low.bare_columns(out);
                high.bare_columns(out);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.bare_columns(out);
                pattern.bare_columns(out);
            }
            Expr::Tuple(items) => {
                for item in items {
                    item.bare_columns(out);
                }
            }
            Expr::Literal(_)
            | Expr::Subquery(_)
            | Expr::Exists { .. }
            | Expr::Fragment(_)
            | Expr::CountStar => {}
        }
    }

    /// Ascending order on this expression.
    pub fn asc(self) -> OrderBy {
        OrderBy::asc(self)
    }

    /// Descending order on this expression.
    pub fn desc(self) -> OrderBy {
        OrderBy::desc(self)
    }

    const fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Unary {
                op: UnaryOp::Not, ..
            } => NOT_PRECEDENCE,
            Expr::In { .. } | Expr::Between { .. } | Expr::IsNull { .. } | Expr::Like { .. } => {
                PREDICATE_PRECEDENCE
            }
            // Raw SQL could be anything; treat it as loosest.
            Expr::Fragment(_) => 0,
            _ => ATOM_PRECEDENCE,
        }
    }

    // ==================== SQL Generation ====================

    /// Render with a given dialect, pushing bound values onto `params`.
    pub fn build_with_dialect(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        match self {
            Expr::Column { table, name } => {
                if let Some(t) = table {
                    format!(
                        "{}.{}",
                        dialect.quote_identifier(t),
                        dialect.quote_identifier(name)
                    )
                } else {
                    dialect.quote_identifier(name)
                }
            }

            Expr::Literal(value) => {
                if matches!(value, Value::Default) {
                    "DEFAULT".to_string()
                } else {
                    params.push(value.clone());
                    dialect.placeholder(params.len())
                }
            }

            Expr::Binary { left, op, right } => {
                let prec = op.precedence();
                let left_sql = left.build_operand(dialect, params, prec, true);
                let right_sql =
                    right.build_operand(dialect, params, prec, op.is_associative());
                if *op == BinaryOp::Concat && dialect == Dialect::Mysql {
                    format!("CONCAT({left_sql}, {right_sql})")
                } else {
                    format!("{left_sql} {} {right_sql}", op.as_str())
                }
            }

            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => {
                    let inner = expr.build_operand(dialect, params, NOT_PRECEDENCE, true);
                    format!("NOT {inner}")
                }
                UnaryOp::Neg => {
                    let inner = expr.build_operand(dialect, params, ATOM_PRECEDENCE, false);
                    format!("-{inner}")
                }
            },

            Expr::Function {
                name,
                args,
                distinct,
            } => {
                let arg_sqls: Vec<_> = args
                    .iter()
                    .map(|a| a.build_with_dialect(dialect, params))
                    .collect();
                let distinct = if *distinct { "DISTINCT " } else { "" };
                format!("{name}({distinct}{})", arg_sqls.join(", "))
            }

            Expr::In {
                expr,
                values,
                negated,
            } => {
                let expr_sql = expr.build_operand(dialect, params, ATOM_PRECEDENCE, false);
                let value_sqls: Vec<_> = values
                    .iter()
                    .map(|v| v.build_with_dialect(dialect, params))
                    .collect();
                let not_str = if *negated { "NOT " } else { "" };
                format!("{expr_sql} {not_str}IN ({})", value_sqls.join(", "))
            }

            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let expr_sql = expr.build_operand(dialect, params, ATOM_PRECEDENCE, false);
                let low_sql = low.build_operand(dialect, params, ATOM_PRECEDENCE, false);
                let high_sql = high.build_operand(dialect, params, ATOM_PRECEDENCE, false);
                let not_str = if *negated { "NOT " } else { "" };
                format!("{expr_sql} {not_str}BETWEEN {low_sql} AND {high_sql}")
            }

            Expr::IsNull { expr, negated } => {
                let expr_sql = expr.build_operand(dialect, params, ATOM_PRECEDENCE, false);
                let not_str = if *negated { " NOT" } else { "" };
                format!("{expr_sql} IS{not_str} NULL")
            }

            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let expr_sql = expr.build_operand(dialect, params, ATOM_PRECEDENCE, false);
                let pattern_sql = pattern.build_operand(dialect, params, ATOM_PRECEDENCE, false);
                let not_str = if *negated { "NOT " } else { "" };
                format!("{expr_sql} {not_str}LIKE {pattern_sql} ESCAPE '\\'")
            }

            Expr::Subquery(select) => format!("({})", select.build(dialect, params)),

            Expr::Exists { select, negated } => {
                let not_str = if *negated { "NOT " } else { "" };
                format!("{not_str}EXISTS ({})", select.build(dialect, params))
            }

            Expr::Fragment(parts) => {
                let mut sql = String::new();
                for part in parts {
                    match part {
                        FragmentPart::Sql(text) => sql.push_str(text),
                        FragmentPart::Value(value) => {
                            params.push(value.clone());
                            sql.push_str(&dialect.placeholder(params.len()));
                        }
                        FragmentPart::List(values) => {
                            let placeholders: Vec<String> = values
                                .iter()
                                .map(|v| {
                                    params.push(v.clone());
                                    dialect.placeholder(params.len())
                                })
                                .collect();
                            sql.push('(');
                            sql.push_str(&placeholders.join(", "));
                            sql.push(')');
                        }
                    }
                }
                sql
            }

            Expr::CountStar => "COUNT(*)".to_string(),

            Expr::Tuple(items) => {
                let sqls: Vec<_> = items
                    .iter()
                    .map(|i| i.build_with_dialect(dialect, params))
                    .collect();
                format!("({})", sqls.join(", "))
            }
        }
    }

    /// Render as an operand of an operator with precedence `parent`.
    fn build_operand(
        &self,
        dialect: Dialect,
        params: &mut Vec<Value>,
        parent: u8,
        same_level_ok: bool,
    ) -> String {
        let sql = self.build_with_dialect(dialect, params);
        let own = self.precedence();
        if own < parent || (own == parent && !same_level_ok && own != ATOM_PRECEDENCE) {
            format!("({sql})")
        } else {
            sql
        }
    }
}

/// Aggregate function names the translator emits.
pub fn is_aggregate_name(name: &str) -> bool {
    matches!(
        name.to_ascii_uppercase().as_str(),
        "COUNT" | "SUM" | "AVG" | "MIN" | "MAX" | "GROUP_CONCAT"
    )
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Literal(Value::Text(s.to_string()))
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        Expr::Literal(Value::Int(n))
    }
}

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        Expr::Literal(Value::BigInt(n))
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Literal(Value::Bool(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite(expr: &Expr) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = expr.build_with_dialect(Dialect::Sqlite, &mut params);
        (sql, params)
    }

    #[test]
    fn column_and_literal() {
        let (sql, params) = sqlite(&Expr::qualified("p", "age").gt(20));
        assert_eq!(sql, "\"p\".\"age\" > ?1");
        assert_eq!(params, vec![Value::Int(20)]);
    }

    #[test]
    fn or_inside_and_is_parenthesized() {
        let expr = Expr::col("a")
            .eq(1)
            .or(Expr::col("b").eq(2))
            .and(Expr::col("c").eq(3));
        let (sql, params) = sqlite(&expr);
        assert_eq!(sql, "(\"a\" = ?1 OR \"b\" = ?2) AND \"c\" = ?3");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn non_associative_right_operand() {
        let expr = Expr::col("a").binary(
            BinaryOp::Sub,
            Expr::col("b").binary(BinaryOp::Sub, Expr::col("c")),
        );
        assert_eq!(sqlite(&expr).0, "\"a\" - (\"b\" - \"c\")");
        let expr = Expr::col("a")
            .binary(BinaryOp::Add, Expr::col("b"))
            .binary(BinaryOp::Mul, Expr::col("c"));
        assert_eq!(sqlite(&expr).0, "(\"a\" + \"b\") * \"c\"");
    }

    #[test]
    fn not_wraps_comparisons() {
        let (sql, _) = sqlite(&Expr::col("a").eq(1).and(Expr::col("b").eq(2)).not());
        assert_eq!(sql, "NOT (\"a\" = ?1 AND \"b\" = ?2)");
        let (sql, _) = sqlite(&Expr::col("a").is_null().not());
        assert_eq!(sql, "NOT \"a\" IS NULL");
    }

    #[test]
    fn fragments_expand_lists_in_order() {
        let expr = Expr::Fragment(vec![
            FragmentPart::Sql("x IN ".into()),
            FragmentPart::List(vec![Value::Int(1), Value::Int(2)]),
            FragmentPart::Sql(" AND y = ".into()),
            FragmentPart::Value(Value::from("z")),
        ]);
        let mut params = vec![Value::Int(0)];
        let sql = expr.build_with_dialect(Dialect::Postgres, &mut params);
        assert_eq!(sql, "x IN ($2, $3) AND y = $4");
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn aggregate_detection() {
        let sum = Expr::function("SUM", vec![Expr::col("price")]);
        assert!(sum.contains_aggregate());
        assert!(sum.clone().gt(10).contains_aggregate());
        assert!(!Expr::function("UPPER", vec![Expr::col("n")]).contains_aggregate());

        let mut cols = Vec::new();
        sum.gt(Expr::col("limit")).bare_columns(&mut cols);
        assert_eq!(cols, vec![Expr::col("limit")]);
    }

    #[test]
    fn like_escaping() {
        assert_eq!(Expr::escape_like("50%_a\\"), "50\\%\\_a\\\\");
        let expr = Expr::Like {
            expr: Box::new(Expr::col("name")),
            pattern: Box::new(Expr::lit("%x%")),
            negated: true,
        };
        assert_eq!(sqlite(&expr).0, "\"name\" NOT LIKE ?1 ESCAPE '\\'");
    }

    #[test]
    fn mysql_concat() {
        let mut params = Vec::new();
        let sql = Expr::col("a")
            .binary(BinaryOp::Concat, Expr::col("b"))
            .build_with_dialect(Dialect::Mysql, &mut params);
        assert_eq!(sql, "CONCAT(`a`, `b`)");
    }
}
