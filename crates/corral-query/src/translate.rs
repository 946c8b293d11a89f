//! Translation of declarative [`Query`] values into SQL.
//!
//! Each iteration variable becomes a table alias named after the variable.
//! To-one attribute paths add implicit joins (aliased `<source>_<attr>`),
//! collection iterations join the related table, and aggregates over a
//! collection path become correlated subqueries unless they can be rewritten
//! into a single `LEFT JOIN ... GROUP BY`.

use std::collections::{HashMap, HashSet};

use corral_core::{
    AttrKind, Attribute, Dialect, Error, RelationshipKind, Result, Schema, SqlType, Value,
};

use crate::clause::{Limit, Offset, OrderBy, OrderDirection};
use crate::expr::{BinaryOp, Expr, UnaryOp};
use crate::join::{Join, JoinType};
use crate::query::{Ordering, Query, Source, Wrap};
use crate::select::{FromItem, SelectStatement};
use crate::term::{AggFunc, Term};

/// Shape of one projected item in the result rows.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemShape {
    /// An object whose attributes are spread over several columns.
    Entity {
        /// Entity named by the query; rows may hold subclasses.
        entity: String,
        /// Column positions of each loaded attribute
        attrs: Vec<(String, Vec<usize>)>,
        /// Positions of the key columns
        key: Vec<usize>,
    },
    /// A single column.
    Value {
        position: usize,
        /// Declared type used to coerce the driver value, when known
        sql_type: Option<SqlType>,
    },
}

/// SQL text, bound values and result shape of a translated query.
#[derive(Debug, Clone)]
pub struct Translated {
    pub sql: String,
    pub params: Vec<Value>,
    pub items: Vec<ItemShape>,
}

/// Translates queries against a schema for one SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Translator<'a> {
    schema: &'a Schema,
    dialect: Dialect,
}

impl<'a> Translator<'a> {
    pub fn new(schema: &'a Schema, dialect: Dialect) -> Self {
        Self { schema, dialect }
    }

    /// Translate a query into SQL and bound values.
    #[tracing::instrument(level = "debug", skip_all)]
    #[allow(clippy::result_large_err)]
    pub fn translate(&self, query: &Query) -> Result<Translated> {
        let (select, items) = self.statement(query)?;
        let (sql, params) = select.to_sql(self.dialect);
        tracing::debug!(sql = %sql, params = params.len(), items = items.len(), "Translated query");
        Ok(Translated { sql, params, items })
    }

    /// Translate a query into an unrendered statement.
    #[allow(clippy::result_large_err)]
    pub fn statement(&self, query: &Query) -> Result<(SelectStatement, Vec<ItemShape>)> {
        Run::new(self.schema, query).build()
    }
}

/// `(variable, attribute steps up to and including the collection step)`
type CollKey = (String, Vec<String>);

#[derive(Debug, Clone)]
struct Binding {
    entity: String,
    alias: String,
    /// Outer-joined, so every column may be NULL
    nullable: bool,
    /// Scope whose FROM clause holds the alias
    scope: usize,
}

#[derive(Debug, Default)]
struct Scope {
    parent: Option<usize>,
    vars: Vec<(String, Binding)>,
    collections: Vec<(CollKey, Binding)>,
    implicit: HashMap<(String, String), Binding>,
    from: Option<FromItem>,
    joins: Vec<Join>,
    conditions: Vec<Expr>,
}

enum Resolved {
    Column(Expr),
    Entity(Binding),
}

struct Run<'a, 'q> {
    schema: &'a Schema,
    query: &'q Query,
    scopes: Vec<Scope>,
    aliases: HashSet<String>,
}

fn path_name(var: &str, attrs: &[String]) -> String {
    std::iter::once(var)
        .chain(attrs.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(".")
}

fn columns_expr(alias: &str, columns: &[String]) -> Expr {
    match columns {
        [single] => Expr::qualified(alias, single),
        many => Expr::Tuple(many.iter().map(|c| Expr::qualified(alias, c)).collect()),
    }
}

/// `left.l1 = right.r1 AND left.l2 = right.r2 ...`
fn equate(left: &str, left_cols: &[String], right: &str, right_cols: &[String]) -> Expr {
    let pairs = left_cols
        .iter()
        .zip(right_cols)
        .map(|(l, r)| Expr::qualified(left, l).eq(Expr::qualified(right, r)));
    Expr::all(pairs).unwrap_or_else(|| Expr::raw("1 = 1"))
}

fn conjuncts(term: &Term) -> Vec<&Term> {
    match term {
        Term::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => {
            let mut out = conjuncts(left);
            out.extend(conjuncts(right));
            out
        }
        other => vec![other],
    }
}

fn push_unique(keys: &mut Vec<Expr>, expr: Expr) {
    if !keys.contains(&expr) {
        keys.push(expr);
    }
}

impl<'a, 'q> Run<'a, 'q> {
    fn new(schema: &'a Schema, query: &'q Query) -> Self {
        Self {
            schema,
            query,
            scopes: Vec::new(),
            aliases: HashSet::new(),
        }
    }

    #[allow(clippy::result_large_err)]
    fn build(mut self) -> Result<(SelectStatement, Vec<ItemShape>)> {
        let query = self.query;
        if let Some(message) = &query.error {
            return Err(Error::malformed(message.clone()));
        }
        self.check_prefetch()?;
        self.bind_vars()?;

        let projection: Vec<Term> = if query.projection.is_empty() {
            vec![crate::term::var(query.vars[0].name.clone())]
        } else {
            query.projection.clone()
        };

        let (joined, query_level) = self.plan_aggregates(&projection)?;
        if let Some(key) = &joined {
            self.join_aggregated(key)?;
        }

        let (columns, items) = self.project(&projection)?;

        let mut where_parts = Vec::new();
        let mut having_parts = Vec::new();
        for filter in &query.filters {
            for conjunct in conjuncts(filter) {
                let expr = self.expr(0, conjunct)?;
                if expr.contains_aggregate() || conjunct.has_raw_aggregate() {
                    having_parts.push(expr);
                } else {
                    where_parts.push(expr);
                }
            }
        }

        let grouped = joined.is_some()
            || !having_parts.is_empty()
            || columns.iter().any(Expr::contains_aggregate)
            || projection.iter().any(Term::has_raw_aggregate);
        let group_by = if grouped {
            self.group_keys(joined.is_some(), &columns, &having_parts)?
        } else {
            Vec::new()
        };

        let order_by = self.order_by(&items)?;

        let distinct = match query.distinct {
            Some(forced) => forced,
            None => !query_level && !self.single_object_projection(&projection)?,
        };

        let scope = &mut self.scopes[0];
        let mut conditions = std::mem::take(&mut scope.conditions);
        conditions.extend(where_parts);
        let select = SelectStatement {
            distinct,
            columns,
            from: scope.from.take(),
            joins: std::mem::take(&mut scope.joins),
            where_clause: Expr::all(conditions),
            group_by,
            having: Expr::all(having_parts),
            order_by,
            limit: query.limit.map(Limit),
            offset: query.offset.map(Offset),
            lock: query.lock,
        };

        match query.wrap {
            Some(Wrap::Count) => {
                let outer = SelectStatement {
                    columns: vec![Expr::CountStar],
                    from: Some(FromItem::Subquery {
                        select: Box::new(SelectStatement {
                            lock: None,
                            ..select
                        }),
                        alias: "counted".to_string(),
                    }),
                    ..SelectStatement::default()
                };
                let items = vec![ItemShape::Value {
                    position: 0,
                    sql_type: Some(SqlType::BigInt),
                }];
                Ok((outer, items))
            }
            None => Ok((select, items)),
        }
    }

    // ==================== Bindings ====================

    #[allow(clippy::result_large_err)]
    fn check_prefetch(&self) -> Result<()> {
        for name in &self.query.prefetch {
            let known = name
                .split_once('.')
                .and_then(|(entity, attr)| self.schema.entity(entity).ok()?.attr(attr))
                .is_some();
            if !known {
                return Err(Error::malformed(format!(
                    "'{name}' in prefetch list is not an attribute"
                )));
            }
        }
        Ok(())
    }

    fn fresh_alias(&mut self, base: &str) -> String {
        let mut alias = base.to_string();
        let mut n = 2;
        while self.aliases.contains(&alias) {
            alias = format!("{base}_{n}");
            n += 1;
        }
        self.aliases.insert(alias.clone());
        alias
    }

    #[allow(clippy::result_large_err)]
    fn bind_vars(&mut self) -> Result<()> {
        let query = self.query;
        let schema = self.schema;
        self.scopes.push(Scope::default());
        for var in &query.vars {
            if !self.aliases.insert(var.name.clone()) {
                return Err(Error::malformed(format!(
                    "iteration variable '{}' is declared twice",
                    var.name
                )));
            }
        }

        for (i, var) in query.vars.iter().enumerate() {
            let binding = match &var.source {
                Source::Entity(entity) => {
                    let info = schema.entity(entity)?;
                    let binding = Binding {
                        entity: entity.clone(),
                        alias: var.name.clone(),
                        nullable: false,
                        scope: 0,
                    };
                    let scope = &mut self.scopes[0];
                    if i == 0 {
                        scope.from = Some(FromItem::Table {
                            table: info.table().to_string(),
                            alias: var.name.clone(),
                        });
                    } else {
                        scope.joins.push(Join::cross(info.table(), var.name.clone()));
                    }
                    if let Some(restriction) = self.subclass_restriction(&binding)? {
                        self.scopes[0].conditions.push(restriction);
                    }
                    binding
                }
                Source::Collection(path) => {
                    if i == 0 {
                        return Err(Error::malformed(
                            "the first iteration variable must range over an entity",
                        ));
                    }
                    let Term::Path { var: source, attrs } = path else {
                        return Err(Error::malformed(format!(
                            "'{}' must iterate over an attribute path",
                            var.name
                        )));
                    };
                    let Some((last, prefix)) = attrs.split_last() else {
                        return Err(Error::malformed(format!(
                            "'{}' must iterate over a collection, not a variable",
                            var.name
                        )));
                    };
                    let src = self.resolve_entity(0, source, prefix)?;
                    let attr = self.attribute(&src.entity, last)?;
                    let join_type = if query.outer_collections || src.nullable {
                        JoinType::Left
                    } else {
                        JoinType::Inner
                    };
                    self.join_collection(0, &src, attr, var.name.clone(), join_type)?
                }
            };
            self.scopes[0].vars.push((var.name.clone(), binding));
        }
        Ok(())
    }

    /// `alias.discriminator IN (...)` for subclass entities.
    #[allow(clippy::result_large_err)]
    fn subclass_restriction(&self, binding: &Binding) -> Result<Option<Expr>> {
        let info = self.schema.entity(&binding.entity)?;
        if info.is_root() {
            return Ok(None);
        }
        let Some((attr, _)) = info.discriminator() else {
            return Ok(None);
        };
        let Some(column) = attr.single_column() else {
            return Ok(None);
        };
        let values = self
            .schema
            .discriminator_values(&binding.entity)
            .into_iter()
            .map(Expr::Literal)
            .collect();
        Ok(Some(Expr::qualified(&binding.alias, column).in_list(values)))
    }

    fn lookup_var(&self, scope: usize, name: &str) -> Result<Binding> {
        let mut current = Some(scope);
        while let Some(i) = current {
            if let Some((_, binding)) = self.scopes[i].vars.iter().find(|(n, _)| n == name) {
                return Ok(binding.clone());
            }
            current = self.scopes[i].parent;
        }
        Err(Error::malformed(format!("unknown iteration variable '{name}'")))
    }

    fn lookup_collection(&self, scope: usize, key: &CollKey) -> Option<Binding> {
        let mut current = Some(scope);
        while let Some(i) = current {
            if let Some((_, binding)) = self.scopes[i].collections.iter().find(|(k, _)| k == key) {
                return Some(binding.clone());
            }
            current = self.scopes[i].parent;
        }
        None
    }

    #[allow(clippy::result_large_err)]
    fn attribute(&self, entity: &str, name: &str) -> Result<&'a Attribute> {
        let schema = self.schema;
        schema.entity(entity)?.attr(name).ok_or_else(|| {
            Error::malformed(format!("entity '{entity}' has no attribute '{name}'"))
        })
    }

    #[allow(clippy::result_large_err)]
    fn pk_columns(&self, entity: &str) -> Result<Vec<String>> {
        Ok(self
            .schema
            .entity(entity)?
            .pk_columns()
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    #[allow(clippy::result_large_err)]
    fn key_of(&self, binding: &Binding) -> Result<Resolved> {
        let columns = self.pk_columns(&binding.entity)?;
        Ok(Resolved::Column(columns_expr(&binding.alias, &columns)))
    }

    // ==================== Joins ====================

    /// Join a to-one relationship of `src`, reusing an earlier join of the same step.
    #[allow(clippy::result_large_err)]
    fn to_one_join(&mut self, src: &Binding, attr: &Attribute) -> Result<Binding> {
        let cache_key = (src.alias.clone(), attr.name().to_string());
        if let Some(binding) = self.scopes[src.scope].implicit.get(&cache_key) {
            return Ok(binding.clone());
        }
        let rel = attr.relation().ok_or_else(|| {
            Error::malformed(format!("'{}' is not a relationship", attr.name()))
        })?;
        let target = self.schema.entity(&rel.target)?;
        let alias = self.fresh_alias(&format!("{}_{}", src.alias, attr.name()));
        let nullable = src.nullable || attr.kind() == AttrKind::Optional;
        let on = if rel.holds_fk() {
            equate(&alias, &rel.key_columns, &src.alias, &rel.fk_columns)
        } else {
            equate(&alias, &rel.fk_columns, &src.alias, &rel.key_columns)
        };
        let join = Join {
            join_type: if nullable { JoinType::Left } else { JoinType::Inner },
            table: target.table().to_string(),
            alias: alias.clone(),
            on: Some(on),
        };
        let binding = Binding {
            entity: rel.target.clone(),
            alias,
            nullable,
            scope: src.scope,
        };
        let scope = &mut self.scopes[src.scope];
        scope.joins.push(join);
        scope.implicit.insert(cache_key, binding.clone());
        Ok(binding)
    }

    /// Join the members of a collection attribute of `src` into `scope`.
    #[allow(clippy::result_large_err)]
    fn join_collection(
        &mut self,
        scope: usize,
        src: &Binding,
        attr: &Attribute,
        alias: String,
        join_type: JoinType,
    ) -> Result<Binding> {
        let rel = match attr.relation() {
            Some(rel) if attr.kind() == AttrKind::Set => rel,
            _ => {
                return Err(Error::malformed(format!(
                    "'{}.{}' is not a collection",
                    src.entity,
                    attr.name()
                )));
            }
        };
        let target = self.schema.entity(&rel.target)?;
        match &rel.kind {
            RelationshipKind::ManyToMany { link } => {
                let src_key = self.pk_columns(&src.entity)?;
                let link_alias = self.fresh_alias(&format!("{alias}_link"));
                let on_link = equate(&link_alias, &link.local_columns, &src.alias, &src_key);
                let on_target = equate(&alias, &rel.key_columns, &link_alias, &link.remote_columns);
                let joins = &mut self.scopes[scope].joins;
                joins.push(Join {
                    join_type,
                    table: link.table.clone(),
                    alias: link_alias,
                    on: Some(on_link),
                });
                joins.push(Join {
                    join_type,
                    table: target.table().to_string(),
                    alias: alias.clone(),
                    on: Some(on_target),
                });
            }
            _ => {
                let on = equate(&alias, &rel.fk_columns, &src.alias, &rel.key_columns);
                self.scopes[scope].joins.push(Join {
                    join_type,
                    table: target.table().to_string(),
                    alias: alias.clone(),
                    on: Some(on),
                });
            }
        }
        Ok(Binding {
            entity: rel.target.clone(),
            alias,
            nullable: src.nullable || join_type == JoinType::Left,
            scope,
        })
    }

    /// Open a correlated subquery scope over the collection named by `key`.
    #[allow(clippy::result_large_err)]
    fn open_collection_scope(&mut self, parent: usize, key: &CollKey) -> Result<usize> {
        let (var, steps) = key;
        let Some((last, prefix)) = steps.split_last() else {
            return Err(Error::malformed(format!("'{var}' is not a collection path")));
        };
        let src = self.resolve_entity(parent, var, prefix)?;
        let attr = self.attribute(&src.entity, last)?;
        let rel = match attr.relation() {
            Some(rel) if attr.kind() == AttrKind::Set => rel,
            _ => {
                return Err(Error::malformed(format!(
                    "'{}' is not a collection",
                    path_name(var, steps)
                )));
            }
        };
        let target = self.schema.entity(&rel.target)?;
        let index = self.scopes.len();
        let alias = self.fresh_alias(&format!("{}_{}", src.alias, last));
        let mut scope = Scope {
            parent: Some(parent),
            ..Scope::default()
        };
        match &rel.kind {
            RelationshipKind::ManyToMany { link } => {
                let src_key = self.pk_columns(&src.entity)?;
                let link_alias = self.fresh_alias(&format!("{alias}_link"));
                scope.from = Some(FromItem::Table {
                    table: link.table.clone(),
                    alias: link_alias.clone(),
                });
                scope.joins.push(Join::inner(
                    target.table(),
                    alias.clone(),
                    equate(&alias, &rel.key_columns, &link_alias, &link.remote_columns),
                ));
                scope
                    .conditions
                    .push(equate(&link_alias, &link.local_columns, &src.alias, &src_key));
            }
            _ => {
                scope.from = Some(FromItem::Table {
                    table: target.table().to_string(),
                    alias: alias.clone(),
                });
                scope
                    .conditions
                    .push(equate(&alias, &rel.fk_columns, &src.alias, &rel.key_columns));
            }
        }
        scope.collections.push((
            key.clone(),
            Binding {
                entity: rel.target.clone(),
                alias,
                nullable: false,
                scope: index,
            },
        ));
        self.scopes.push(scope);
        Ok(index)
    }

    fn finish_scope(&mut self, index: usize, columns: Vec<Expr>) -> SelectStatement {
        let scope = &mut self.scopes[index];
        SelectStatement {
            columns,
            from: scope.from.take(),
            joins: std::mem::take(&mut scope.joins),
            where_clause: Expr::all(std::mem::take(&mut scope.conditions)),
            ..SelectStatement::default()
        }
    }

    // ==================== Paths ====================

    /// Last attribute of a path (`None` for a bare variable), checked against the schema.
    #[allow(clippy::result_large_err)]
    fn walk(&self, scope: usize, var: &str, attrs: &[String]) -> Result<Option<&'a Attribute>> {
        let mut entity = self.lookup_var(scope, var)?.entity;
        let mut last = None;
        for (i, name) in attrs.iter().enumerate() {
            let attr = self.attribute(&entity, name)?;
            if i + 1 < attrs.len() {
                match attr.relation() {
                    Some(rel) => entity = rel.target.clone(),
                    None => {
                        return Err(Error::malformed(format!(
                            "'{}' is not a relationship",
                            path_name(var, &attrs[..=i])
                        )));
                    }
                }
            }
            last = Some(attr);
        }
        Ok(last)
    }

    /// First collection step of a path that has no binding in scope yet.
    #[allow(clippy::result_large_err)]
    fn collection_key(&self, scope: usize, var: &str, attrs: &[String]) -> Result<Option<CollKey>> {
        let mut entity = self.lookup_var(scope, var)?.entity;
        for (i, name) in attrs.iter().enumerate() {
            let attr = self.attribute(&entity, name)?;
            let Some(rel) = attr.relation() else { break };
            if attr.kind() == AttrKind::Set {
                let key = (var.to_string(), attrs[..=i].to_vec());
                if self.lookup_collection(scope, &key).is_none() {
                    return Ok(Some(key));
                }
            }
            entity = rel.target.clone();
        }
        Ok(None)
    }

    #[allow(clippy::result_large_err)]
    fn find_collections(&self, scope: usize, term: &Term, out: &mut Vec<CollKey>) -> Result<()> {
        match term {
            Term::Path { var, attrs } => {
                if let Some(key) = self.collection_key(scope, var, attrs)? {
                    if !out.contains(&key) {
                        out.push(key);
                    }
                }
            }
            Term::Binary { left, right, .. } => {
                self.find_collections(scope, left, out)?;
                self.find_collections(scope, right, out)?;
            }
            Term::Not(t) | Term::Neg(t) | Term::IsNull { term: t, .. } => {
                self.find_collections(scope, t, out)?;
            }
            Term::InList { term, items, .. } => {
                self.find_collections(scope, term, out)?;
                for item in items {
                    self.find_collections(scope, item, out)?;
                }
            }
            Term::Between { term, low, high } => {
                self.find_collections(scope, term, out)?;
                self.find_collections(scope, low, out)?;
                self.find_collections(scope, high, out)?;
            }
            Term::Like { term, pattern, .. } => {
                self.find_collections(scope, term, out)?;
                self.find_collections(scope, pattern, out)?;
            }
            Term::Func { args, .. } => {
                for arg in args {
                    self.find_collections(scope, arg, out)?;
                }
            }
            Term::Lit(_)
            | Term::Param(_)
            | Term::Agg { .. }
            | Term::Exists(_)
            | Term::Raw(_)
            | Term::Invalid(_) => {}
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn resolve(
        &mut self,
        scope: usize,
        var: &str,
        attrs: &[String],
        want_entity: bool,
    ) -> Result<Resolved> {
        let mut current = self.lookup_var(scope, var)?;
        if attrs.is_empty() {
            return if want_entity {
                Ok(Resolved::Entity(current))
            } else {
                self.key_of(&current)
            };
        }

        for (i, name) in attrs.iter().enumerate() {
            let attr = self.attribute(&current.entity, name)?;
            let last = i + 1 == attrs.len();

            if attr.kind() == AttrKind::Set {
                let key = (var.to_string(), attrs[..=i].to_vec());
                let Some(binding) = self.lookup_collection(scope, &key) else {
                    return Err(Error::malformed(format!(
                        "collection '{}' can only be used in aggregates, exists() or from_collection()",
                        path_name(var, &attrs[..=i])
                    )));
                };
                current = binding;
                if last {
                    return if want_entity {
                        Ok(Resolved::Entity(current))
                    } else {
                        self.key_of(&current)
                    };
                }
                continue;
            }

            let Some(rel) = attr.relation() else {
                if !last {
                    return Err(Error::malformed(format!(
                        "'{}' is not a relationship",
                        path_name(var, &attrs[..=i])
                    )));
                }
                let column = attr.single_column().ok_or_else(|| {
                    Error::malformed(format!("'{}' has no column", path_name(var, attrs)))
                })?;
                return Ok(Resolved::Column(Expr::qualified(&current.alias, column)));
            };

            if last {
                if !want_entity && rel.holds_fk() {
                    return Ok(Resolved::Column(columns_expr(
                        &current.alias,
                        attr.column_names(),
                    )));
                }
                let target = self.to_one_join(&current, attr)?;
                return if want_entity {
                    Ok(Resolved::Entity(target))
                } else {
                    self.key_of(&target)
                };
            }

            // `car.owner.id` reads the FK column without joining the owner.
            if i + 2 == attrs.len() && rel.holds_fk() {
                let next = self.attribute(&rel.target, &attrs[i + 1])?;
                let position = next
                    .single_column()
                    .filter(|_| next.is_pk())
                    .and_then(|col| rel.key_columns.iter().position(|k| k == col));
                if let Some(position) = position {
                    return Ok(Resolved::Column(Expr::qualified(
                        &current.alias,
                        &rel.fk_columns[position],
                    )));
                }
            }
            current = self.to_one_join(&current, attr)?;
        }
        Err(Error::malformed(format!(
            "cannot resolve '{}'",
            path_name(var, attrs)
        )))
    }

    #[allow(clippy::result_large_err)]
    fn resolve_entity(&mut self, scope: usize, var: &str, attrs: &[String]) -> Result<Binding> {
        match self.resolve(scope, var, attrs, true)? {
            Resolved::Entity(binding) => Ok(binding),
            Resolved::Column(..) => Err(Error::malformed(format!(
                "'{}' does not name an object",
                path_name(var, attrs)
            ))),
        }
    }

    // ==================== Terms ====================

    #[allow(clippy::result_large_err)]
    fn param_value(&self, name: &str) -> Result<Value> {
        self.query
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| Error::malformed(format!("query parameter '{name}' is not bound")))
    }

    fn is_null_literal(&self, term: &Term) -> bool {
        match term {
            Term::Lit(value) => value.is_null(),
            Term::Param(name) => self.query.params.get(name).is_some_and(Value::is_null),
            _ => false,
        }
    }

    #[allow(clippy::result_large_err)]
    fn expr(&mut self, scope: usize, term: &Term) -> Result<Expr> {
        match term {
            Term::Path { var, attrs } => match self.resolve(scope, var, attrs, false)? {
                Resolved::Column(expr) => Ok(expr),
                Resolved::Entity(binding) => match self.key_of(&binding)? {
                    Resolved::Column(expr) => Ok(expr),
                    Resolved::Entity(_) => Err(Error::malformed("unresolvable path")),
                },
            },
            Term::Lit(Value::Default) => Err(Error::malformed(
                "DEFAULT cannot be used as a query value",
            )),
            Term::Lit(value) => Ok(Expr::Literal(value.clone())),
            Term::Param(name) => Ok(Expr::Literal(self.param_value(name)?)),
            Term::Binary { left, op, right } => {
                if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                    let negated = *op == BinaryOp::Ne;
                    let operand = if self.is_null_literal(right) {
                        Some(left)
                    } else if self.is_null_literal(left) {
                        Some(right)
                    } else {
                        None
                    };
                    if let Some(operand) = operand {
                        return Ok(Expr::IsNull {
                            expr: Box::new(self.expr(scope, operand)?),
                            negated,
                        });
                    }
                }
                let left = self.expr(scope, left)?;
                let right = self.expr(scope, right)?;
                Ok(left.binary(*op, right))
            }
            Term::Not(inner) => Ok(self.expr(scope, inner)?.not()),
            Term::Neg(inner) => Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.expr(scope, inner)?),
            }),
            Term::InList {
                term,
                items,
                negated,
            } => {
                let subject = self.expr(scope, term)?;
                let mut values = Vec::new();
                for item in items {
                    let value = match item {
                        Term::Lit(v) => Some(v.clone()),
                        Term::Param(name) => Some(self.param_value(name)?),
                        _ => None,
                    };
                    match value {
                        Some(Value::Array(elements)) => {
                            values.extend(elements.into_iter().map(Expr::Literal));
                        }
                        _ => values.push(self.expr(scope, item)?),
                    }
                }
                if values.is_empty() {
                    return Ok(Expr::raw(if *negated { "1 = 1" } else { "1 = 0" }));
                }
                Ok(Expr::In {
                    expr: Box::new(subject),
                    values,
                    negated: *negated,
                })
            }
            Term::Between { term, low, high } => Ok(Expr::Between {
                expr: Box::new(self.expr(scope, term)?),
                low: Box::new(self.expr(scope, low)?),
                high: Box::new(self.expr(scope, high)?),
                negated: false,
            }),
            Term::Like {
                term,
                pattern,
                negated,
            } => Ok(Expr::Like {
                expr: Box::new(self.expr(scope, term)?),
                pattern: Box::new(self.expr(scope, pattern)?),
                negated: *negated,
            }),
            Term::IsNull { term, negated } => Ok(Expr::IsNull {
                expr: Box::new(self.expr(scope, term)?),
                negated: *negated,
            }),
            Term::Func { func, args } => {
                let args = args
                    .iter()
                    .map(|a| self.expr(scope, a))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::function(func.sql_name(), args))
            }
            Term::Agg { func, arg } => self.aggregate(scope, *func, arg.as_deref()),
            Term::Exists(path) => self.exists(scope, path),
            Term::Raw(raw) => raw.resolve(&self.query.params),
            Term::Invalid(message) => Err(Error::malformed(message.clone())),
        }
    }

    #[allow(clippy::result_large_err)]
    fn aggregate(&mut self, scope: usize, func: AggFunc, arg: Option<&Term>) -> Result<Expr> {
        let Some(arg) = arg else {
            return match func {
                AggFunc::Count => Ok(Expr::CountStar),
                _ => Err(Error::malformed(format!(
                    "{func:?} needs an argument"
                ))),
            };
        };
        let mut keys = Vec::new();
        self.find_collections(scope, arg, &mut keys)?;
        match keys.as_slice() {
            [] => self.aggregate_over(scope, func, arg),
            [key] => {
                let sub = self.open_collection_scope(scope, key)?;
                let value = self.aggregate_over(sub, func, arg)?;
                let select = self.finish_scope(sub, vec![value]);
                Ok(Expr::Subquery(Box::new(select)))
            }
            _ => Err(Error::malformed(
                "an aggregate can range over only one collection",
            )),
        }
    }

    #[allow(clippy::result_large_err)]
    fn aggregate_over(&mut self, scope: usize, func: AggFunc, arg: &Term) -> Result<Expr> {
        let value = match arg {
            Term::Path { var, attrs } => match self.resolve(scope, var, attrs, true)? {
                Resolved::Column(expr) => expr,
                Resolved::Entity(binding) => {
                    let key = self.pk_columns(&binding.entity)?;
                    match (func, key.as_slice()) {
                        (AggFunc::Count, [first, ..]) | (AggFunc::CountDistinct, [first]) => {
                            Expr::qualified(&binding.alias, first)
                        }
                        _ => {
                            return Err(Error::malformed(format!(
                                "{func:?} cannot be applied to '{}' objects",
                                binding.entity
                            )));
                        }
                    }
                }
            },
            other => self.expr(scope, other)?,
        };
        let value = match value {
            Expr::Tuple(items) => items
                .into_iter()
                .next()
                .ok_or_else(|| Error::malformed("empty key"))?,
            other => other,
        };
        Ok(match func {
            AggFunc::Count => Expr::function("COUNT", vec![value]),
            AggFunc::CountDistinct => Expr::Function {
                name: "COUNT".to_string(),
                args: vec![value],
                distinct: true,
            },
            AggFunc::Sum => Expr::coalesce(vec![
                Expr::function("SUM", vec![value]),
                Expr::raw("0"),
            ]),
            AggFunc::Avg => Expr::function("AVG", vec![value]),
            AggFunc::Min => Expr::function("MIN", vec![value]),
            AggFunc::Max => Expr::function("MAX", vec![value]),
        })
    }

    #[allow(clippy::result_large_err)]
    fn exists(&mut self, scope: usize, path: &Term) -> Result<Expr> {
        let Term::Path { var, attrs } = path else {
            return Err(Error::malformed("exists() takes a collection path"));
        };
        let key = (var.clone(), attrs.clone());
        let sub = self.open_collection_scope(scope, &key)?;
        let select = self.finish_scope(sub, vec![Expr::raw("1")]);
        Ok(Expr::Exists {
            select: Box::new(select),
            negated: false,
        })
    }

    // ==================== Projection ====================

    fn prefetched(&self, entity: &str, attr: &Attribute) -> bool {
        self.query.prefetch.iter().any(|name| {
            name.split_once('.').is_some_and(|(e, a)| {
                a == attr.name() && (e == entity || e == attr.declared_in())
            })
        })
    }

    #[allow(clippy::result_large_err)]
    fn entity_item(&self, binding: &Binding, columns: &mut Vec<Expr>) -> Result<ItemShape> {
        let schema = self.schema;
        let info = schema.entity(&binding.entity)?;
        let mut attrs: Vec<&Attribute> = info.attributes().iter().collect();
        for sub in schema.descendants(info.name()) {
            let sub_info = schema.entity(sub)?;
            attrs.extend(
                sub_info
                    .attributes()
                    .iter()
                    .filter(|a| a.declared_in() == sub),
            );
        }

        let mut loaded = Vec::new();
        let mut key = Vec::new();
        for attr in attrs {
            if attr.column_names().is_empty()
                || (attr.is_lazy() && !self.prefetched(info.name(), attr))
            {
                continue;
            }
            let mut positions = Vec::new();
            for column in attr.column_names() {
                if attr.is_pk() {
                    key.push(columns.len());
                }
                positions.push(columns.len());
                columns.push(Expr::qualified(&binding.alias, column));
            }
            loaded.push((attr.name().to_string(), positions));
        }
        Ok(ItemShape::Entity {
            entity: binding.entity.clone(),
            attrs: loaded,
            key,
        })
    }

    #[allow(clippy::result_large_err)]
    fn project(&mut self, terms: &[Term]) -> Result<(Vec<Expr>, Vec<ItemShape>)> {
        let mut columns = Vec::new();
        let mut items = Vec::new();
        for term in terms {
            if let Term::Path { var, attrs } = term {
                let object = match self.walk(0, var, attrs)? {
                    None => true,
                    Some(attr) => attr.is_relation(),
                };
                if object {
                    let binding = self.resolve_entity(0, var, attrs)?;
                    items.push(self.entity_item(&binding, &mut columns)?);
                    continue;
                }
            }
            let expr = self.expr(0, term)?;
            items.push(ItemShape::Value {
                position: columns.len(),
                sql_type: self.static_type(term),
            });
            columns.push(expr);
        }
        Ok((columns, items))
    }

    /// Declared type of a projected term, when it can be told from the schema.
    fn static_type(&self, term: &Term) -> Option<SqlType> {
        use crate::term::Func;
        match term {
            Term::Path { var, attrs } => self
                .walk(0, var, attrs)
                .ok()
                .flatten()
                .filter(|a| !a.is_relation())
                .and_then(|a| a.sql_type().cloned()),
            Term::Func { func, args } => match func {
                Func::Length => Some(SqlType::BigInt),
                _ => args.first().and_then(|a| self.static_type(a)),
            },
            Term::Agg { func, arg } => match func {
                AggFunc::Count | AggFunc::CountDistinct => Some(SqlType::BigInt),
                AggFunc::Avg => Some(SqlType::Double),
                AggFunc::Min | AggFunc::Max => arg.as_deref().and_then(|a| self.static_type(a)),
                AggFunc::Sum => arg
                    .as_deref()
                    .and_then(|a| self.static_type(a))
                    .map(|t| if t.is_integer() { SqlType::BigInt } else { t }),
            },
            Term::Binary { op, .. }
                if op.is_comparison() || matches!(op, BinaryOp::And | BinaryOp::Or) =>
            {
                Some(SqlType::Boolean)
            }
            Term::Not(_)
            | Term::IsNull { .. }
            | Term::Like { .. }
            | Term::InList { .. }
            | Term::Between { .. }
            | Term::Exists(_) => Some(SqlType::Boolean),
            _ => None,
        }
    }

    #[allow(clippy::result_large_err)]
    fn single_object_projection(&self, projection: &[Term]) -> Result<bool> {
        if self.query.vars.len() != 1 {
            return Ok(false);
        }
        let [Term::Path { var, attrs }] = projection else {
            return Ok(false);
        };
        let Some(binding) = self.scopes[0].vars.iter().find(|(n, _)| n == var).map(|(_, b)| b)
        else {
            return Ok(false);
        };
        Ok(match attrs.as_slice() {
            [] => true,
            [attr] => {
                let info = self.schema.entity(&binding.entity)?;
                info.pk_attrs().count() == 1 && info.pk_attrs().any(|a| a.name() == attr)
            }
            _ => false,
        })
    }

    // ==================== Aggregation ====================

    /// Decide which aggregated collection, if any, is joined instead of
    /// computed in correlated subqueries. Also reports query-level aggregates.
    #[allow(clippy::result_large_err)]
    fn plan_aggregates(&self, projection: &[Term]) -> Result<(Option<CollKey>, bool)> {
        let query = self.query;

        let mut hinted: Vec<CollKey> = Vec::new();
        for hint in &query.join_hints {
            let Term::Path { var, attrs } = hint else {
                return Err(Error::malformed("join() takes a collection path"));
            };
            match self.walk(0, var, attrs)? {
                Some(attr) if attr.kind() == AttrKind::Set => {}
                _ => {
                    return Err(Error::malformed(format!(
                        "join hint '{}' is not a collection",
                        path_name(var, attrs)
                    )));
                }
            }
            let key = (var.clone(), attrs.clone());
            if !hinted.contains(&key) {
                hinted.push(key);
            }
        }
        if hinted.len() > 1 {
            return Err(Error::malformed(
                "join() hints name more than one collection path",
            ));
        }

        let mut terms: Vec<&Term> = projection.iter().chain(&query.filters).collect();
        for ordering in &query.order {
            if let Ordering::Term(term, _) = ordering {
                terms.push(term);
            }
        }

        let mut paths: Vec<CollKey> = Vec::new();
        let mut funcs: Vec<AggFunc> = Vec::new();
        let mut query_level = false;
        for term in terms {
            if term.has_raw_aggregate() {
                query_level = true;
            }
            for (func, arg) in term.aggregates() {
                let Some(arg) = arg else {
                    query_level = true;
                    continue;
                };
                let mut keys = Vec::new();
                self.find_collections(0, arg, &mut keys)?;
                match keys.as_slice() {
                    [] => query_level = true,
                    [key] => {
                        if !paths.contains(key) {
                            paths.push(key.clone());
                        }
                        funcs.push(func);
                    }
                    _ => {
                        return Err(Error::malformed(
                            "an aggregate can range over only one collection",
                        ));
                    }
                }
            }
        }

        let fan_out = query
            .vars
            .iter()
            .any(|v| matches!(v.source, Source::Collection(_)));
        let joined = if let Some(key) = hinted.pop() {
            Some(key)
        } else if paths.len() == 1
            && !query_level
            && (!fan_out || funcs.iter().all(|f| f.duplicate_insensitive()))
        {
            paths.pop()
        } else {
            None
        };
        if let Some(key) = &joined {
            tracing::debug!(path = %path_name(&key.0, &key.1), "Aggregated collection joined");
        }
        Ok((joined, query_level))
    }

    #[allow(clippy::result_large_err)]
    fn join_aggregated(&mut self, key: &CollKey) -> Result<()> {
        let (var, steps) = key;
        let Some((last, prefix)) = steps.split_last() else {
            return Err(Error::malformed(format!("'{var}' is not a collection path")));
        };
        let src = self.resolve_entity(0, var, prefix)?;
        let attr = self.attribute(&src.entity, last)?;
        let alias = self.fresh_alias(&format!("{}_{}", src.alias, last));
        let binding = self.join_collection(0, &src, attr, alias, JoinType::Left)?;
        self.scopes[0].collections.push((key.clone(), binding));
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn group_keys(&self, joined: bool, columns: &[Expr], having: &[Expr]) -> Result<Vec<Expr>> {
        let mut keys = Vec::new();
        if joined {
            for (_, binding) in &self.scopes[0].vars {
                for column in self.pk_columns(&binding.entity)? {
                    push_unique(&mut keys, Expr::qualified(&binding.alias, &column));
                }
            }
        }
        for column in columns {
            let mut bare = Vec::new();
            column.bare_columns(&mut bare);
            if column.contains_aggregate() {
                for expr in bare {
                    push_unique(&mut keys, expr);
                }
            } else if !bare.is_empty() {
                push_unique(&mut keys, column.clone());
            }
        }
        for condition in having {
            let mut bare = Vec::new();
            condition.bare_columns(&mut bare);
            for expr in bare {
                push_unique(&mut keys, expr);
            }
        }
        Ok(keys)
    }

    // ==================== Ordering ====================

    #[allow(clippy::result_large_err)]
    fn order_by(&mut self, items: &[ItemShape]) -> Result<Vec<OrderBy>> {
        let query = self.query;
        let mut out = Vec::new();
        for ordering in &query.order {
            match ordering {
                Ordering::Term(term, direction) => {
                    let expr = self.expr(0, term)?;
                    out.push(OrderBy {
                        expr,
                        direction: *direction,
                    });
                }
                Ordering::Position(position) => {
                    let index = usize::try_from(position.unsigned_abs())
                        .ok()
                        .filter(|i| (1..=items.len()).contains(i))
                        .ok_or_else(|| {
                            Error::malformed(format!(
                                "order position {position} is outside 1..={}",
                                items.len()
                            ))
                        })?;
                    let direction = if *position < 0 {
                        OrderDirection::Desc
                    } else {
                        OrderDirection::Asc
                    };
                    let columns: Vec<usize> = match &items[index - 1] {
                        ItemShape::Entity { key, .. } => key.clone(),
                        ItemShape::Value { position, .. } => vec![*position],
                    };
                    for column in columns {
                        out.push(OrderBy {
                            expr: Expr::raw((column + 1).to_string()),
                            direction,
                        });
                    }
                }
                Ordering::Raw(raw) => out.push(OrderBy::asc(raw.resolve(&query.params)?)),
            }
        }
        Ok(out)
    }
}
