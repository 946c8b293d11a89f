//! Loading rows into the identity map.
//!
//! Every read goes through [`SessionInner::materialize`], which resolves a
//! row to the instance registered under its key. Values already cached for
//! an instance are kept; the row only fills in what the instance lacks.

use crate::change_tracker::{Field, Instance};
use crate::identity_map::{ObjId, ObjectKey};
use crate::{Item, SessionInner, State};
use corral_core::error::{MultipleFoundError, SchemaErrorKind, format_key};
use corral_core::{Attribute, Error, RelationshipKind, Result, Row, Schema, SqlType, Value};
use corral_query::{
    Expr, ItemShape, Join, Query, RawSql, SelectStatement, Translator, lit, var,
};
use indexmap::{IndexMap, IndexSet};
use std::rc::Rc;
use tracing::debug;

/// Where the attributes of one entity sit in a result row.
#[derive(Debug, Clone)]
pub(crate) struct EntityShape {
    pub entity: String,
    pub attrs: Vec<(String, Vec<usize>)>,
    pub key: Vec<usize>,
}

/// One projected item before handles are attached.
pub(crate) enum Fetched {
    Object(ObjId),
    Value(Value),
}

/// Column attributes of `entity` and of its subclasses, inherited first.
#[allow(clippy::result_large_err)]
fn loadable_attrs<'s>(schema: &'s Schema, entity: &str) -> Result<Vec<&'s Attribute>> {
    let info = schema.entity(entity)?;
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
    attrs.retain(|a| !a.column_names().is_empty());
    Ok(attrs)
}

/// `alias.discriminator IN (...)` when `entity` is not a hierarchy root.
#[allow(clippy::result_large_err)]
fn subclass_restriction(schema: &Schema, entity: &str, alias: &str) -> Result<Option<Expr>> {
    let info = schema.entity(entity)?;
    if info.is_root() {
        return Ok(None);
    }
    let Some(column) = info.discriminator().and_then(|(a, _)| a.single_column()) else {
        return Ok(None);
    };
    let values = schema
        .discriminator_values(entity)
        .into_iter()
        .map(Expr::Literal)
        .collect();
    Ok(Some(Expr::qualified(alias, column).in_list(values)))
}

/// `alias.c1 = v1 AND alias.c2 = v2 ...`
fn columns_equal<'a>(
    alias: &str,
    columns: impl IntoIterator<Item = &'a str>,
    values: &[Value],
) -> Option<Expr> {
    Expr::all(
        columns
            .into_iter()
            .zip(values)
            .map(|(c, v)| Expr::qualified(alias, c).eq(Expr::Literal(v.clone()))),
    )
}

/// SELECT of every stored object of `entity` (subclasses included).
#[allow(clippy::result_large_err)]
pub(crate) fn entity_select(
    schema: &Schema,
    entity: &str,
    alias: &str,
    with_lazy: bool,
) -> Result<(SelectStatement, EntityShape)> {
    let info = schema.entity(entity)?;
    let mut select = SelectStatement::from_table(info.table(), alias);
    let mut shape = EntityShape {
        entity: entity.to_string(),
        attrs: Vec::new(),
        key: Vec::new(),
    };
    for attr in loadable_attrs(schema, entity)? {
        if attr.is_lazy() && !with_lazy {
            continue;
        }
        let mut positions = Vec::new();
        for column in attr.column_names() {
            if attr.is_pk() {
                shape.key.push(select.columns.len());
            }
            positions.push(select.columns.len());
            select = select.column(Expr::qualified(alias, column));
        }
        shape.attrs.push((attr.name().to_string(), positions));
    }
    if let Some(restriction) = subclass_restriction(schema, entity, alias)? {
        select = select.filter(restriction);
    }
    Ok((select, shape))
}

fn column(row: &Row, position: usize) -> Value {
    row.get(position).cloned().unwrap_or(Value::Null)
}

/// Instance registered under a key, or a new stub for it.
#[allow(clippy::result_large_err)]
pub(crate) fn stub(
    schema: &Schema,
    state: &mut State,
    entity: &str,
    values: Vec<Value>,
) -> Result<ObjId> {
    let root = schema.root_of(entity)?;
    let key = ObjectKey::new(root.name(), values);
    Ok(match state.map.lookup(&key) {
        Some(id) => id,
        None => state.map.insert(Instance::stub(entity, key)),
    })
}

fn refine(schema: &Schema, instance: &mut Instance, concrete: &str) {
    if instance.entity != concrete && schema.is_subclass_of(concrete, &instance.entity) {
        instance.entity = concrete.to_string();
    }
}

impl SessionInner {
    /// Resolve the entity columns of a row to an instance.
    ///
    /// Returns `None` when the key columns are NULL (the unmatched side of
    /// an outer join).
    #[allow(clippy::result_large_err)]
    pub(crate) fn materialize(
        &self,
        state: &mut State,
        row: &Row,
        shape: &EntityShape,
    ) -> Result<Option<ObjId>> {
        let schema = &*self.schema;
        let root = schema.root_of(&shape.entity)?;
        let pk_types: Vec<&SqlType> = root
            .pk_attrs()
            .flat_map(|a| a.column_types().iter())
            .collect();
        let mut key = Vec::with_capacity(shape.key.len());
        for (position, sql_type) in shape.key.iter().zip(pk_types) {
            let value = column(row, *position);
            if value.is_null() {
                return Ok(None);
            }
            key.push(value.coerce(sql_type)?);
        }

        let mut concrete = shape.entity.clone();
        if let Some((disc, _)) = root.discriminator() {
            if let Some((_, positions)) = shape.attrs.iter().find(|(a, _)| a == disc.name()) {
                let value = positions.first().map_or(Value::Null, |p| column(row, *p));
                if let Some(info) = schema.entity_for_discriminator(root.name(), &value) {
                    concrete = info.name().to_string();
                }
            }
        }

        let object_key = ObjectKey::new(root.name(), key);
        let id = match state.map.lookup(&object_key) {
            Some(id) => {
                if let Some(instance) = state.map.get_mut(id) {
                    refine(schema, instance, &concrete);
                }
                id
            }
            None => state.map.insert(Instance::stub(&concrete, object_key)),
        };
        let entity = state.map.get(id).map(|i| i.entity.clone()).unwrap_or(concrete);
        let info = schema.entity(&entity)?;

        for (name, positions) in &shape.attrs {
            // Columns of sibling subclasses are NULL for this row.
            let Some(attr) = info.attr(name) else { continue };
            let mut columns = Vec::with_capacity(positions.len());
            for (position, sql_type) in positions.iter().zip(attr.column_types()) {
                columns.push(column(row, *position).coerce(sql_type)?);
            }
            let field = match attr.relation() {
                Some(rel) => {
                    if columns.iter().any(Value::is_null) {
                        Field::Ref(None)
                    } else {
                        Field::Ref(Some(stub(schema, state, &rel.target, columns.clone())?))
                    }
                }
                None => Field::Value(columns.first().cloned().unwrap_or(Value::Null)),
            };
            let Some(instance) = state.map.get_mut(id) else { continue };
            instance.observe(name, field, columns);

            if let (Some(rel), Some(Field::Ref(Some(target)))) =
                (attr.relation(), instance.fields.get(name.as_str()).cloned())
            {
                if matches!(rel.kind, RelationshipKind::OneToOne { owner: true }) {
                    if let Some(partner) = state.map.get_mut(target) {
                        partner
                            .fields
                            .entry(rel.reverse.clone())
                            .or_insert(Field::Ref(Some(id)));
                    }
                }
            }
        }

        if let Some(instance) = state.map.get_mut(id) {
            instance.loaded = info
                .attributes()
                .iter()
                .filter(|a| !a.column_names().is_empty() && !a.is_lazy())
                .all(|a| instance.fields.contains_key(a.name()));
        }
        Ok(Some(id))
    }

    /// Run a SELECT built by [`entity_select`] and materialize its rows.
    #[allow(clippy::result_large_err)]
    fn load_objects(&self, select: &SelectStatement, shape: &EntityShape) -> Result<Vec<ObjId>> {
        let (sql, params) = select.to_sql(self.conn.dialect());
        let rows = self.query(&sql, &params)?;
        let mut state = self.state.borrow_mut();
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(id) = self.materialize(&mut state, row, shape)? {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Load the row of an instance, filling in what it lacks.
    #[allow(clippy::result_large_err)]
    pub(crate) fn load_row(&self, id: ObjId, with_lazy: bool) -> Result<()> {
        let (entity, key) = self.instance(id, |i| (i.entity.clone(), i.key.clone()))?;
        let Some(key) = key else {
            return Ok(());
        };
        let info = self.schema.entity(&entity)?;
        let (mut select, shape) = entity_select(&self.schema, &entity, "t", with_lazy)?;
        if let Some(filter) = columns_equal("t", info.pk_columns(), key.values()) {
            select = select.filter(filter);
        }
        debug!(key = %key, with_lazy, "Loading object");
        if self.load_objects(&select, &shape)?.is_empty() {
            return Err(Error::not_found(entity, key.values().to_vec()));
        }
        Ok(())
    }

    /// Key values coerced to the key types of `entity`.
    #[allow(clippy::result_large_err)]
    fn coerce_key(&self, entity: &str, values: Vec<Value>) -> Result<ObjectKey> {
        let root = self.schema.root_of(entity)?;
        let types: Vec<&SqlType> = root
            .pk_attrs()
            .flat_map(|a| a.column_types().iter())
            .collect();
        if types.len() != values.len() {
            return Err(Error::malformed(format!(
                "{entity} keys have {} values, got {}",
                types.len(),
                values.len()
            )));
        }
        let values = values
            .into_iter()
            .zip(types)
            .map(|(v, t)| v.coerce(t))
            .collect::<Result<Vec<_>>>()?;
        Ok(ObjectKey::new(root.name(), values))
    }

    /// Instance of `entity` with the given key, loading it when needed.
    #[allow(clippy::result_large_err)]
    pub(crate) fn get_by_key(&self, entity: &str, values: Vec<Value>) -> Result<Option<ObjId>> {
        let key = self.coerce_key(entity, values)?;
        let known = self.state.borrow().map.lookup(&key);
        if let Some(id) = known {
            let (status, loaded) = self.instance(id, |i| (i.status, i.loaded))?;
            if status.is_deleted() {
                return Ok(None);
            }
            if !loaded {
                match self.load_row(id, false) {
                    Err(Error::NotFound(_)) => return Ok(None),
                    other => other?,
                }
            }
            let actual = self.entity_of(id)?;
            return Ok(self.schema.is_subclass_of(&actual, entity).then_some(id));
        }

        let info = self.schema.entity(entity)?;
        let (mut select, shape) = entity_select(&self.schema, entity, "t", false)?;
        if let Some(filter) = columns_equal("t", info.pk_columns(), key.values()) {
            select = select.filter(filter);
        }
        let found = self.load_objects(&select, &shape)?.into_iter().next();
        match found {
            Some(id) if self.instance(id, |i| i.status.is_deleted())? => Ok(None),
            other => Ok(other),
        }
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn get_for_update(
        &self,
        entity: &str,
        values: Vec<Value>,
        nowait: bool,
    ) -> Result<Option<ObjId>> {
        self.auto_flush()?;
        self.begin_if_needed(true, nowait)?;
        let key = self.coerce_key(entity, values)?;
        let info = self.schema.entity(entity)?;
        let (mut select, shape) = entity_select(&self.schema, entity, "t", false)?;
        if let Some(filter) = columns_equal("t", info.pk_columns(), key.values()) {
            select = select.filter(filter);
        }
        select.lock = Some(nowait);
        let found = self.load_objects(&select, &shape)?.into_iter().next();
        match found {
            Some(id) if self.instance(id, |i| i.status.is_deleted())? => Ok(None),
            other => Ok(other),
        }
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn get_by(&self, entity: &str, criteria: &[(&str, Value)]) -> Result<Option<ObjId>> {
        let info = self.schema.entity(entity)?;
        for (name, _) in criteria {
            if info.attr(name).is_none() {
                return Err(Error::schema(
                    SchemaErrorKind::UnknownAttribute,
                    format!("{entity} has no attribute '{name}'"),
                ));
            }
        }

        let pk_names: Vec<&str> = info.pk_attrs().map(Attribute::name).collect();
        if criteria.len() == pk_names.len()
            && pk_names.iter().all(|p| criteria.iter().any(|(n, _)| n == p))
        {
            let values = pk_names
                .iter()
                .filter_map(|p| criteria.iter().find(|(n, _)| n == p))
                .map(|(_, v)| v.clone())
                .collect();
            return self.get_by_key(entity, values);
        }

        if let [(name, value)] = criteria {
            let attr = info.attr(name).filter(|a| a.is_unique() && !a.is_relation());
            if attr.is_some() {
                let state = self.state.borrow();
                let cached = state.map.iter().find(|(_, i)| {
                    !i.status.is_deleted()
                        && self.schema.is_subclass_of(&i.entity, entity)
                        && matches!(i.fields.get(*name), Some(Field::Value(v)) if v.key_eq(value))
                });
                if let Some((id, _)) = cached {
                    return Ok(Some(id));
                }
            }
        }

        let mut query = Query::select("x", entity);
        for (name, value) in criteria {
            query = query.filter(var("x").attr(*name).eq(lit(value.clone())));
        }
        let ids: Vec<ObjId> = self
            .fetch_raw(&query.limit(2))?
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(Fetched::Object(id)) => Some(id),
                _ => None,
            })
            .collect();
        if ids.len() > 1 {
            let criteria = criteria
                .iter()
                .map(|(n, v)| format!("{n}={}", format_key(std::slice::from_ref(v))))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Error::MultipleFound(MultipleFoundError {
                entity: entity.to_string(),
                criteria,
            }));
        }
        Ok(ids.into_iter().next())
    }

    // ------------------------------------------------------------------
    // Declarative queries
    // ------------------------------------------------------------------

    /// Execute a query, materializing entity items.
    ///
    /// Rows that contain an object deleted in this session are dropped.
    #[allow(clippy::result_large_err)]
    pub(crate) fn fetch_raw(&self, query: &Query) -> Result<Vec<Vec<Fetched>>> {
        self.auto_flush()?;
        if let Some(nowait) = query.lock() {
            self.begin_if_needed(true, nowait)?;
        }
        let dialect = self.conn.dialect();
        let translated = {
            let mut state = self.state.borrow_mut();
            let translator = Translator::new(&self.schema, dialect);
            state.cache.get_or_translate(&translator, dialect, query)?
        };
        let rows = self.query(&translated.sql, &translated.params)?;

        let shapes: Vec<Option<EntityShape>> = translated
            .items
            .iter()
            .map(|item| match item {
                ItemShape::Entity { entity, attrs, key } => Some(EntityShape {
                    entity: entity.clone(),
                    attrs: attrs.clone(),
                    key: key.clone(),
                }),
                ItemShape::Value { .. } => None,
            })
            .collect();

        let mut state = self.state.borrow_mut();
        let mut out = Vec::with_capacity(rows.len());
        'rows: for row in &rows {
            let mut items = Vec::with_capacity(shapes.len());
            for (item, shape) in translated.items.iter().zip(&shapes) {
                match (item, shape) {
                    (_, Some(shape)) => match self.materialize(&mut state, row, shape)? {
                        Some(id) => {
                            if state.map.get(id).is_some_and(|i| i.status.is_deleted()) {
                                continue 'rows;
                            }
                            items.push(Fetched::Object(id));
                        }
                        None => items.push(Fetched::Value(Value::Null)),
                    },
                    (ItemShape::Value { position, sql_type }, None) => {
                        let value = column(row, *position);
                        let value = match sql_type {
                            Some(t) => value.coerce(t)?,
                            None => value,
                        };
                        items.push(Fetched::Value(value));
                    }
                    (ItemShape::Entity { .. }, None) => {}
                }
            }
            out.push(items);
        }
        drop(state);

        if !query.prefetches().is_empty() {
            let loaded: Vec<ObjId> = out
                .iter()
                .flatten()
                .filter_map(|f| match f {
                    Fetched::Object(id) => Some(*id),
                    Fetched::Value(_) => None,
                })
                .collect();
            self.prefetch(query.prefetches(), &loaded)?;
        }
        Ok(out)
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn fetch(self: &Rc<Self>, query: &Query) -> Result<Vec<Vec<Item>>> {
        Ok(self
            .fetch_raw(query)?
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|f| match f {
                        Fetched::Object(id) => Item::Entity(self.handle(id)),
                        Fetched::Value(v) => Item::Value(v),
                    })
                    .collect()
            })
            .collect())
    }

    /// Load related objects named `Entity.attr` for the objects of a result.
    #[allow(clippy::result_large_err)]
    fn prefetch(&self, names: &[String], loaded: &[ObjId]) -> Result<()> {
        for name in names {
            let Some((entity, attr_name)) = name.split_once('.') else {
                continue;
            };
            let attr = self.schema.attribute(entity, attr_name)?;
            let Some(rel) = attr.relation() else {
                // Lazy columns are selected by the translator.
                continue;
            };
            let mut owners: IndexSet<ObjId> = IndexSet::new();
            for id in loaded {
                if self.schema.is_subclass_of(&self.entity_of(*id)?, entity) {
                    owners.insert(*id);
                }
            }
            debug!(prefetch = %name, owners = owners.len(), "Prefetching");

            if rel.is_to_many() {
                if matches!(rel.kind, RelationshipKind::OneToMany) {
                    self.load_members_bulk(attr, &owners)?;
                } else {
                    for owner in &owners {
                        self.ensure_members(*owner, attr)?;
                    }
                }
                continue;
            }

            let mut targets: IndexSet<ObjId> = IndexSet::new();
            for owner in &owners {
                if let Some(target) = self.current_ref(*owner, attr)? {
                    targets.insert(target);
                }
            }
            self.load_stubs(&rel.target, &targets)?;
        }
        Ok(())
    }

    /// Load every unloaded instance among `ids` with one query per batch.
    #[allow(clippy::result_large_err)]
    fn load_stubs(&self, entity: &str, ids: &IndexSet<ObjId>) -> Result<()> {
        let mut keys = Vec::new();
        for id in ids {
            let (loaded, key) = self.instance(*id, |i| (i.loaded, i.key.clone()))?;
            if let (false, Some(key)) = (loaded, key) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return Ok(());
        }
        let info = self.schema.entity(entity)?;
        let pk = info.pk_columns();
        let (select, shape) = entity_select(&self.schema, entity, "t", false)?;
        if let [column] = pk.as_slice() {
            let values = keys
                .iter()
                .filter_map(|k| k.values().first().cloned())
                .map(Expr::Literal)
                .collect();
            let select = select.filter(Expr::qualified("t", *column).in_list(values));
            self.load_objects(&select, &shape)?;
        } else {
            for key in &keys {
                let mut one = select.clone();
                if let Some(filter) = columns_equal("t", pk.iter().copied(), key.values()) {
                    one = one.filter(filter);
                }
                self.load_objects(&one, &shape)?;
            }
        }
        Ok(())
    }

    /// Load one-to-many collections of several owners at once.
    #[allow(clippy::result_large_err)]
    fn load_members_bulk(&self, attr: &Attribute, owners: &IndexSet<ObjId>) -> Result<()> {
        let Some(rel) = attr.relation() else {
            return Ok(());
        };
        let mut pending = Vec::new();
        for owner in owners {
            let (loaded, key) = self.instance(*owner, |i| {
                (i.loaded_members(attr.name()).is_some(), i.key.clone())
            })?;
            if let (false, Some(key)) = (loaded, key) {
                pending.push((*owner, key));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }
        let [fk] = rel.fk_columns.as_slice() else {
            for (owner, _) in &pending {
                self.ensure_members(*owner, attr)?;
            }
            return Ok(());
        };
        let (select, shape) = entity_select(&self.schema, &rel.target, "t", false)?;
        let values = pending
            .iter()
            .filter_map(|(_, k)| k.values().first().cloned())
            .map(Expr::Literal)
            .collect();
        let select = select.filter(Expr::qualified("t", fk.as_str()).in_list(values));
        self.load_objects(&select, &shape)?;

        let mut state = self.state.borrow_mut();
        for (owner, _) in pending {
            let members = referencing(&state, &self.schema, &rel.target, &rel.reverse, owner);
            if let Some(instance) = state.map.get_mut(owner) {
                let slot = instance.members_mut(attr.name());
                slot.ids = members;
                slot.loaded = true;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    /// Current target of a to-one attribute, loading it when unknown.
    #[allow(clippy::result_large_err)]
    pub(crate) fn current_ref(&self, id: ObjId, attr: &Attribute) -> Result<Option<ObjId>> {
        let cached = self.instance(id, |i| match i.fields.get(attr.name()) {
            Some(Field::Ref(target)) => Some(*target),
            _ => None,
        })?;
        if let Some(target) = cached {
            return Ok(target);
        }
        let key = self.instance(id, |i| match i.status {
            crate::Status::Created => None,
            _ => i.key.clone(),
        })?;
        let (Some(rel), Some(key)) = (attr.relation(), key) else {
            return Ok(None);
        };
        if rel.holds_fk() {
            self.load_row(id, false)?;
        } else {
            // The other side stores the key; ask for the partner row.
            self.auto_flush()?;
            let (mut select, shape) = entity_select(&self.schema, &rel.target, "t", false)?;
            if let Some(filter) =
                columns_equal("t", rel.fk_columns.iter().map(String::as_str), key.values())
            {
                select = select.filter(filter);
            }
            self.load_objects(&select, &shape)?;
            self.instance_mut(id, |i| {
                i.fields
                    .entry(attr.name().to_string())
                    .or_insert(Field::Ref(None));
            })?;
        }
        self.instance(id, |i| match i.fields.get(attr.name()) {
            Some(Field::Ref(target)) => *target,
            _ => None,
        })
    }

    /// Load the members of a collection unless they are known.
    #[allow(clippy::result_large_err)]
    pub(crate) fn ensure_members(&self, id: ObjId, attr: &Attribute) -> Result<()> {
        let (loaded, key) =
            self.instance(id, |i| (i.loaded_members(attr.name()).is_some(), i.key.clone()))?;
        if loaded {
            return Ok(());
        }
        let Some(rel) = attr.relation() else {
            return Err(Error::schema(
                SchemaErrorKind::Relationship,
                format!("'{}' is not a collection", attr.name()),
            ));
        };
        let Some(key) = key else {
            self.instance_mut(id, |i| i.members_mut(attr.name()).loaded = true)?;
            return Ok(());
        };
        self.auto_flush()?;

        let (mut select, shape) = entity_select(&self.schema, &rel.target, "t", false)?;
        match &rel.kind {
            RelationshipKind::OneToMany => {
                if let Some(filter) =
                    columns_equal("t", rel.fk_columns.iter().map(String::as_str), key.values())
                {
                    select = select.filter(filter);
                }
                self.load_objects(&select, &shape)?;
                let mut state = self.state.borrow_mut();
                let members = referencing(&state, &self.schema, &rel.target, &rel.reverse, id);
                if let Some(instance) = state.map.get_mut(id) {
                    let slot = instance.members_mut(attr.name());
                    slot.ids = members;
                    slot.loaded = true;
                }
            }
            RelationshipKind::ManyToMany { link } => {
                let target = self.schema.entity(&rel.target)?;
                let on = Expr::all(
                    link.remote_columns
                        .iter()
                        .zip(target.pk_columns())
                        .map(|(l, t)| Expr::qualified("l", l.as_str()).eq(Expr::qualified("t", t))),
                );
                if let Some(on) = on {
                    select = select.join(Join::inner(&link.table, "l", on));
                }
                if let Some(filter) =
                    columns_equal("l", link.local_columns.iter().map(String::as_str), key.values())
                {
                    select = select.filter(filter);
                }
                let found = self.load_objects(&select, &shape)?;
                let changes = self.pending_links(id, attr)?;
                let mut state = self.state.borrow_mut();
                let mut members: IndexSet<ObjId> = found
                    .into_iter()
                    .filter(|m| state.map.get(*m).is_some_and(|i| !i.status.is_deleted()))
                    .collect();
                for (member, add) in changes {
                    if add {
                        members.insert(member);
                    } else {
                        members.shift_remove(&member);
                    }
                }
                if let Some(instance) = state.map.get_mut(id) {
                    let slot = instance.members_mut(attr.name());
                    slot.ids = members;
                    slot.loaded = true;
                }
            }
            _ => {
                return Err(Error::schema(
                    SchemaErrorKind::Relationship,
                    format!("'{}' is not a collection", attr.name()),
                ));
            }
        }
        Ok(())
    }

    /// Number of members, counted in the store unless they are loaded.
    #[allow(clippy::result_large_err)]
    pub(crate) fn count_members(&self, id: ObjId, attr: &Attribute) -> Result<usize> {
        let (loaded, key) = self.instance(id, |i| {
            (i.loaded_members(attr.name()).map(IndexSet::len), i.key.clone())
        })?;
        if let Some(n) = loaded {
            return Ok(n);
        }
        let (Some(key), Some(rel)) = (key, attr.relation()) else {
            return Ok(0);
        };
        self.auto_flush()?;
        let mut select = match &rel.kind {
            RelationshipKind::OneToMany => {
                let target = self.schema.entity(&rel.target)?;
                let mut select = SelectStatement::from_table(target.table(), "t");
                if let Some(filter) =
                    columns_equal("t", rel.fk_columns.iter().map(String::as_str), key.values())
                {
                    select = select.filter(filter);
                }
                if let Some(restriction) = subclass_restriction(&self.schema, &rel.target, "t")? {
                    select = select.filter(restriction);
                }
                select
            }
            RelationshipKind::ManyToMany { link } => {
                let mut select = SelectStatement::from_table(&link.table, "t");
                if let Some(filter) =
                    columns_equal("t", link.local_columns.iter().map(String::as_str), key.values())
                {
                    select = select.filter(filter);
                }
                select
            }
            _ => return Ok(0),
        };
        select.columns.push(Expr::count_star());
        let (sql, params) = select.to_sql(self.conn.dialect());
        let rows = self.query(&sql, &params)?;
        let count = rows
            .first()
            .and_then(|r| r.get(0))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Load objects of `entity` with a raw SELECT, matching columns by name.
    #[allow(clippy::result_large_err)]
    pub(crate) fn fetch_by_sql(&self, entity: &str, raw: &RawSql) -> Result<Vec<ObjId>> {
        self.auto_flush()?;
        let expr = raw.resolve(&IndexMap::new())?;
        let mut params = Vec::new();
        let sql = expr.build_with_dialect(self.conn.dialect(), &mut params);
        let rows = self.query(&sql, &params)?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };

        let columns = first.column_info();
        let mut shape = EntityShape {
            entity: entity.to_string(),
            attrs: Vec::new(),
            key: Vec::new(),
        };
        for attr in loadable_attrs(&self.schema, entity)? {
            let positions: Option<Vec<usize>> = attr
                .column_names()
                .iter()
                .map(|c| columns.index_of(c))
                .collect();
            match positions {
                Some(positions) => {
                    if attr.is_pk() {
                        shape.key.extend(&positions);
                    }
                    shape.attrs.push((attr.name().to_string(), positions));
                }
                None if attr.is_pk() => {
                    return Err(Error::malformed(format!(
                        "raw SELECT for {entity} must return the key column '{}'",
                        attr.column_names().join(", ")
                    )));
                }
                None => {}
            }
        }

        let mut state = self.state.borrow_mut();
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(id) = self.materialize(&mut state, row, &shape)? {
                let actual = state.map.get(id).map(|i| i.entity.clone()).unwrap_or_default();
                if !self.schema.is_subclass_of(&actual, entity) {
                    return Err(Error::malformed(format!(
                        "raw SELECT for {entity} returned a {actual} row"
                    )));
                }
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// Live instances of `entity` whose to-one `attr` points at `owner`.
fn referencing(
    state: &State,
    schema: &Schema,
    entity: &str,
    attr: &str,
    owner: ObjId,
) -> IndexSet<ObjId> {
    state
        .map
        .iter()
        .filter(|(_, i)| {
            !i.status.is_deleted()
                && schema.is_subclass_of(&i.entity, entity)
                && i.fields.get(attr) == Some(&Field::Ref(Some(owner)))
        })
        .map(|(id, _)| id)
        .collect()
}
