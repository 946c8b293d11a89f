//! Writing pending changes to the store.
//!
//! A flush runs in this order:
//! - INSERT new objects, referenced objects first
//! - UPDATE modified objects, qualified by the values that were read
//! - DELETE, then INSERT, link table rows
//! - DELETE removed objects, referencing objects first
//!
//! New objects that reference each other through optional attributes are
//! inserted with those columns NULL and completed by an UPDATE afterwards.

use crate::State;
use crate::change_tracker::{Field, Status};
use crate::identity_map::{IdentityMap, ObjId, ObjectKey};
use corral_core::error::ConflictError;
use corral_core::{AttrKind, Attribute, Connection, Error, Result, Schema, Value};
use corral_query::{Delete, Insert, Update, column_matches, key_matches};
use indexmap::IndexSet;
use std::collections::HashSet;
use tracing::{debug, trace};

/// Result of a flush operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    pub links_added: usize,
    pub links_removed: usize,
}

impl FlushResult {
    /// Total number of statements that changed something.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.links_added + self.links_removed
    }
}

/// Column values stored for a field: the value itself, or the key of the
/// referenced object. `None` when the referenced object has no key yet.
fn column_values(map: &IdentityMap, attr: &Attribute, field: Option<&Field>) -> Option<Vec<Value>> {
    let width = attr.column_names().len();
    match field {
        None | Some(Field::Ref(None)) => Some(vec![Value::Null; width]),
        Some(Field::Value(v)) => Some(vec![v.clone()]),
        Some(Field::Ref(Some(target))) => map
            .get(*target)
            .and_then(|t| t.key.as_ref())
            .map(|k| k.values().to_vec()),
    }
}

fn unsaved_reference(entity: &str, attr: &Attribute) -> Error {
    Error::constraint(
        entity,
        Vec::new(),
        Some(attr.name()),
        format!("'{}' refers to an object that was never saved", attr.name()),
    )
}

#[allow(clippy::result_large_err)]
pub(crate) fn flush(schema: &Schema, conn: &dyn Connection, state: &mut State) -> Result<FlushResult> {
    let mut result = FlushResult::default();
    insert_created(schema, conn, &mut state.map, &mut result)?;
    update_modified(schema, conn, &mut state.map, &mut result)?;
    write_links(schema, conn, state, &mut result)?;
    delete_marked(schema, conn, &mut state.map, &mut result)?;
    Ok(result)
}

// ============================================================================
// Inserts
// ============================================================================

/// A reference from one new object to another.
struct Dependency {
    attr: String,
    target: ObjId,
    /// Required references cannot be back-filled
    hard: bool,
}

/// Insert order of the new objects, with the attributes each one has to
/// leave NULL until its targets exist.
#[allow(clippy::result_large_err)]
fn insert_order(schema: &Schema, map: &IdentityMap) -> Result<Vec<(ObjId, Vec<String>)>> {
    let created: IndexSet<ObjId> = map
        .iter()
        .filter(|(_, i)| i.status == Status::Created)
        .map(|(id, _)| id)
        .collect();

    let mut deps: Vec<(ObjId, Vec<Dependency>)> = Vec::with_capacity(created.len());
    for id in &created {
        let Some(instance) = map.get(*id) else { continue };
        let info = schema.entity(&instance.entity)?;
        let mut list = Vec::new();
        for attr in info.attributes() {
            if !attr.relation().is_some_and(|r| r.holds_fk()) {
                continue;
            }
            if let Some(Field::Ref(Some(target))) = instance.fields.get(attr.name()) {
                if created.contains(target) {
                    list.push(Dependency {
                        attr: attr.name().to_string(),
                        target: *target,
                        hard: attr.kind() == AttrKind::Required,
                    });
                }
            }
        }
        deps.push((*id, list));
    }

    let mut done: HashSet<ObjId> = HashSet::new();
    let mut order = Vec::with_capacity(deps.len());
    while !deps.is_empty() {
        let ready = deps
            .iter()
            .position(|(_, d)| d.iter().all(|d| done.contains(&d.target)));
        let pos = match ready {
            Some(pos) => pos,
            None => deps
                .iter()
                .position(|(_, d)| d.iter().filter(|d| d.hard).all(|d| done.contains(&d.target)))
                .ok_or_else(|| {
                    let entity = map
                        .get(deps[0].0)
                        .map(|i| i.entity.clone())
                        .unwrap_or_default();
                    Error::constraint(
                        entity,
                        Vec::new(),
                        None,
                        "new objects refer to each other through required attributes",
                    )
                })?,
        };
        let (id, list) = deps.remove(pos);
        let deferred = list
            .into_iter()
            .filter(|d| !done.contains(&d.target))
            .map(|d| d.attr)
            .collect();
        done.insert(id);
        order.push((id, deferred));
    }
    Ok(order)
}

#[allow(clippy::result_large_err)]
fn insert_created(
    schema: &Schema,
    conn: &dyn Connection,
    map: &mut IdentityMap,
    result: &mut FlushResult,
) -> Result<()> {
    for (id, deferred) in insert_order(schema, map)? {
        let Some(instance) = map.get(id) else { continue };
        let info = schema.entity(&instance.entity)?;
        let mut insert = Insert::into_table(info.table());
        let mut written = Vec::new();
        for attr in info.attributes() {
            if attr.column_names().is_empty() {
                continue;
            }
            let field = instance.fields.get(attr.name());
            if attr.is_pk()
                && attr.is_auto()
                && matches!(field, None | Some(Field::Value(Value::Null)))
            {
                continue;
            }
            let values = if deferred.iter().any(|d| d == attr.name()) {
                vec![Value::Null; attr.column_names().len()]
            } else {
                column_values(map, attr, field)
                    .ok_or_else(|| unsaved_reference(info.name(), attr))?
            };
            for (column, value) in attr.column_names().iter().zip(&values) {
                insert = insert.value(column.as_str(), value.clone());
            }
            written.push((attr.name().to_string(), values));
        }

        let auto_key = instance.key.is_none();
        if auto_key {
            if let Some(column) = info.pk_columns().first() {
                insert = insert.returning(*column);
            }
        }
        let (sql, params) = insert.build_with_dialect(conn.dialect());
        debug!(sql = %sql, entity = info.name(), "Inserting");
        let rowid = conn.insert(&sql, &params)?;

        if auto_key {
            let Some(pk) = info.pk_attrs().next() else {
                continue;
            };
            let mut value = Value::BigInt(rowid);
            if let Some(sql_type) = pk.sql_type() {
                value = value.coerce(sql_type)?;
            }
            let key = ObjectKey::new(info.root(), vec![value.clone()]);
            if !map.set_key(id, key.clone()) {
                return Err(Error::constraint(
                    info.name(),
                    key.values().to_vec(),
                    None,
                    format!("the store assigned key {key}, which is already in use"),
                ));
            }
            written.push((pk.name().to_string(), vec![value.clone()]));
            if let Some(instance) = map.get_mut(id) {
                instance.fields.insert(pk.name().to_string(), Field::Value(value));
            }
        }

        let Some(instance) = map.get_mut(id) else { continue };
        for (attr, values) in written {
            instance.written(&attr, values);
        }
        instance.modified.clear();
        instance.status = Status::Inserted;
        if !deferred.is_empty() {
            trace!(attrs = ?deferred, "Deferring references to new objects");
            instance.modified.extend(deferred);
            instance.status = Status::Modified;
        }
        result.inserted += 1;
    }
    Ok(())
}

// ============================================================================
// Updates
// ============================================================================

#[allow(clippy::result_large_err)]
fn update_modified(
    schema: &Schema,
    conn: &dyn Connection,
    map: &mut IdentityMap,
    result: &mut FlushResult,
) -> Result<()> {
    for id in map.ids() {
        let Some(instance) = map.get(id) else { continue };
        if instance.status != Status::Modified {
            continue;
        }
        let Some(key) = instance.key.clone() else { continue };
        let info = schema.entity(&instance.entity)?;

        let mut update = Update::table(info.table());
        let mut written = Vec::new();
        for name in &instance.modified {
            let Some(attr) = info.attr(name).filter(|a| !a.column_names().is_empty()) else {
                continue;
            };
            let values = column_values(map, attr, instance.fields.get(name))
                .ok_or_else(|| unsaved_reference(info.name(), attr))?;
            for (column, value) in attr.column_names().iter().zip(&values) {
                update = update.set(column.as_str(), value.clone());
            }
            written.push((name.clone(), values));
        }

        if !update.is_empty() {
            if let Some(filter) = key_matches(info.pk_columns().into_iter().zip(key.values())) {
                update = update.filter(filter);
            }
            let checks = instance.optimistic_checks(|a| {
                info.attr(a)
                    .is_some_and(|x| x.is_optimistic() && !x.is_pk() && !x.column_names().is_empty())
            });
            let mut checked = Vec::with_capacity(checks.len());
            for (name, values) in &checks {
                let Some(attr) = info.attr(name) else { continue };
                for (column, value) in attr.column_names().iter().zip(values.iter()) {
                    update = update.filter(column_matches(column, value));
                }
                checked.push((*name).to_string());
            }

            let (sql, params) = update.build_with_dialect(conn.dialect());
            debug!(sql = %sql, key = %key, "Updating");
            if conn.execute(&sql, &params)? == 0 {
                return Err(Error::Conflict(ConflictError {
                    entity: instance.entity.clone(),
                    key: key.values().to_vec(),
                    attrs: checked,
                }));
            }
            result.updated += 1;
        }

        let Some(instance) = map.get_mut(id) else { continue };
        for (attr, values) in written {
            instance.written(&attr, values);
        }
        instance.modified.clear();
        instance.status = Status::Updated;
    }
    Ok(())
}

// ============================================================================
// Link tables
// ============================================================================

#[allow(clippy::result_large_err)]
fn write_links(
    schema: &Schema,
    conn: &dyn Connection,
    state: &mut State,
    result: &mut FlushResult,
) -> Result<()> {
    let changes: Vec<_> = state.links.drain(..).collect();
    let (added, removed): (Vec<_>, Vec<_>) = changes.into_iter().partition(|(_, add)| *add);

    for (change, add) in removed.into_iter().chain(added) {
        let Some(link) = schema.link_tables().iter().find(|l| l.table == change.table) else {
            continue;
        };
        let key = |id: ObjId| {
            state
                .map
                .get(id)
                .filter(|i| !matches!(i.status, Status::Cancelled | Status::Created))
                .and_then(|i| i.key.as_ref())
                .map(|k| k.values().to_vec())
        };
        let (Some(local), Some(remote)) = (key(change.local), key(change.remote)) else {
            continue;
        };
        let pairs: Vec<(&str, &Value)> = link
            .local_columns
            .iter()
            .map(String::as_str)
            .zip(&local)
            .chain(link.remote_columns.iter().map(String::as_str).zip(&remote))
            .collect();

        let (sql, params) = if add {
            let mut insert = Insert::into_table(&link.table);
            for (column, value) in &pairs {
                insert = insert.value(*column, (*value).clone());
            }
            insert.build_with_dialect(conn.dialect())
        } else {
            let mut delete = Delete::from_table(&link.table);
            if let Some(filter) = key_matches(pairs.iter().copied()) {
                delete = delete.filter(filter);
            }
            delete.build_with_dialect(conn.dialect())
        };
        debug!(sql = %sql, add, "Writing link row");
        conn.execute(&sql, &params)?;
        if add {
            result.links_added += 1;
        } else {
            result.links_removed += 1;
        }
    }
    Ok(())
}

// ============================================================================
// Deletes
// ============================================================================

/// Objects marked for deletion, referencing objects first.
fn delete_order(schema: &Schema, map: &IdentityMap) -> Vec<ObjId> {
    let mut remaining: Vec<ObjId> = map
        .iter()
        .filter(|(_, i)| i.status == Status::MarkedToDelete)
        .map(|(id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let referenced = |target: ObjId| {
            remaining.iter().any(|other| {
                *other != target
                    && map.get(*other).is_some_and(|i| {
                        i.fields.iter().any(|(name, field)| {
                            *field == Field::Ref(Some(target))
                                && schema
                                    .attribute(&i.entity, name)
                                    .is_ok_and(|a| !a.column_names().is_empty())
                        })
                    })
            })
        };
        // A reference cycle is broken at the earliest object.
        let pos = remaining.iter().position(|id| !referenced(*id)).unwrap_or(0);
        order.push(remaining.remove(pos));
    }
    order
}

#[allow(clippy::result_large_err)]
fn delete_marked(
    schema: &Schema,
    conn: &dyn Connection,
    map: &mut IdentityMap,
    result: &mut FlushResult,
) -> Result<()> {
    for id in delete_order(schema, map) {
        let Some(instance) = map.get(id) else { continue };
        let Some(key) = instance.key.clone() else { continue };
        let info = schema.entity(&instance.entity)?;

        for attr in info.attributes() {
            let Some(link) = attr.relation().and_then(|r| r.link()) else {
                continue;
            };
            let mut delete = Delete::from_table(&link.table);
            if let Some(filter) = key_matches(
                link.local_columns
                    .iter()
                    .map(String::as_str)
                    .zip(key.values()),
            ) {
                delete = delete.filter(filter);
            }
            let (sql, params) = delete.build_with_dialect(conn.dialect());
            result.links_removed += usize::try_from(conn.execute(&sql, &params)?).unwrap_or(0);
        }

        let mut delete = Delete::from_table(info.table());
        if let Some(filter) = key_matches(info.pk_columns().into_iter().zip(key.values())) {
            delete = delete.filter(filter);
        }
        let checks = instance.optimistic_checks(|a| {
            info.attr(a)
                .is_some_and(|x| x.is_optimistic() && !x.is_pk() && !x.column_names().is_empty())
        });
        let mut checked = Vec::with_capacity(checks.len());
        for (name, values) in &checks {
            let Some(attr) = info.attr(name) else { continue };
            for (column, value) in attr.column_names().iter().zip(values.iter()) {
                delete = delete.filter(column_matches(column, value));
            }
            checked.push((*name).to_string());
        }
        let (sql, params) = delete.build_with_dialect(conn.dialect());
        debug!(sql = %sql, key = %key, "Deleting");
        if conn.execute(&sql, &params)? == 0 {
            return Err(Error::Conflict(ConflictError {
                entity: instance.entity.clone(),
                key: key.values().to_vec(),
                attrs: checked,
            }));
        }
        result.deleted += 1;

        if let Some(instance) = map.get_mut(id) {
            instance.status = Status::Deleted;
            instance.modified.clear();
        }
        map.forget_key(id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_tracker::Instance;
    use corral_core::{EntityDef, SqlType};

    fn schema() -> Schema {
        Schema::builder()
            .entity(
                EntityDef::new("Person")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required("name", SqlType::Text))
                    .attr(Attribute::optional_ref("best_friend", "Person").reverse("admirers"))
                    .attr(Attribute::set("admirers", "Person").reverse("best_friend"))
                    .attr(Attribute::set("cars", "Car").reverse("owner")),
            )
            .entity(
                EntityDef::new("Car")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required_ref("owner", "Person").reverse("cars")),
            )
            .build()
            .unwrap()
    }

    fn created(map: &mut IdentityMap, entity: &str) -> ObjId {
        map.insert(Instance::created(entity, None))
    }

    #[test]
    fn test_required_references_insert_targets_first() {
        let schema = schema();
        let mut map = IdentityMap::new();
        let car = created(&mut map, "Car");
        let owner = created(&mut map, "Person");
        if let Some(i) = map.get_mut(car) {
            i.fields.insert("owner".into(), Field::Ref(Some(owner)));
        }
        let order = insert_order(&schema, &map).unwrap();
        assert_eq!(order, vec![(owner, vec![]), (car, vec![])]);
    }

    #[test]
    fn test_optional_cycle_is_back_filled() {
        let schema = schema();
        let mut map = IdentityMap::new();
        let a = created(&mut map, "Person");
        let b = created(&mut map, "Person");
        for (from, to) in [(a, b), (b, a)] {
            if let Some(i) = map.get_mut(from) {
                i.fields.insert("best_friend".into(), Field::Ref(Some(to)));
            }
        }
        let order = insert_order(&schema, &map).unwrap();
        assert_eq!(order[0], (a, vec!["best_friend".to_string()]));
        assert_eq!(order[1], (b, vec![]));
    }

    #[test]
    fn test_delete_order_children_first() {
        let schema = schema();
        let mut map = IdentityMap::new();
        let owner = map.insert(Instance::stub("Person", ObjectKey::new("Person", vec![Value::BigInt(1)])));
        let car = map.insert(Instance::stub("Car", ObjectKey::new("Car", vec![Value::BigInt(1)])));
        for id in [owner, car] {
            if let Some(i) = map.get_mut(id) {
                i.status = Status::MarkedToDelete;
            }
        }
        if let Some(i) = map.get_mut(car) {
            i.fields.insert("owner".into(), Field::Ref(Some(owner)));
        }
        assert_eq!(delete_order(&schema, &map), vec![car, owner]);
    }

    #[test]
    fn test_flush_result_total() {
        let result = FlushResult {
            inserted: 2,
            updated: 1,
            deleted: 1,
            links_added: 3,
            links_removed: 0,
        };
        assert_eq!(result.total(), 7);
    }
}
