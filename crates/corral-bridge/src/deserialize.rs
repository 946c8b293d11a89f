//! Applying [`UpdatePacket`]s to a session.

use crate::describe::describe;
use crate::key_json;
use crate::packet::{Change, ObjRef, SaveResponse, UpdatePacket};
use crate::permission::{Permission, PermissionContext, attr_allowed, require};
use corral_core::error::ConflictError;
use corral_core::{Attribute, Error, Result, Schema, Value};
use corral_session::{AttrValue, Entity, Session};
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::debug;

/// One applied change, as reported to the observer.
///
/// An update reports one mutation per changed attribute.
#[derive(Debug, Clone)]
pub enum Mutation {
    Create {
        object: Entity,
        values: IndexMap<String, serde_json::Value>,
    },
    Update {
        object: Entity,
        attr: String,
        old: serde_json::Value,
        new: serde_json::Value,
    },
    Delete {
        object: Entity,
    },
    Add {
        object: Entity,
        attr: String,
        member: Entity,
    },
    Remove {
        object: Entity,
        attr: String,
        member: Entity,
    },
}

impl Mutation {
    pub fn action(&self) -> &'static str {
        match self {
            Mutation::Create { .. } => "create",
            Mutation::Update { .. } => "update",
            Mutation::Delete { .. } => "delete",
            Mutation::Add { .. } => "add",
            Mutation::Remove { .. } => "remove",
        }
    }

    pub fn object(&self) -> &Entity {
        match self {
            Mutation::Create { object, .. }
            | Mutation::Update { object, .. }
            | Mutation::Delete { object }
            | Mutation::Add { object, .. }
            | Mutation::Remove { object, .. } => object,
        }
    }
}

/// Outcome of [`deserialize`].
#[derive(Debug)]
pub struct Applied {
    pub mutations: Vec<Mutation>,
    /// Keys of created objects, by tid
    pub keys: IndexMap<String, serde_json::Value>,
    pub payload: serde_json::Value,
}

impl Applied {
    /// Reply to send back to the client.
    pub fn response(&self) -> SaveResponse {
        SaveResponse {
            keys: self.keys.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Key values of `entity` from their wire form.
#[allow(clippy::result_large_err)]
pub(crate) fn key_values(schema: &Schema, entity: &str, json: &serde_json::Value) -> Result<Vec<Value>> {
    let root = schema.root_of(entity)?;
    let types: Vec<_> = root
        .pk_attrs()
        .flat_map(|a| a.column_types().iter())
        .collect();
    let parts: Vec<&serde_json::Value> = match (json, types.len()) {
        (serde_json::Value::Array(items), n) if n > 1 => items.iter().collect(),
        (single, 1) => vec![single],
        _ => Vec::new(),
    };
    if parts.len() != types.len() || parts.iter().any(|p| p.is_null()) {
        return Err(Error::malformed(format!("invalid {entity} key {json}")));
    }
    parts
        .into_iter()
        .zip(types)
        .map(|(p, t)| Value::from_json(p, t))
        .collect()
}

struct Applier<'a> {
    session: &'a Session,
    context: Option<&'a PermissionContext>,
    created: HashMap<String, Entity>,
}

impl Applier<'_> {
    fn schema(&self) -> &Schema {
        self.session.schema()
    }

    #[allow(clippy::result_large_err)]
    fn resolve(&self, target: &ObjRef) -> Result<Entity> {
        if !target.key.is_null() {
            let key = key_values(self.schema(), &target.entity, &target.key)?;
            return self.session.get(&target.entity, key);
        }
        target
            .tid
            .as_ref()
            .and_then(|tid| self.created.get(tid))
            .cloned()
            .ok_or_else(|| {
                Error::malformed(format!(
                    "reference to {} names neither a key nor a created object",
                    target.entity
                ))
            })
    }

    #[allow(clippy::result_large_err)]
    fn resolve_json(&self, json: &serde_json::Value) -> Result<Entity> {
        let target: ObjRef = serde_json::from_value(json.clone())?;
        self.resolve(&target)
    }

    /// Wire value of `attr` as an assignable value.
    #[allow(clippy::result_large_err)]
    fn attr_value(&self, attr: &Attribute, json: &serde_json::Value) -> Result<AttrValue> {
        if attr.is_collection() {
            let serde_json::Value::Array(items) = json else {
                return Err(Error::malformed(format!("'{}' expects a list of objects", attr.name())));
            };
            let members = items
                .iter()
                .map(|item| self.resolve_json(item))
                .collect::<Result<Vec<_>>>()?;
            Ok(AttrValue::Objects(members))
        } else if attr.is_relation() {
            if json.is_null() {
                Ok(AttrValue::Object(None))
            } else {
                Ok(AttrValue::Object(Some(self.resolve_json(json)?)))
            }
        } else {
            match attr.sql_type() {
                Some(sql_type) => Ok(AttrValue::Value(Value::from_json(json, sql_type)?)),
                None => Ok(AttrValue::Value(Value::Json(json.clone()))),
            }
        }
    }

    /// Whether the stored value of `attr` still matches what the client saw.
    #[allow(clippy::result_large_err)]
    fn unchanged(&self, object: &Entity, attr: &Attribute, old: &serde_json::Value) -> Result<bool> {
        if attr.is_relation() {
            let current = object.get_ref(attr.name())?;
            return match (current, old.is_null()) {
                (None, true) => Ok(true),
                (None, false) | (Some(_), true) => Ok(false),
                (Some(target), false) => {
                    let old: ObjRef = serde_json::from_value(old.clone())?;
                    let entity = target.entity_name()?;
                    let seen = key_values(self.schema(), &entity, &old.key)?;
                    let stored = target.key()?.unwrap_or_default();
                    Ok(seen.len() == stored.len()
                        && seen.iter().zip(&stored).all(|(a, b)| a.key_eq(b)))
                }
            };
        }
        let current = object.get(attr.name())?;
        let seen = match attr.sql_type() {
            Some(sql_type) => Value::from_json(old, sql_type)?,
            None => Value::Json(old.clone()),
        };
        Ok(current.key_eq(&seen))
    }

    #[allow(clippy::result_large_err)]
    fn attribute<'s>(&self, schema: &'s Schema, object: &Entity, name: &str) -> Result<&'s Attribute> {
        let entity = object.entity_name()?;
        schema
            .attribute(&entity, name)
            .map_err(|_| Error::malformed(format!("{entity} has no attribute '{name}'")))
    }

    #[allow(clippy::result_large_err)]
    fn check_attr(&self, object: &Entity, attr: &Attribute, permission: Permission) -> Result<()> {
        if attr_allowed(self.context, self.schema(), object, attr, permission)? {
            Ok(())
        } else {
            Err(Error::permission(
                object.entity_name()?,
                Some(attr.name()),
                permission.as_str(),
            ))
        }
    }

    #[allow(clippy::result_large_err)]
    fn apply(
        &mut self,
        change: &Change,
        observer: &mut dyn FnMut(&Mutation) -> Result<()>,
        out: &mut Vec<Mutation>,
    ) -> Result<()> {
        let schema = self.session.schema();
        match change {
            Change::Create { tid, entity, values } => {
                if self.created.contains_key(tid) {
                    return Err(Error::malformed(format!("tid '{tid}' is created twice")));
                }
                let info = schema.entity(entity)?;
                let mut assigned = Vec::with_capacity(values.len());
                for (name, json) in values {
                    let attr = info
                        .attr(name)
                        .ok_or_else(|| Error::malformed(format!("{entity} has no attribute '{name}'")))?;
                    assigned.push((name.as_str(), self.attr_value(attr, json)?));
                }
                let object = self.session.create(entity, assigned)?;
                require(self.context, schema, &object, Permission::Create)?;
                for name in values.keys() {
                    let attr = self.attribute(schema, &object, name)?;
                    self.check_attr(&object, attr, Permission::Create)?;
                }
                let mutation = Mutation::Create {
                    object: object.clone(),
                    values: values.clone(),
                };
                observer(&mutation)?;
                out.push(mutation);
                self.created.insert(tid.clone(), object);
            }
            Change::Update { target, values } => {
                let object = self.resolve(target)?;
                require(self.context, schema, &object, Permission::Edit)?;
                for (name, change) in values {
                    let attr = self.attribute(schema, &object, name)?;
                    if attr.is_collection() {
                        return Err(Error::malformed(format!(
                            "collection '{name}' changes through add and remove"
                        )));
                    }
                    self.check_attr(&object, attr, Permission::Edit)?;
                    if !self.unchanged(&object, attr, &change.old)? {
                        return Err(Error::Conflict(ConflictError {
                            entity: object.entity_name()?,
                            key: object.key()?.unwrap_or_default(),
                            attrs: vec![name.clone()],
                        }));
                    }
                    let mutation = Mutation::Update {
                        object: object.clone(),
                        attr: name.clone(),
                        old: change.old.clone(),
                        new: change.new.clone(),
                    };
                    observer(&mutation)?;
                    object.set(name, self.attr_value(attr, &change.new)?)?;
                    out.push(mutation);
                }
            }
            Change::Delete { target } => {
                let object = self.resolve(target)?;
                require(self.context, schema, &object, Permission::Delete)?;
                let mutation = Mutation::Delete {
                    object: object.clone(),
                };
                observer(&mutation)?;
                object.delete()?;
                out.push(mutation);
            }
            Change::Add { target, attr, member } | Change::Remove { target, attr, member } => {
                let object = self.resolve(target)?;
                let member = self.resolve(member)?;
                let attribute = self.attribute(schema, &object, attr)?;
                if !attribute.is_collection() {
                    return Err(Error::malformed(format!("'{attr}' is not a collection")));
                }
                require(self.context, schema, &object, Permission::Edit)?;
                self.check_attr(&object, attribute, Permission::Edit)?;
                let add = matches!(change, Change::Add { .. });
                let mutation = if add {
                    Mutation::Add {
                        object: object.clone(),
                        attr: attr.clone(),
                        member: member.clone(),
                    }
                } else {
                    Mutation::Remove {
                        object: object.clone(),
                        attr: attr.clone(),
                        member: member.clone(),
                    }
                };
                observer(&mutation)?;
                if add {
                    object.add(attr, &member)?;
                } else {
                    object.remove(attr, &member)?;
                }
                out.push(mutation);
            }
        }
        Ok(())
    }
}

/// Replay the changes of `packet` in `session`.
///
/// The observer sees each mutation before it is applied, except creations,
/// which it sees right after. Stored values are checked against the `old`
/// values of updates. The session is flushed at the end so created objects
/// have keys; committing is left to the caller.
///
/// The packet applies as a whole: when a change is refused, conflicts or
/// fails in the observer, the session is left as it was before the call.
#[allow(clippy::result_large_err)]
#[tracing::instrument(level = "debug", skip_all, fields(changes = packet.changes.len()))]
pub fn deserialize(
    session: &Session,
    packet: &UpdatePacket,
    context: Option<&PermissionContext>,
    mut observer: impl FnMut(&Mutation) -> Result<()>,
) -> Result<Applied> {
    if let Some(hash) = &packet.schema_hash {
        if *hash != describe(session.schema()).hash() {
            return Err(Error::malformed(
                "the update was built against a different schema",
            ));
        }
    }

    let (mutations, created) = session.savepoint(|session| {
        let mut applier = Applier {
            session,
            context,
            created: HashMap::new(),
        };
        let mut mutations = Vec::with_capacity(packet.changes.len());
        for change in &packet.changes {
            applier.apply(change, &mut observer, &mut mutations)?;
        }
        session.flush()?;
        Ok((mutations, applier.created))
    })?;

    let mut keys = IndexMap::new();
    for change in &packet.changes {
        if let Change::Create { tid, .. } = change {
            if let Some(object) = created.get(tid) {
                keys.insert(tid.clone(), key_json(&object.key()?.unwrap_or_default()));
            }
        }
    }
    debug!(mutations = mutations.len(), created = keys.len(), "Applied update packet");
    Ok(Applied {
        mutations,
        keys,
        payload: packet.payload.clone(),
    })
}
