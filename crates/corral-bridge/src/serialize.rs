//! Session objects to [`Packet`]s.

use crate::describe::describe;
use crate::packet::{ENTITY_FIELD, KEY_FIELD, ObjectData, Packet};
use crate::permission::{Permission, PermissionContext, attr_allowed, require};
use crate::{AttrNames, key_json};
use corral_core::{AttrKind, Error, Result, Schema};
use corral_session::{Entity, Session};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// What [`serialize`] puts into a packet.
#[derive(Debug, Clone, Default)]
pub struct SerializeOptions {
    /// `Entity.attr` names to add to the defaults; their targets are
    /// serialized in full
    pub include: Vec<String>,
    /// `Entity.attr` names to leave out
    pub exclude: Vec<String>,
    /// Schema hash the receiver already holds
    pub known_schema_hash: Option<String>,
}

impl SerializeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn known_schema_hash(mut self, hash: impl Into<String>) -> Self {
        self.known_schema_hash = Some(hash.into());
        self
    }
}

struct Serializer<'a> {
    schema: &'a Schema,
    context: Option<&'a PermissionContext>,
    include: AttrNames,
    exclude: AttrNames,
    tids: HashMap<Entity, String>,
    objects: IndexMap<String, ObjectData>,
    complete: HashSet<Entity>,
    queue: VecDeque<Entity>,
}

impl Serializer<'_> {
    /// Tid of `object`, adding a stub entry on first sight.
    #[allow(clippy::result_large_err)]
    fn tid(&mut self, object: &Entity) -> Result<String> {
        if let Some(tid) = self.tids.get(object) {
            return Ok(tid.clone());
        }
        require(self.context, self.schema, object, Permission::View)?;
        let tid = format!("t{}", self.tids.len() + 1);
        let mut stub = ObjectData::new();
        stub.insert(ENTITY_FIELD.into(), object.entity_name()?.into());
        stub.insert(KEY_FIELD.into(), key_json(&object.key()?.unwrap_or_default()));
        self.objects.insert(tid.clone(), stub);
        self.tids.insert(object.clone(), tid.clone());
        Ok(tid)
    }

    /// Tid of a reached object, queueing it for its attributes when `full`.
    #[allow(clippy::result_large_err)]
    fn reach(&mut self, object: Entity, full: bool) -> Result<String> {
        let tid = self.tid(&object)?;
        if full {
            self.queue.push_back(object);
        }
        Ok(tid)
    }

    #[allow(clippy::result_large_err)]
    fn fill(&mut self, object: &Entity) -> Result<()> {
        let tid = self.tid(object)?;
        let entity = object.entity_name()?;
        let info = self.schema.entity(&entity)?;
        let mut attrs = Vec::new();

        for attr in info.attributes() {
            if attr.is_pk() || attr.kind() == AttrKind::Discriminator {
                continue;
            }
            let explicit = self.include.names(self.schema, &entity, attr.name());
            if self.exclude.names(self.schema, &entity, attr.name()) {
                continue;
            }
            if !explicit && (attr.is_collection() || attr.is_lazy()) {
                continue;
            }
            if !attr_allowed(self.context, self.schema, object, attr, Permission::View)? {
                if explicit {
                    return Err(Error::permission(&entity, Some(attr.name()), "view"));
                }
                continue;
            }

            let json = if attr.is_collection() {
                let mut tids: Vec<serde_json::Value> = Vec::new();
                for member in object.members(attr.name())? {
                    tids.push(self.reach(member, explicit)?.into());
                }
                serde_json::Value::Array(tids)
            } else if attr.is_relation() {
                match object.get_ref(attr.name())? {
                    Some(target) => self.reach(target, explicit)?.into(),
                    None => serde_json::Value::Null,
                }
            } else {
                object.get(attr.name())?.to_json()
            };
            attrs.push((attr.name().to_string(), json));
        }

        if let Some(data) = self.objects.get_mut(&tid) {
            data.extend(attrs);
        }
        Ok(())
    }
}

/// Serialize `roots` and everything they reach into a packet.
///
/// Pending changes are flushed first so that new objects carry their keys.
#[allow(clippy::result_large_err)]
#[tracing::instrument(level = "debug", skip_all, fields(roots = roots.len()))]
pub fn serialize(
    session: &Session,
    roots: &[Entity],
    options: &SerializeOptions,
    context: Option<&PermissionContext>,
) -> Result<Packet> {
    let schema = session.schema();
    let include = AttrNames::parse(schema, &options.include)?;
    let exclude = AttrNames::parse(schema, &options.exclude)?;
    if session.has_changes() {
        session.flush()?;
    }

    let mut serializer = Serializer {
        schema,
        context,
        include,
        exclude,
        tids: HashMap::new(),
        objects: IndexMap::new(),
        complete: HashSet::new(),
        queue: VecDeque::new(),
    };

    let mut data = Vec::with_capacity(roots.len());
    for root in roots {
        if !session.owns(root) {
            return Err(Error::session(
                corral_core::error::SessionErrorKind::CrossSession,
                "serialized objects must belong to the serializing session",
            ));
        }
        data.push(serializer.reach(root.clone(), true)?);
    }
    while let Some(object) = serializer.queue.pop_front() {
        if serializer.complete.insert(object.clone()) {
            serializer.fill(&object)?;
        }
    }

    let description = describe(schema);
    let hash = description.hash();
    let (schema, schema_hash) = if options.known_schema_hash.as_deref() == Some(hash.as_str()) {
        (None, None)
    } else {
        (Some(description), Some(hash))
    };
    debug!(objects = serializer.objects.len(), "Serialized packet");
    Ok(Packet {
        data,
        objects: serializer.objects,
        schema,
        schema_hash,
    })
}
