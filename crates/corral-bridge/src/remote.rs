//! Client-side object cache.
//!
//! A [`RemoteCache`] holds the objects of one or more [`Packet`]s under its
//! own tids, so that objects arriving in different packets keep a single
//! identity. Local edits are recorded against the values last received and
//! turned into an [`UpdatePacket`] by [`RemoteCache::changes`].

use crate::describe::SchemaDescription;
use crate::packet::{
    AttrChange, Change, ENTITY_FIELD, KEY_FIELD, ObjRef, ObjectData, Packet, SaveResponse,
    UpdatePacket,
};
use corral_core::{Error, Result};
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::{debug, info};

/// Request/response channel to a server that speaks packets.
pub trait Transport {
    /// Fetch `url` with `data` as the request parameter.
    #[allow(clippy::result_large_err)]
    fn get(&self, url: &str, data: &serde_json::Value) -> Result<serde_json::Value>;

    /// Post `body` to `url`.
    #[allow(clippy::result_large_err)]
    fn post(&self, url: &str, body: &serde_json::Value) -> Result<serde_json::Value>;
}

/// [`Transport`] over blocking HTTP, posting JSON bodies.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    #[allow(clippy::result_large_err)]
    pub fn new(timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| http_error("failed to build HTTP client", e))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
fn http_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::Timeout;
    }
    Error::Connection(corral_core::error::ConnectionError {
        kind: corral_core::error::ConnectionErrorKind::Connect,
        message: format!("{context}: {err}"),
        source: Some(Box::new(err)),
    })
}

#[cfg(feature = "http")]
impl HttpTransport {
    #[allow(clippy::result_large_err)]
    fn reply(url: &str, request: reqwest::blocking::RequestBuilder) -> Result<serde_json::Value> {
        let response = request
            .send()
            .map_err(|e| http_error(&format!("request to {url} failed"), e))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| http_error("failed to read response body", e))?;
        if !status.is_success() {
            tracing::error!(%status, url, "Server rejected request");
            return Err(Error::Custom(format!("server replied {status}: {text}")));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(feature = "http")]
impl Transport for HttpTransport {
    fn get(&self, url: &str, data: &serde_json::Value) -> Result<serde_json::Value> {
        let request = self.client.get(url).query(&[("data", data.to_string())]);
        Self::reply(url, request)
    }

    fn post(&self, url: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        Self::reply(url, self.client.post(url).json(body))
    }
}

#[derive(Debug, Clone)]
struct CachedObject {
    entity: String,
    /// Null until the server assigns one
    key: serde_json::Value,
    /// Attribute values as last received
    original: ObjectData,
    /// Attribute values including local edits
    current: ObjectData,
    created: bool,
    deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct LinkEdit {
    add: bool,
    target: String,
    attr: String,
    member: String,
}

/// Objects received from a server, with local edits.
///
/// Reference values are tids of this cache: a string for a to-one
/// reference, an array of strings for a collection.
#[derive(Debug, Clone)]
pub struct RemoteCache {
    schema: SchemaDescription,
    schema_hash: Option<String>,
    objects: IndexMap<String, CachedObject>,
    index: HashMap<(String, String), String>,
    roots: Vec<String>,
    links: Vec<LinkEdit>,
    next_tid: usize,
}

impl RemoteCache {
    /// Start a cache from a packet that carries its schema.
    #[allow(clippy::result_large_err)]
    pub fn from_packet(packet: Packet) -> Result<Self> {
        let Some(schema) = packet.schema.clone() else {
            return Err(Error::malformed("the first packet must carry the schema"));
        };
        let schema_hash = packet.schema_hash.clone().or_else(|| Some(schema.hash()));
        let mut cache = Self {
            schema,
            schema_hash,
            objects: IndexMap::new(),
            index: HashMap::new(),
            roots: Vec::new(),
            links: Vec::new(),
            next_tid: 0,
        };
        cache.merge(packet)?;
        Ok(cache)
    }

    /// Request a packet from `url` and start a cache from it.
    #[allow(clippy::result_large_err)]
    pub fn load(transport: &dyn Transport, url: &str, request: &serde_json::Value) -> Result<Self> {
        let packet: Packet = serde_json::from_value(transport.get(url, request)?)?;
        Self::from_packet(packet)
    }

    /// Request another packet and merge it; returns the tids of its roots.
    #[allow(clippy::result_large_err)]
    pub fn refresh(
        &mut self,
        transport: &dyn Transport,
        url: &str,
        request: &serde_json::Value,
    ) -> Result<Vec<String>> {
        let mut request = request.clone();
        if let (Some(map), Some(hash)) = (request.as_object_mut(), &self.schema_hash) {
            map.entry("known_schema_hash")
                .or_insert_with(|| serde_json::Value::String(hash.clone()));
        }
        let packet: Packet = serde_json::from_value(transport.get(url, &request)?)?;
        self.merge(packet)
    }

    pub fn schema(&self) -> &SchemaDescription {
        &self.schema
    }

    pub fn schema_hash(&self) -> Option<&str> {
        self.schema_hash.as_deref()
    }

    /// Tids of every requested object, in arrival order.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.objects.values().filter(|o| !o.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn new_tid(&mut self) -> String {
        self.next_tid += 1;
        format!("o{}", self.next_tid)
    }

    fn identity(&self, entity: &str, key: &serde_json::Value) -> (String, String) {
        (self.schema.root_of(entity).to_string(), key.to_string())
    }

    /// Merge a packet; returns the tids of its roots.
    ///
    /// Objects already cached are matched by root entity and key. Received
    /// values replace cached ones except where the cache holds a local edit.
    #[allow(clippy::result_large_err)]
    pub fn merge(&mut self, packet: Packet) -> Result<Vec<String>> {
        if let (Some(theirs), Some(ours)) = (&packet.schema_hash, &self.schema_hash) {
            if theirs != ours {
                return Err(Error::malformed("packet was built from a different schema"));
            }
        }

        let mut mapping: HashMap<&str, String> = HashMap::with_capacity(packet.objects.len());
        for (tid, data) in &packet.objects {
            let entity = Packet::entity_of(data)
                .ok_or_else(|| Error::malformed(format!("object '{tid}' has no entity")))?;
            if !self.schema.entities.contains_key(entity) {
                return Err(Error::malformed(format!("object '{tid}' has unknown entity {entity}")));
            }
            let key = data.get(KEY_FIELD).cloned().unwrap_or(serde_json::Value::Null);
            if key.is_null() {
                return Err(Error::malformed(format!("object '{tid}' has no key")));
            }
            let identity = self.identity(entity, &key);
            let local = match self.index.get(&identity) {
                Some(local) => {
                    let cached = &mut self.objects[local.as_str()];
                    // a stub may name a base entity only
                    if self
                        .schema
                        .entities
                        .get(entity)
                        .is_some_and(|d| d.bases.contains(&cached.entity))
                    {
                        cached.entity = entity.to_string();
                    }
                    local.clone()
                }
                None => {
                    let local = self.new_tid();
                    self.objects.insert(
                        local.clone(),
                        CachedObject {
                            entity: entity.to_string(),
                            key,
                            original: ObjectData::new(),
                            current: ObjectData::new(),
                            created: false,
                            deleted: false,
                        },
                    );
                    self.index.insert(identity, local.clone());
                    local
                }
            };
            mapping.insert(tid.as_str(), local);
        }

        let translate = |tid: &serde_json::Value| -> Result<serde_json::Value> {
            let name = tid
                .as_str()
                .ok_or_else(|| Error::malformed(format!("expected a tid, found {tid}")))?;
            mapping
                .get(name)
                .map(|local| serde_json::Value::String(local.clone()))
                .ok_or_else(|| Error::malformed(format!("reference to unknown tid '{name}'")))
        };

        for (tid, data) in &packet.objects {
            let local = &mapping[tid.as_str()];
            let entity = self.objects[local.as_str()].entity.clone();
            let mut received = Vec::new();
            for (name, value) in data {
                if name == ENTITY_FIELD || name == KEY_FIELD {
                    continue;
                }
                let Some(description) = self.schema.attr(&entity, name) else {
                    return Err(Error::malformed(format!("{entity} has no attribute '{name}'")));
                };
                let value = if description.is_collection() {
                    let items = value
                        .as_array()
                        .ok_or_else(|| Error::malformed(format!("'{name}' must be a list")))?;
                    serde_json::Value::Array(items.iter().map(&translate).collect::<Result<_>>()?)
                } else if description.is_reference() && !value.is_null() {
                    translate(value)?
                } else {
                    value.clone()
                };
                received.push((name.clone(), value));
            }

            let cached = &mut self.objects[local.as_str()];
            for (name, value) in received {
                let edited = cached.current.get(&name) != cached.original.get(&name);
                if edited {
                    continue;
                }
                cached.original.insert(name.clone(), value.clone());
                cached.current.insert(name, value);
            }
        }

        let roots: Vec<String> = packet
            .data
            .iter()
            .map(|tid| {
                mapping
                    .get(tid.as_str())
                    .cloned()
                    .ok_or_else(|| Error::malformed(format!("root '{tid}' is not in the packet")))
            })
            .collect::<Result<_>>()?;
        for root in &roots {
            if !self.roots.contains(root) {
                self.roots.push(root.clone());
            }
        }
        debug!(objects = packet.objects.len(), roots = roots.len(), "Merged packet");
        Ok(roots)
    }

    /// Current attribute values of a live object.
    pub fn get(&self, tid: &str) -> Option<&ObjectData> {
        self.objects
            .get(tid)
            .filter(|o| !o.deleted)
            .map(|o| &o.current)
    }

    /// Entity name of a live object.
    pub fn entity_of(&self, tid: &str) -> Option<&str> {
        self.objects
            .get(tid)
            .filter(|o| !o.deleted)
            .map(|o| o.entity.as_str())
    }

    /// Tid of the object with `key`, searching the whole hierarchy of `entity`.
    pub fn find(&self, entity: &str, key: &serde_json::Value) -> Option<&str> {
        self.index
            .get(&self.identity(entity, key))
            .map(String::as_str)
            .filter(|tid| self.objects.get(*tid).is_some_and(|o| !o.deleted))
    }

    #[allow(clippy::result_large_err)]
    fn live(&self, tid: &str) -> Result<&CachedObject> {
        self.objects
            .get(tid)
            .filter(|o| !o.deleted)
            .ok_or_else(|| Error::malformed(format!("no object with tid '{tid}'")))
    }

    #[allow(clippy::result_large_err)]
    fn check_value(&self, entity: &str, attr: &str, value: &serde_json::Value) -> Result<()> {
        let description = self
            .schema
            .attr(entity, attr)
            .ok_or_else(|| Error::malformed(format!("{entity} has no attribute '{attr}'")))?;
        if description.is_collection() {
            return Err(Error::malformed(format!(
                "collection '{attr}' changes through add and remove"
            )));
        }
        let is_key = self
            .schema
            .entities
            .get(entity)
            .is_some_and(|e| e.key.iter().any(|k| k == attr));
        if is_key {
            return Err(Error::malformed(format!("key attribute '{attr}' is read-only")));
        }
        if description.is_reference() && !value.is_null() {
            let target = value
                .as_str()
                .ok_or_else(|| Error::malformed(format!("'{attr}' takes a tid")))?;
            let target_entity = self.live(target)?.entity.as_str();
            let wanted = description.target.as_deref().unwrap_or_default();
            let fits = target_entity == wanted
                || self
                    .schema
                    .entities
                    .get(target_entity)
                    .is_some_and(|e| e.bases.iter().any(|b| b == wanted));
            if !fits {
                return Err(Error::malformed(format!(
                    "'{attr}' expects {wanted}, got {target_entity}"
                )));
            }
        }
        Ok(())
    }

    /// Assign a scalar or to-one reference.
    #[allow(clippy::result_large_err)]
    pub fn set(&mut self, tid: &str, attr: &str, value: serde_json::Value) -> Result<()> {
        let entity = self.live(tid)?.entity.clone();
        self.check_value(&entity, attr, &value)?;
        if let Some(object) = self.objects.get_mut(tid) {
            object.current.insert(attr.to_string(), value);
        }
        Ok(())
    }

    /// Create an object; returns its tid.
    #[allow(clippy::result_large_err)]
    pub fn create(
        &mut self,
        entity: &str,
        values: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Result<String> {
        if !self.schema.entities.contains_key(entity) {
            return Err(Error::malformed(format!("unknown entity {entity}")));
        }
        let mut current = ObjectData::new();
        for (attr, value) in values {
            self.check_value(entity, &attr, &value)?;
            current.insert(attr, value);
        }
        let tid = self.new_tid();
        self.objects.insert(
            tid.clone(),
            CachedObject {
                entity: entity.to_string(),
                key: serde_json::Value::Null,
                original: ObjectData::new(),
                current,
                created: true,
                deleted: false,
            },
        );
        Ok(tid)
    }

    /// Delete an object. Deleting an object created locally forgets it.
    #[allow(clippy::result_large_err)]
    pub fn delete(&mut self, tid: &str) -> Result<()> {
        let created = self.live(tid)?.created;
        if created {
            self.objects.shift_remove(tid);
        } else if let Some(object) = self.objects.get_mut(tid) {
            object.deleted = true;
        }
        self.links.retain(|l| l.target != tid && l.member != tid);
        self.roots.retain(|r| r != tid);
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn edit_link(&mut self, add: bool, tid: &str, attr: &str, member: &str) -> Result<()> {
        let entity = self.live(tid)?.entity.clone();
        self.live(member)?;
        let is_collection = self
            .schema
            .attr(&entity, attr)
            .is_some_and(|d| d.is_collection());
        if !is_collection {
            return Err(Error::malformed(format!("{entity}.{attr} is not a collection")));
        }
        let edit = LinkEdit {
            add,
            target: tid.to_string(),
            attr: attr.to_string(),
            member: member.to_string(),
        };
        let opposite = LinkEdit {
            add: !add,
            ..edit.clone()
        };
        if let Some(pos) = self.links.iter().position(|l| *l == opposite) {
            self.links.remove(pos);
        } else if !self.links.contains(&edit) {
            self.links.push(edit);
        }

        if let Some(serde_json::Value::Array(items)) = self
            .objects
            .get_mut(tid)
            .and_then(|o| o.current.get_mut(attr))
        {
            let member = serde_json::Value::String(member.to_string());
            if add {
                if !items.contains(&member) {
                    items.push(member);
                }
            } else {
                items.retain(|m| *m != member);
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub fn add(&mut self, tid: &str, attr: &str, member: &str) -> Result<()> {
        self.edit_link(true, tid, attr, member)
    }

    #[allow(clippy::result_large_err)]
    pub fn remove(&mut self, tid: &str, attr: &str, member: &str) -> Result<()> {
        self.edit_link(false, tid, attr, member)
    }

    /// Whether any local edit is pending.
    pub fn has_changes(&self) -> bool {
        !self.changes().is_empty()
    }

    fn obj_ref(&self, tid: &str) -> ObjRef {
        match self.objects.get(tid) {
            Some(object) if !object.created => ObjRef::stored(&object.entity, object.key.clone()),
            Some(object) => ObjRef::created(&object.entity, tid),
            None => ObjRef::created("", tid),
        }
    }

    /// Wire form of a cached value: references become [`ObjRef`]s.
    fn wire_value(&self, entity: &str, attr: &str, value: &serde_json::Value) -> serde_json::Value {
        let reference = self.schema.attr(entity, attr).is_some_and(|d| d.is_reference());
        match value.as_str() {
            Some(tid) if reference => {
                serde_json::to_value(self.obj_ref(tid)).unwrap_or(serde_json::Value::Null)
            }
            _ => value.clone(),
        }
    }

    /// The local edits as an update packet.
    ///
    /// Creations come first, in creation order; a reference from a created
    /// object to one created after it is sent as an update instead. Then
    /// come updates, collection edits and deletions.
    pub fn changes(&self) -> UpdatePacket {
        let mut changes = Vec::new();
        let mut deferred: IndexMap<&str, IndexMap<String, AttrChange>> = IndexMap::new();
        let mut sent: Vec<&str> = Vec::new();

        for (tid, object) in self.objects.iter().filter(|(_, o)| o.created) {
            let mut values = IndexMap::new();
            for (attr, value) in &object.current {
                let later = value.as_str().is_some_and(|target| {
                    self.objects.get(target).is_some_and(|t| t.created)
                        && !sent.contains(&target)
                        && self.schema.attr(&object.entity, attr).is_some_and(|d| d.is_reference())
                });
                let wire = self.wire_value(&object.entity, attr, value);
                if later {
                    deferred.entry(tid.as_str()).or_default().insert(
                        attr.clone(),
                        AttrChange {
                            old: serde_json::Value::Null,
                            new: wire,
                        },
                    );
                } else {
                    values.insert(attr.clone(), wire);
                }
            }
            sent.push(tid.as_str());
            changes.push(Change::Create {
                tid: tid.clone(),
                entity: object.entity.clone(),
                values,
            });
        }

        for (tid, values) in deferred {
            changes.push(Change::Update {
                target: self.obj_ref(tid),
                values,
            });
        }

        for (tid, object) in self.objects.iter().filter(|(_, o)| !o.created && !o.deleted) {
            let mut values = IndexMap::new();
            for (attr, value) in &object.current {
                let original = object.original.get(attr).unwrap_or(&serde_json::Value::Null);
                if value == original {
                    continue;
                }
                values.insert(
                    attr.clone(),
                    AttrChange {
                        old: self.wire_value(&object.entity, attr, original),
                        new: self.wire_value(&object.entity, attr, value),
                    },
                );
            }
            if !values.is_empty() {
                changes.push(Change::Update {
                    target: self.obj_ref(tid),
                    values,
                });
            }
        }

        for link in &self.links {
            let target = self.obj_ref(&link.target);
            let member = self.obj_ref(&link.member);
            changes.push(if link.add {
                Change::Add {
                    target,
                    attr: link.attr.clone(),
                    member,
                }
            } else {
                Change::Remove {
                    target,
                    attr: link.attr.clone(),
                    member,
                }
            });
        }

        for (tid, _) in self.objects.iter().filter(|(_, o)| o.deleted) {
            changes.push(Change::Delete {
                target: self.obj_ref(tid),
            });
        }

        UpdatePacket {
            schema_hash: self.schema_hash.clone(),
            changes,
            payload: serde_json::Value::Null,
        }
    }

    /// Accept a server reply: created objects take their keys and every
    /// local edit becomes the received state.
    #[allow(clippy::result_large_err)]
    pub fn apply_response(&mut self, response: &SaveResponse) -> Result<()> {
        for (tid, key) in &response.keys {
            let identity = {
                let object = self
                    .objects
                    .get(tid)
                    .ok_or_else(|| Error::malformed(format!("no created object '{tid}'")))?;
                self.identity(&object.entity, key)
            };
            if let Some(object) = self.objects.get_mut(tid) {
                object.key = key.clone();
                object.created = false;
            }
            self.index.insert(identity, tid.clone());
        }
        if let Some(pending) = self.objects.iter().find(|(_, o)| o.created) {
            return Err(Error::malformed(format!(
                "the server assigned no key to '{}'",
                pending.0
            )));
        }

        let deleted: Vec<String> = self
            .objects
            .iter()
            .filter(|(_, o)| o.deleted)
            .map(|(tid, _)| tid.clone())
            .collect();
        for tid in deleted {
            if let Some(object) = self.objects.shift_remove(&tid) {
                let identity = self.identity(&object.entity, &object.key);
                self.index.remove(&identity);
            }
        }
        for object in self.objects.values_mut() {
            object.original.clone_from(&object.current);
        }
        self.links.clear();
        Ok(())
    }

    /// Send the local edits to `url` and accept the reply.
    #[allow(clippy::result_large_err)]
    pub fn save(&mut self, transport: &dyn Transport, url: &str) -> Result<SaveResponse> {
        let update = self.changes();
        if update.is_empty() {
            return Ok(SaveResponse::default());
        }
        let reply = transport.post(url, &serde_json::to_value(&update)?)?;
        let response: SaveResponse = serde_json::from_value(reply)?;
        self.apply_response(&response)?;
        info!(changes = update.changes.len(), created = response.keys.len(), "Saved remote changes");
        Ok(response)
    }
}
