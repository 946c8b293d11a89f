//! Handles to tracked objects.

use crate::change_tracker::{Field, Status};
use crate::identity_map::ObjId;
use crate::relations::not_a;
use crate::{SessionInner, expired};
use corral_core::error::{SchemaErrorKind, SessionErrorKind};
use corral_core::{AttrKind, Attribute, Error, Result, Schema, ValidationError, ValidationErrorKind, Value};
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// A handle to one object of a session.
///
/// Handles are cheap to clone. All handles to the same row in the same
/// session compare equal. A handle stops working once its session has
/// committed or rolled back, or has been dropped.
#[derive(Clone)]
pub struct Entity {
    session: Weak<SessionInner>,
    session_id: u64,
    epoch: u64,
    id: ObjId,
}

/// A value assigned to an attribute: a plain value, a referenced object or
/// a list of objects for a collection.
#[derive(Debug, Clone)]
pub enum AttrValue {
    Value(Value),
    Object(Option<Entity>),
    Objects(Vec<Entity>),
}

/// One item of a query result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Entity(Entity),
    Value(Value),
}

impl Item {
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Item::Entity(e) => Some(e),
            Item::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Item::Value(v) => Some(v),
            Item::Entity(_) => None,
        }
    }

    pub fn into_entity(self) -> Option<Entity> {
        match self {
            Item::Entity(e) => Some(e),
            Item::Value(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Item::Value(v) => Some(v),
            Item::Entity(_) => None,
        }
    }
}

/// Which attributes [`Entity::to_json`] renders.
#[derive(Debug, Clone, Default)]
pub struct ToJsonOptions {
    /// Render exactly these attributes (hidden ones included)
    pub only: Option<Vec<String>>,
    pub exclude: Vec<String>,
    /// Render collections as arrays of member keys
    pub with_collections: bool,
    /// Load and render lazy attributes
    pub with_lazy: bool,
}

impl ToJsonOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = Some(attrs.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = attrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_collections(mut self, enabled: bool) -> Self {
        self.with_collections = enabled;
        self
    }

    pub fn with_lazy(mut self, enabled: bool) -> Self {
        self.with_lazy = enabled;
        self
    }

    fn includes(&self, attr: &Attribute) -> bool {
        if self.exclude.iter().any(|e| e == attr.name()) {
            return false;
        }
        match &self.only {
            Some(only) => only.iter().any(|o| o == attr.name()),
            None => {
                !attr.is_hidden()
                    && (!attr.is_lazy() || self.with_lazy)
                    && (!attr.is_collection() || self.with_collections)
            }
        }
    }
}

impl Entity {
    pub(crate) fn new(session: Weak<SessionInner>, session_id: u64, epoch: u64, id: ObjId) -> Self {
        Self {
            session,
            session_id,
            epoch,
            id,
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Id of the session this handle belongs to.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Instance id of this handle within `inner`.
    #[allow(clippy::result_large_err)]
    pub(crate) fn id_in(&self, inner: &SessionInner) -> Result<ObjId> {
        if self.session_id != inner.id {
            return Err(Error::session(
                SessionErrorKind::CrossSession,
                "the object belongs to a different session",
            ));
        }
        if self.epoch != inner.epoch() {
            return Err(expired());
        }
        Ok(self.id)
    }

    #[allow(clippy::result_large_err)]
    fn inner(&self) -> Result<Rc<SessionInner>> {
        let inner = self.session.upgrade().ok_or_else(expired)?;
        if inner.epoch() != self.epoch {
            return Err(expired());
        }
        Ok(inner)
    }

    /// The session, its schema, this object's entity and the named attribute.
    #[allow(clippy::result_large_err)]
    fn resolve(&self, attr: &str) -> Result<(Rc<SessionInner>, Arc<Schema>, String)> {
        let inner = self.inner()?;
        let schema = inner.schema.clone();
        let entity = inner.entity_of(self.id)?;
        schema.attribute(&entity, attr)?;
        Ok((inner, schema, entity))
    }

    /// Whether both handles refer to the same object.
    pub fn ptr_eq(&self, other: &Entity) -> bool {
        self == other
    }

    /// Concrete entity of the object.
    #[allow(clippy::result_large_err)]
    pub fn entity_name(&self) -> Result<String> {
        self.inner()?.entity_of(self.id)
    }

    /// Primary key values; `None` for a new object whose key the store
    /// has not assigned yet.
    #[allow(clippy::result_large_err)]
    pub fn key(&self) -> Result<Option<Vec<Value>>> {
        self.inner()?
            .instance(self.id, |i| i.key.as_ref().map(|k| k.values().to_vec()))
    }

    #[allow(clippy::result_large_err)]
    pub fn status(&self) -> Result<Status> {
        self.inner()?.instance(self.id, |i| i.status)
    }

    /// Whether the next flush writes anything for this object.
    #[allow(clippy::result_large_err)]
    pub fn is_modified(&self) -> Result<bool> {
        self.inner()?.instance(self.id, |i| i.is_modified())
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Value of a scalar attribute, loading the row when needed.
    #[allow(clippy::result_large_err)]
    pub fn get(&self, attr: &str) -> Result<Value> {
        let (inner, schema, entity) = self.resolve(attr)?;
        let attribute = schema.attribute(&entity, attr)?;
        if attribute.is_relation() {
            return Err(Error::schema(
                SchemaErrorKind::Relationship,
                format!("'{entity}.{attr}' is a relationship; use get_ref or members"),
            ));
        }
        inner.check_live(self.id)?;

        let cached = |inner: &SessionInner| {
            inner.instance(self.id, |i| match i.fields.get(attr) {
                Some(Field::Value(v)) => Some(v.clone()),
                _ => None,
            })
        };
        let value = match cached(&inner)? {
            Some(v) => v,
            None if attribute.is_pk() => {
                let info = schema.entity(&entity)?;
                let position = info.pk_attrs().position(|a| a.name() == attr);
                inner.instance(self.id, |i| {
                    i.key
                        .as_ref()
                        .zip(position)
                        .and_then(|(k, p)| k.values().get(p).cloned())
                        .unwrap_or(Value::Null)
                })?
            }
            None => {
                if inner.instance(self.id, |i| i.status.is_persistent())? {
                    inner.load_row(self.id, attribute.is_lazy())?;
                }
                cached(&inner)?.unwrap_or(Value::Null)
            }
        };
        inner.instance_mut(self.id, |i| i.mark_read(attr))?;
        Ok(value)
    }

    /// Value of a scalar attribute converted to `T`.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T>(&self, attr: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        T::try_from(self.get(attr)?)
    }

    /// Target of a to-one relationship.
    #[allow(clippy::result_large_err)]
    pub fn get_ref(&self, attr: &str) -> Result<Option<Entity>> {
        let (inner, schema, entity) = self.resolve(attr)?;
        let attribute = schema.attribute(&entity, attr)?;
        if !attribute.relation().is_some_and(|r| r.is_to_one()) {
            return Err(not_a("a to-one relationship", attribute));
        }
        inner.check_live(self.id)?;
        let target = inner.current_ref(self.id, attribute)?;
        inner.instance_mut(self.id, |i| i.mark_read(attr))?;
        Ok(target.map(|t| inner.handle(t)))
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Assign an attribute.
    ///
    /// Scalars are validated against their declaration; to-one references
    /// keep the other side of the relationship in step; a list assigned to a
    /// collection replaces its members.
    #[allow(clippy::result_large_err)]
    pub fn set(&self, attr: &str, value: impl Into<AttrValue>) -> Result<()> {
        let (inner, schema, entity) = self.resolve(attr)?;
        let attribute = schema.attribute(&entity, attr)?;
        inner.check_live(self.id)?;
        let value = value.into();

        let invalid = |kind: ValidationErrorKind, message: &str| {
            let mut errors = ValidationError::new(entity.as_str());
            errors.add(attr, kind, message);
            Error::Validation(errors)
        };

        match attribute.kind() {
            AttrKind::PrimaryKey | AttrKind::Discriminator => {
                Err(invalid(ValidationErrorKind::ReadOnly, "cannot be changed"))
            }
            AttrKind::Set => {
                let members = match value {
                    AttrValue::Objects(list) => list
                        .iter()
                        .map(|e| e.id_in(&inner))
                        .collect::<Result<Vec<_>>>()?,
                    AttrValue::Value(Value::Null) => Vec::new(),
                    _ => return Err(invalid(ValidationErrorKind::Type, "expects a list of objects")),
                };
                inner.replace_members(self.id, attribute, &members)
            }
            _ if attribute.is_relation() => {
                let target = match value {
                    AttrValue::Object(Some(e)) => Some(e.id_in(&inner)?),
                    AttrValue::Object(None) | AttrValue::Value(Value::Null) => None,
                    _ => return Err(invalid(ValidationErrorKind::Type, "expects an object")),
                };
                inner.set_ref(self.id, attribute, target)
            }
            _ => {
                let AttrValue::Value(value) = value else {
                    return Err(invalid(ValidationErrorKind::Type, "expects a value, not an object"));
                };
                let value = corral_core::validate::check_value(&entity, attribute, value)?;
                let stale = inner.instance(self.id, |i| i.status.is_persistent() && !i.loaded)?;
                if stale && !attribute.is_lazy() {
                    inner.load_row(self.id, false)?;
                }
                let tracked = !attribute.column_names().is_empty();
                inner.instance_mut(self.id, |i| {
                    i.assign(attr, Field::Value(value), tracked);
                })
            }
        }
    }

    /// Change a scalar attribute in place. Returns whether it changed.
    #[allow(clippy::result_large_err)]
    pub fn modify(&self, attr: &str, f: impl FnOnce(&mut Value)) -> Result<bool> {
        let old = self.get(attr)?;
        let mut new = old.clone();
        f(&mut new);
        if new.key_eq(&old) {
            return Ok(false);
        }
        self.set(attr, new)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    #[allow(clippy::result_large_err)]
    fn collection(&self, attr: &str) -> Result<(Rc<SessionInner>, Arc<Schema>, String)> {
        let (inner, schema, entity) = self.resolve(attr)?;
        let attribute = schema.attribute(&entity, attr)?;
        if !attribute.is_collection() {
            return Err(not_a("a collection", attribute));
        }
        inner.check_live(self.id)?;
        Ok((inner, schema, entity))
    }

    /// Members of a collection, loading them when needed.
    #[allow(clippy::result_large_err)]
    pub fn members(&self, attr: &str) -> Result<Vec<Entity>> {
        let (inner, schema, entity) = self.collection(attr)?;
        let ids = inner.members(self.id, schema.attribute(&entity, attr)?)?;
        Ok(ids.into_iter().map(|id| inner.handle(id)).collect())
    }

    /// Number of members, counted in the store unless they are loaded.
    #[allow(clippy::result_large_err)]
    pub fn count_members(&self, attr: &str) -> Result<usize> {
        let (inner, schema, entity) = self.collection(attr)?;
        inner.count_members(self.id, schema.attribute(&entity, attr)?)
    }

    #[allow(clippy::result_large_err)]
    pub fn has_member(&self, attr: &str, member: &Entity) -> Result<bool> {
        let (inner, schema, entity) = self.collection(attr)?;
        let member = member.id_in(&inner)?;
        Ok(inner
            .members(self.id, schema.attribute(&entity, attr)?)?
            .contains(&member))
    }

    #[allow(clippy::result_large_err)]
    pub fn add(&self, attr: &str, member: &Entity) -> Result<()> {
        let (inner, schema, entity) = self.collection(attr)?;
        let member = member.id_in(&inner)?;
        inner.add_member(self.id, schema.attribute(&entity, attr)?, member)
    }

    #[allow(clippy::result_large_err)]
    pub fn remove(&self, attr: &str, member: &Entity) -> Result<()> {
        let (inner, schema, entity) = self.collection(attr)?;
        let member = member.id_in(&inner)?;
        inner.remove_member(self.id, schema.attribute(&entity, attr)?, member)
    }

    /// Remove every member of a collection.
    #[allow(clippy::result_large_err)]
    pub fn clear(&self, attr: &str) -> Result<()> {
        let (inner, schema, entity) = self.collection(attr)?;
        inner.replace_members(self.id, schema.attribute(&entity, attr)?, &[])
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Delete the object, applying cascade rules to its dependents.
    #[allow(clippy::result_large_err)]
    pub fn delete(&self) -> Result<()> {
        self.inner()?.delete(self.id)
    }

    /// Load every column of the object, lazy ones included.
    ///
    /// Values already known to the session are kept.
    #[allow(clippy::result_large_err)]
    pub fn load(&self) -> Result<()> {
        let inner = self.inner()?;
        inner.check_live(self.id)?;
        if inner.instance(self.id, |i| i.status.is_persistent())? {
            inner.load_row(self.id, true)?;
        }
        Ok(())
    }

    /// Render the object as a JSON object keyed by attribute name.
    ///
    /// References render as the key of their target, collections as arrays
    /// of member keys.
    #[allow(clippy::result_large_err)]
    pub fn to_json(&self, options: &ToJsonOptions) -> Result<serde_json::Value> {
        let inner = self.inner()?;
        let schema = inner.schema.clone();
        let entity = inner.entity_of(self.id)?;
        let info = schema.entity(&entity)?;
        for name in options.only.iter().flatten().chain(&options.exclude) {
            if info.attr(name).is_none() {
                return Err(Error::malformed(format!("{entity} has no attribute '{name}'")));
            }
        }

        let key_json = |e: &Entity| -> Result<serde_json::Value> {
            let key = e.key()?.unwrap_or_default();
            Ok(match key.as_slice() {
                [] => serde_json::Value::Null,
                [single] => single.to_json(),
                many => serde_json::Value::Array(many.iter().map(Value::to_json).collect()),
            })
        };

        let mut object = serde_json::Map::new();
        for attr in info.attributes() {
            if !options.includes(attr) {
                continue;
            }
            let json = if attr.is_collection() {
                let members = self.members(attr.name())?;
                serde_json::Value::Array(members.iter().map(key_json).collect::<Result<_>>()?)
            } else if attr.is_relation() {
                match self.get_ref(attr.name())? {
                    Some(target) => key_json(&target)?,
                    None => serde_json::Value::Null,
                }
            } else {
                self.get(attr.name())?.to_json()
            };
            object.insert(attr.name().to_string(), json);
        }
        Ok(serde_json::Value::Object(object))
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id && self.epoch == other.epoch && self.id == other.id
    }
}

impl Eq for Entity {}

impl std::hash::Hash for Entity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.session_id.hash(state);
        self.epoch.hash(state);
        self.id.hash(state);
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let described = self.session.upgrade().and_then(|inner| {
            if inner.epoch() != self.epoch {
                return None;
            }
            let state = inner.state.try_borrow().ok()?;
            state.map.get(self.id).map(|i| match &i.key {
                Some(key) => key.to_string(),
                None => format!("{}[new]", i.entity),
            })
        });
        match described {
            Some(text) => write!(f, "Entity({text})"),
            None => write!(f, "Entity(expired #{})", self.id.0),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<Value> for AttrValue {
    fn from(value: Value) -> Self {
        AttrValue::Value(value)
    }
}

impl From<Entity> for AttrValue {
    fn from(entity: Entity) -> Self {
        AttrValue::Object(Some(entity))
    }
}

impl From<&Entity> for AttrValue {
    fn from(entity: &Entity) -> Self {
        AttrValue::Object(Some(entity.clone()))
    }
}

impl From<Option<Entity>> for AttrValue {
    fn from(entity: Option<Entity>) -> Self {
        AttrValue::Object(entity)
    }
}

impl From<Option<&Entity>> for AttrValue {
    fn from(entity: Option<&Entity>) -> Self {
        AttrValue::Object(entity.cloned())
    }
}

impl From<Vec<Entity>> for AttrValue {
    fn from(entities: Vec<Entity>) -> Self {
        AttrValue::Objects(entities)
    }
}

impl From<&[Entity]> for AttrValue {
    fn from(entities: &[Entity]) -> Self {
        AttrValue::Objects(entities.to_vec())
    }
}

macro_rules! attr_value_from {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for AttrValue {
                fn from(value: $t) -> Self {
                    AttrValue::Value(Value::from(value))
                }
            }
        )*
    };
}

attr_value_from!(bool, i32, i64, f64, &str, String, serde_json::Value);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_value_conversions() {
        assert!(matches!(AttrValue::from(5), AttrValue::Value(Value::Int(5))));
        assert!(matches!(AttrValue::from("Ann"), AttrValue::Value(Value::Text(ref s)) if s == "Ann"));
        assert!(matches!(AttrValue::from(None::<Entity>), AttrValue::Object(None)));
        assert!(matches!(AttrValue::from(Vec::<Entity>::new()), AttrValue::Objects(ref v) if v.is_empty()));
    }

    #[test]
    fn test_item_accessors() {
        let item = Item::Value(Value::BigInt(3));
        assert_eq!(item.as_value(), Some(&Value::BigInt(3)));
        assert!(item.as_entity().is_none());
        assert_eq!(item.into_value(), Some(Value::BigInt(3)));
    }

    #[test]
    fn test_to_json_options_selection() {
        let plain = Attribute::optional("nick", corral_core::SqlType::Text);
        let hidden = Attribute::optional("secret", corral_core::SqlType::Text).hidden();

        let defaults = ToJsonOptions::new();
        assert!(defaults.includes(&plain));
        assert!(!defaults.includes(&hidden));

        let only = ToJsonOptions::new().only(["secret"]);
        assert!(only.includes(&hidden));
        assert!(!only.includes(&plain));

        let exclude = ToJsonOptions::new().exclude(["nick"]);
        assert!(!exclude.includes(&plain));
    }

    #[test]
    fn test_detached_handle_is_expired() {
        let handle = Entity::new(Weak::new(), 1, 0, ObjId(1));
        let err = handle.status().unwrap_err();
        assert!(matches!(
            err,
            Error::Session(ref e) if e.kind == SessionErrorKind::Expired
        ));
        assert_eq!(format!("{handle:?}"), "Entity(expired #1)");
    }
}
