//! Identity map: one in-memory instance per stored row.
//!
//! Every instance a session knows about lives in the map under a stable
//! [`ObjId`]. Instances whose primary key is known are also indexed by
//! [`ObjectKey`], so that loading the same row twice resolves to the same
//! instance. Objects with a store-assigned key join the index once the key
//! is known.
//!
//! References between instances hold `ObjId`s rather than keys, which keeps
//! them valid across re-keying.

use crate::change_tracker::Instance;
use corral_core::Value;
use corral_core::error::format_key;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Session-local identity of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(pub(crate) u64);

/// Primary key of a stored row: the hierarchy root plus the key values.
///
/// Integer variants compare numerically, so `Int(5)` and `BigInt(5)` name
/// the same row.
#[derive(Debug, Clone)]
pub struct ObjectKey {
    entity: String,
    values: Vec<Value>,
}

impl ObjectKey {
    /// Create a key. `root` must be the root entity of the hierarchy.
    pub fn new(root: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            entity: root.into(),
            values,
        }
    }

    /// Root entity of the hierarchy the row belongs to.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl PartialEq for ObjectKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.key_eq(b))
    }
}

impl Eq for ObjectKey {}

impl Hash for ObjectKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.values.len().hash(state);
        for value in &self.values {
            value.hash_key(state);
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.entity, format_key(&self.values))
    }
}

/// All instances of a session, in the order they entered it.
#[derive(Debug, Clone, Default)]
pub(crate) struct IdentityMap {
    objects: IndexMap<ObjId, Instance>,
    keys: HashMap<ObjectKey, ObjId>,
    next: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance, indexing it by its key when it has one.
    ///
    /// The caller checks that the key is not taken.
    pub fn insert(&mut self, instance: Instance) -> ObjId {
        self.next += 1;
        let id = ObjId(self.next);
        if let Some(key) = &instance.key {
            self.keys.insert(key.clone(), id);
        }
        self.objects.insert(id, instance);
        tracing::trace!(id = id.0, entity = %self.objects[&id].entity, "Added instance to identity map");
        id
    }

    pub fn get(&self, id: ObjId) -> Option<&Instance> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut Instance> {
        self.objects.get_mut(&id)
    }

    /// Instance currently registered under `key`.
    pub fn lookup(&self, key: &ObjectKey) -> Option<ObjId> {
        self.keys.get(key).copied()
    }

    /// Register the key of an instance. Returns false when another instance
    /// already holds it.
    pub fn set_key(&mut self, id: ObjId, key: ObjectKey) -> bool {
        if let Some(&holder) = self.keys.get(&key) {
            if holder != id {
                return false;
            }
        }
        self.keys.insert(key.clone(), id);
        if let Some(instance) = self.objects.get_mut(&id) {
            instance.key = Some(key);
        }
        true
    }

    /// Drop the key index entry of an instance; the instance itself stays so
    /// that handles can still report its status.
    pub fn forget_key(&mut self, id: ObjId) {
        let key = self.objects.get(&id).and_then(|i| i.key.clone());
        if let Some(key) = key {
            if self.keys.get(&key) == Some(&id) {
                self.keys.remove(&key);
            }
        }
    }

    /// Ids in the order instances entered the map.
    pub fn ids(&self) -> Vec<ObjId> {
        self.objects.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjId, &Instance)> {
        self.objects.iter().map(|(id, i)| (*id, i))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.keys.clear();
    }

    /// Go back to an earlier copy of the map. Ids handed out since the copy
    /// was taken are never reused.
    pub fn restore(&mut self, earlier: IdentityMap) {
        let next = self.next;
        *self = earlier;
        self.next = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_integer_widths_are_the_same_key() {
        let a = ObjectKey::new("Person", vec![Value::Int(5)]);
        let b = ObjectKey::new("Person", vec![Value::BigInt(5)]);
        assert_eq!(a, b);
        let set: HashSet<ObjectKey> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_keys_differ_by_entity_and_value() {
        let a = ObjectKey::new("Person", vec![Value::Int(5)]);
        assert_ne!(a, ObjectKey::new("Car", vec![Value::Int(5)]));
        assert_ne!(a, ObjectKey::new("Person", vec![Value::Text("5".into())]));
        let composite = ObjectKey::new("Mark", vec![Value::Int(1), Value::from("a")]);
        assert_eq!(composite.to_string(), "Mark[(1, 'a')]");
        assert_eq!(a.to_string(), "Person[5]");
    }

    #[test]
    fn test_insert_lookup_and_rekey() {
        let mut map = IdentityMap::new();
        let key = ObjectKey::new("Person", vec![Value::BigInt(1)]);
        let first = map.insert(Instance::stub("Person", key.clone()));
        assert_eq!(map.lookup(&key), Some(first));

        let unsaved = map.insert(Instance::created("Person", None));
        let assigned = ObjectKey::new("Person", vec![Value::BigInt(2)]);
        assert!(map.set_key(unsaved, assigned.clone()));
        assert_eq!(map.lookup(&assigned), Some(unsaved));
        assert!(!map.set_key(unsaved, key.clone()));

        map.forget_key(first);
        assert_eq!(map.lookup(&key), None);
        assert!(map.get(first).is_some());
        assert_eq!(map.ids(), vec![first, unsaved]);
        map.clear();
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_restore_does_not_reuse_ids() {
        let mut map = IdentityMap::new();
        let key = ObjectKey::new("Person", vec![Value::BigInt(1)]);
        let kept = map.insert(Instance::stub("Person", key.clone()));
        let earlier = map.clone();

        let dropped = map.insert(Instance::created("Person", None));
        map.restore(earlier);
        assert_eq!(map.ids(), vec![kept]);
        assert!(map.get(dropped).is_none());
        assert_eq!(map.lookup(&key), Some(kept));

        let next = map.insert(Instance::created("Person", None));
        assert_ne!(next, dropped);
    }
}
