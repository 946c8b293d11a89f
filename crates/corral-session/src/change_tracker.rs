//! Per-instance state and change tracking.
//!
//! Each instance keeps the current value of every attribute it has seen,
//! the first value observed in the store for each attribute (used to qualify
//! optimistic UPDATEs and DELETEs), the attributes read or written through a
//! handle, and the set of attributes modified since the last flush.

use crate::identity_map::{ObjId, ObjectKey};
use corral_core::Value;
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, HashSet};

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Created in this session, not yet inserted
    Created,
    /// Loaded from the store and unchanged
    Loaded,
    /// Loaded and changed since the last flush
    Modified,
    /// Inserted by a flush of this session
    Inserted,
    /// Updated by a flush of this session
    Updated,
    /// Deleted in memory, DELETE pending
    MarkedToDelete,
    /// Deleted by a flush of this session
    Deleted,
    /// Created and deleted again before it was ever inserted
    Cancelled,
}

impl Status {
    /// Whether the object is gone or about to be.
    pub fn is_deleted(self) -> bool {
        matches!(
            self,
            Status::MarkedToDelete | Status::Deleted | Status::Cancelled
        )
    }

    /// Whether the row exists in the store (as far as this session knows).
    pub fn is_persistent(self) -> bool {
        matches!(
            self,
            Status::Loaded | Status::Modified | Status::Inserted | Status::Updated
        )
    }
}

/// Current value of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Field {
    Value(Value),
    /// A to-one reference
    Ref(Option<ObjId>),
}

impl Field {
    /// Whether two fields hold the same value, comparing integers numerically.
    pub fn same(&self, other: &Field) -> bool {
        match (self, other) {
            (Field::Value(a), Field::Value(b)) => a.key_eq(b),
            (Field::Ref(a), Field::Ref(b)) => a == b,
            _ => false,
        }
    }
}

/// Loaded members of a to-many attribute.
#[derive(Debug, Clone, Default)]
pub(crate) struct Members {
    /// Whether `ids` reflects every member
    pub loaded: bool,
    pub ids: IndexSet<ObjId>,
}

/// One tracked object.
#[derive(Debug, Clone)]
pub(crate) struct Instance {
    /// Concrete entity
    pub entity: String,
    /// `None` until the store assigns an auto-increment key
    pub key: Option<ObjectKey>,
    pub status: Status,
    /// Whether the eager columns are present; stubs only know their key
    pub loaded: bool,
    pub fields: HashMap<String, Field>,
    /// First column values observed in the store, per attribute
    pub db_values: HashMap<String, Vec<Value>>,
    /// Attributes read or written through a handle
    pub read: HashSet<String>,
    pub modified: IndexSet<String>,
    pub collections: HashMap<String, Members>,
}

impl Instance {
    fn new(entity: &str, key: Option<ObjectKey>, status: Status, loaded: bool) -> Self {
        Self {
            entity: entity.to_string(),
            key,
            status,
            loaded,
            fields: HashMap::new(),
            db_values: HashMap::new(),
            read: HashSet::new(),
            modified: IndexSet::new(),
            collections: HashMap::new(),
        }
    }

    /// A new object; its collections start out loaded and empty.
    pub fn created(entity: &str, key: Option<ObjectKey>) -> Self {
        Self::new(entity, key, Status::Created, true)
    }

    /// A row known only by its key.
    pub fn stub(entity: &str, key: ObjectKey) -> Self {
        Self::new(entity, Some(key), Status::Loaded, false)
    }

    /// Record a value read from the store.
    ///
    /// The cached value wins when the attribute is already known; the store
    /// value is kept for optimistic checks only if none was seen before.
    pub fn observe(&mut self, attr: &str, field: Field, columns: Vec<Value>) {
        self.fields.entry(attr.to_string()).or_insert(field);
        self.db_values.entry(attr.to_string()).or_insert(columns);
    }

    /// Assign a new value. Returns whether the value changed.
    ///
    /// `tracked` is false for attributes without columns (the non-owning side
    /// of a one-to-one), which never produce an UPDATE.
    pub fn assign(&mut self, attr: &str, field: Field, tracked: bool) -> bool {
        if tracked {
            self.read.insert(attr.to_string());
        }
        let changed = self.fields.get(attr).is_none_or(|old| !old.same(&field));
        self.fields.insert(attr.to_string(), field);
        if changed && tracked {
            self.modified.insert(attr.to_string());
            if matches!(
                self.status,
                Status::Loaded | Status::Inserted | Status::Updated
            ) {
                self.status = Status::Modified;
            }
        }
        changed
    }

    /// Mark an attribute as read through a handle.
    pub fn mark_read(&mut self, attr: &str) {
        if self.status.is_persistent() && !self.read.contains(attr) {
            self.read.insert(attr.to_string());
        }
    }

    pub fn is_modified(&self) -> bool {
        match self.status {
            Status::Created | Status::MarkedToDelete => true,
            Status::Modified => !self.modified.is_empty(),
            _ => false,
        }
    }

    /// Record what a flush wrote for `attr`.
    pub fn written(&mut self, attr: &str, columns: Vec<Value>) {
        self.db_values.insert(attr.to_string(), columns);
    }

    /// Attributes to check against their first observed values, with those values.
    pub fn optimistic_checks<'a>(
        &'a self,
        optimistic: impl Fn(&str) -> bool,
    ) -> IndexMap<&'a str, &'a [Value]> {
        let mut names: Vec<&str> = self
            .read
            .iter()
            .map(String::as_str)
            .filter(|a| optimistic(a))
            .collect();
        names.sort_unstable();
        names
            .into_iter()
            .filter_map(|a| self.db_values.get(a).map(|v| (a, v.as_slice())))
            .collect()
    }

    pub fn members_mut(&mut self, attr: &str) -> &mut Members {
        self.collections.entry(attr.to_string()).or_default()
    }

    /// Loaded members of a collection, if the collection is loaded.
    pub fn loaded_members(&self, attr: &str) -> Option<&IndexSet<ObjId>> {
        self.collections
            .get(attr)
            .filter(|m| m.loaded)
            .map(|m| &m.ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded() -> Instance {
        let mut i = Instance::stub("Person", ObjectKey::new("Person", vec![Value::BigInt(1)]));
        i.loaded = true;
        i.observe("name", Field::Value(Value::from("Ann")), vec![Value::from("Ann")]);
        i.observe("age", Field::Value(Value::Int(30)), vec![Value::Int(30)]);
        i
    }

    #[test]
    fn test_assign_tracks_real_changes_only() {
        let mut i = loaded();
        assert!(!i.assign("age", Field::Value(Value::BigInt(30)), true));
        assert!(i.modified.is_empty());
        assert_eq!(i.status, Status::Loaded);
        assert!(!i.is_modified());

        assert!(i.assign("age", Field::Value(Value::Int(31)), true));
        assert_eq!(i.status, Status::Modified);
        assert!(i.is_modified());
        assert_eq!(i.modified.iter().collect::<Vec<_>>(), ["age"]);
    }

    #[test]
    fn test_cached_value_wins_on_reload() {
        let mut i = loaded();
        i.assign("name", Field::Value(Value::from("Bea")), true);
        i.observe("name", Field::Value(Value::from("Cid")), vec![Value::from("Cid")]);
        assert_eq!(i.fields["name"], Field::Value(Value::from("Bea")));
        assert_eq!(i.db_values["name"], vec![Value::from("Ann")]);
    }

    #[test]
    fn test_optimistic_checks_use_first_observed_values() {
        let mut i = loaded();
        i.mark_read("age");
        i.mark_read("name");
        let checks = i.optimistic_checks(|a| a == "age");
        assert_eq!(checks.len(), 1);
        assert_eq!(checks["age"], &[Value::Int(30)][..]);

        let mut fresh = Instance::created("Person", None);
        fresh.mark_read("age");
        assert!(fresh.read.is_empty());
    }

    #[test]
    fn test_untracked_assignment_does_not_modify() {
        let mut i = loaded();
        assert!(i.assign("passport", Field::Ref(Some(ObjId(7))), false));
        assert!(i.modified.is_empty());
        assert_eq!(i.status, Status::Loaded);
    }

    #[test]
    fn test_status_classes() {
        assert!(Status::Cancelled.is_deleted());
        assert!(!Status::Created.is_persistent());
        assert!(Status::Updated.is_persistent());
    }
}
