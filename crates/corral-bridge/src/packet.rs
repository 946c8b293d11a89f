//! Wire formats.
//!
//! A [`Packet`] carries objects from the server to a client:
//!
//! ```json
//! {
//!   "data": ["t1"],
//!   "objects": {
//!     "t1": {"_t": "Person", "_pk": 1, "name": "Ann", "cars": ["t2"]},
//!     "t2": {"_t": "Car", "_pk": 7}
//!   },
//!   "schema": {"entities": {}},
//!   "schema_hash": "9f2c..."
//! }
//! ```
//!
//! Transient ids (`tid`) are local to one packet. References between
//! objects use tids; an object reached only through a reference is a stub
//! holding `_t` and `_pk`.
//!
//! An [`UpdatePacket`] carries changes back.

use crate::describe::SchemaDescription;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Attribute map of one serialized object, including `_t` and `_pk`.
pub type ObjectData = serde_json::Map<String, serde_json::Value>;

pub const ENTITY_FIELD: &str = "_t";
pub const KEY_FIELD: &str = "_pk";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Tids of the requested objects, in request order
    pub data: Vec<String>,
    pub objects: IndexMap<String, ObjectData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
}

impl Packet {
    /// Entity name of a packet object.
    pub fn entity_of(object: &ObjectData) -> Option<&str> {
        object.get(ENTITY_FIELD).and_then(serde_json::Value::as_str)
    }

    /// Whether the object carries nothing but its identity.
    pub fn is_stub(object: &ObjectData) -> bool {
        object.keys().all(|k| k == ENTITY_FIELD || k == KEY_FIELD)
    }
}

/// Reference to an object inside an [`UpdatePacket`].
///
/// Stored objects are named by entity and key; objects created earlier in
/// the same packet by their tid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjRef {
    #[serde(rename = "_t")]
    pub entity: String,
    #[serde(rename = "_pk", default, skip_serializing_if = "serde_json::Value::is_null")]
    pub key: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
}

impl ObjRef {
    pub fn stored(entity: impl Into<String>, key: serde_json::Value) -> Self {
        Self {
            entity: entity.into(),
            key,
            tid: None,
        }
    }

    pub fn created(entity: impl Into<String>, tid: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: serde_json::Value::Null,
            tid: Some(tid.into()),
        }
    }
}

/// Old and new value of one changed attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrChange {
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// One client-side change.
///
/// Reference-valued attributes hold [`ObjRef`] JSON (or null); collections
/// hold arrays of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Change {
    Create {
        tid: String,
        entity: String,
        values: IndexMap<String, serde_json::Value>,
    },
    Update {
        target: ObjRef,
        values: IndexMap<String, AttrChange>,
    },
    Delete {
        target: ObjRef,
    },
    Add {
        target: ObjRef,
        attr: String,
        member: ObjRef,
    },
    Remove {
        target: ObjRef,
        attr: String,
        member: ObjRef,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatePacket {
    /// Hash of the schema the client was built against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
    pub changes: Vec<Change>,
    /// Application data passed through to the caller
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl UpdatePacket {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Server reply to an [`UpdatePacket`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveResponse {
    /// Keys assigned to created objects, by tid
    pub keys: IndexMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_wire_shape() {
        let change = Change::Add {
            target: ObjRef::stored("Student", json!(1)),
            attr: "courses".into(),
            member: ObjRef::created("Course", "c3"),
        };
        assert_eq!(
            serde_json::to_value(&change).unwrap(),
            json!({
                "action": "add",
                "target": {"_t": "Student", "_pk": 1},
                "attr": "courses",
                "member": {"_t": "Course", "tid": "c3"}
            })
        );
    }

    #[test]
    fn test_update_packet_defaults() {
        let packet: UpdatePacket = serde_json::from_value(json!({"changes": []})).unwrap();
        assert!(packet.is_empty());
        assert!(packet.payload.is_null());
        assert!(packet.schema_hash.is_none());
    }

    #[test]
    fn test_stub_detection() {
        let stub: ObjectData = serde_json::from_value(json!({"_t": "Car", "_pk": 7})).unwrap();
        let full: ObjectData =
            serde_json::from_value(json!({"_t": "Car", "_pk": 7, "make": "Volvo"})).unwrap();
        assert!(Packet::is_stub(&stub));
        assert!(!Packet::is_stub(&full));
        assert_eq!(Packet::entity_of(&full), Some("Car"));
    }
}
