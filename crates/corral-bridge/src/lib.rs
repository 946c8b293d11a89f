//! JSON bridge for corral sessions.
//!
//! `corral-bridge` moves objects between a [`Session`](corral_session::Session)
//! and a client that only speaks JSON:
//!
//! - [`serialize`] renders objects and everything they reach as a [`Packet`],
//!   with a [`SchemaDescription`] the client can interpret it by.
//! - [`deserialize`] replays an [`UpdatePacket`] of client changes,
//!   verifying the values the client saw against the stored ones.
//! - [`RemoteCache`] is the client side: it merges packets, records local
//!   edits and produces the update packet.
//!
//! Both directions consult an optional [`PermissionContext`]. Without one,
//! everything except `hidden` attributes is reachable.
//!
//! # Example
//!
//! ```ignore
//! let packet = serialize(&session, &[ann], &SerializeOptions::new().include(["Person.cars"]), None)?;
//! let mut cache = RemoteCache::from_packet(packet)?;
//! let tid = cache.roots()[0].clone();
//! cache.set(&tid, "age", json!(31))?;
//! let applied = deserialize(&session, &cache.changes(), None, |_| Ok(()))?;
//! session.commit()?;
//! ```

pub mod describe;
pub mod deserialize;
pub mod packet;
pub mod permission;
pub mod remote;
pub mod serialize;

pub use describe::{AttrDescription, AttrKindName, EntityDescription, SchemaDescription, describe};
pub use deserialize::{Applied, Mutation, deserialize};
pub use packet::{AttrChange, Change, ObjRef, ObjectData, Packet, SaveResponse, UpdatePacket};
pub use permission::{ANYBODY, Permission, PermissionContext, Permissions, Rule, Subject};
#[cfg(feature = "http")]
pub use remote::HttpTransport;
pub use remote::{RemoteCache, Transport};
pub use serialize::{SerializeOptions, serialize};

use corral_core::{Error, Result, Schema, Value};

/// A parsed list of `Entity.attr` names.
#[derive(Debug, Clone, Default)]
pub(crate) struct AttrNames {
    names: Vec<(String, String)>,
}

impl AttrNames {
    #[allow(clippy::result_large_err)]
    pub(crate) fn parse(schema: &Schema, names: &[String]) -> Result<Self> {
        let mut parsed = Vec::with_capacity(names.len());
        for name in names {
            let Some((entity, attr)) = name.split_once('.') else {
                return Err(Error::malformed(format!(
                    "'{name}' is not of the form Entity.attribute"
                )));
            };
            let info = schema
                .entity(entity)
                .map_err(|_| Error::malformed(format!("unknown entity in '{name}'")))?;
            if info.attr(attr).is_none() {
                return Err(Error::malformed(format!("unknown attribute '{name}'")));
            }
            parsed.push((entity.to_string(), attr.to_string()));
        }
        Ok(Self { names: parsed })
    }

    /// Whether `entity.attr` is named, directly or through a base entity.
    pub(crate) fn names(&self, schema: &Schema, entity: &str, attr: &str) -> bool {
        self.names
            .iter()
            .any(|(e, a)| a == attr && schema.is_subclass_of(entity, e))
    }
}

/// Wire form of a key: null when unknown, a bare value for a single
/// column, an array otherwise.
pub(crate) fn key_json(key: &[Value]) -> serde_json::Value {
    match key {
        [] => serde_json::Value::Null,
        [single] => single.to_json(),
        many => serde_json::Value::Array(many.iter().map(Value::to_json).collect()),
    }
}
