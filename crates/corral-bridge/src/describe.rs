//! Schema description shipped inside packets.

use corral_core::{AttrKind, Schema};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Entities of a schema as a client sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub entities: IndexMap<String, EntityDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescription {
    /// Primary key attributes
    pub key: Vec<String>,
    /// Ancestors, nearest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bases: Vec<String>,
    pub attrs: IndexMap<String, AttrDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrDescription {
    pub kind: AttrKindName,
    /// JSON kind of a scalar (`int`, `str`, ...)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub json_type: Option<String>,
    /// Entity a relationship points to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lazy: bool,
}

/// Wire spelling of [`AttrKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrKindName {
    PrimaryKey,
    Required,
    Optional,
    Set,
    Discriminator,
}

impl From<AttrKind> for AttrKindName {
    fn from(kind: AttrKind) -> Self {
        match kind {
            AttrKind::PrimaryKey => AttrKindName::PrimaryKey,
            AttrKind::Required => AttrKindName::Required,
            AttrKind::Optional => AttrKindName::Optional,
            AttrKind::Set => AttrKindName::Set,
            AttrKind::Discriminator => AttrKindName::Discriminator,
        }
    }
}

impl AttrDescription {
    pub fn is_reference(&self) -> bool {
        self.target.is_some() && self.kind != AttrKindName::Set
    }

    pub fn is_collection(&self) -> bool {
        self.kind == AttrKindName::Set
    }
}

impl EntityDescription {
    /// Root of the hierarchy the entity belongs to.
    pub fn root<'a>(&'a self, name: &'a str) -> &'a str {
        self.bases.last().map_or(name, String::as_str)
    }
}

impl SchemaDescription {
    /// Attribute `attr` of `entity`, if both exist.
    pub fn attr(&self, entity: &str, attr: &str) -> Option<&AttrDescription> {
        self.entities.get(entity).and_then(|e| e.attrs.get(attr))
    }

    /// Root entity of `entity`.
    pub fn root_of<'a>(&'a self, entity: &'a str) -> &'a str {
        self.entities.get(entity).map_or(entity, |e| e.root(entity))
    }

    /// SHA-256 of the canonical JSON form, hex encoded.
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

/// Describe every entity of `schema`.
pub fn describe(schema: &Schema) -> SchemaDescription {
    let entities = schema
        .entities()
        .map(|info| {
            let mut bases = Vec::new();
            let mut base = info.base();
            while let Some(name) = base {
                bases.push(name.to_string());
                base = schema.entity(name).ok().and_then(|e| e.base());
            }
            let attrs = info
                .attributes()
                .iter()
                .map(|attr| {
                    let relation = attr.relation();
                    let description = AttrDescription {
                        kind: attr.kind().into(),
                        json_type: attr.sql_type().map(|t| t.json_kind().to_string()),
                        target: relation.map(|r| r.target.clone()),
                        reverse: relation.map(|r| r.reverse.clone()),
                        lazy: attr.is_lazy(),
                    };
                    (attr.name().to_string(), description)
                })
                .collect();
            let description = EntityDescription {
                key: info.pk_attrs().map(|a| a.name().to_string()).collect(),
                bases,
                attrs,
            };
            (info.name().to_string(), description)
        })
        .collect();
    SchemaDescription { entities }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{Attribute, EntityDef, SqlType};

    fn schema() -> Schema {
        Schema::builder()
            .entity(
                EntityDef::new("Person")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required("name", SqlType::Text))
                    .attr(Attribute::set("cars", "Car")),
            )
            .entity(
                EntityDef::new("Student")
                    .base("Person")
                    .attr(Attribute::optional("gpa", SqlType::Double)),
            )
            .entity(
                EntityDef::new("Car")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required_ref("owner", "Person")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_describe_lists_kinds_targets_and_bases() {
        let description = describe(&schema());
        let person = &description.entities["Person"];
        assert_eq!(person.key, vec!["id"]);
        assert_eq!(person.attrs["name"].json_type.as_deref(), Some("str"));
        assert!(person.attrs["cars"].is_collection());
        assert_eq!(person.attrs["cars"].reverse.as_deref(), Some("owner"));

        let student = &description.entities["Student"];
        assert_eq!(student.bases, vec!["Person"]);
        assert_eq!(description.root_of("Student"), "Person");

        assert!(description.attr("Car", "owner").unwrap().is_reference());
    }

    #[test]
    fn test_hash_is_stable_and_content_sensitive() {
        let a = describe(&schema());
        let b = describe(&schema());
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);

        let mut c = a.clone();
        c.entities.shift_remove("Car");
        assert_ne!(a.hash(), c.hash());
    }
}
