//! Entity declarations and their resolved form.

use crate::attribute::Attribute;
use crate::value::Value;

/// Declaration of an entity, handed to [`SchemaBuilder::entity`](crate::SchemaBuilder::entity).
#[derive(Debug, Clone)]
pub struct EntityDef {
    pub(crate) name: String,
    pub(crate) table: Option<String>,
    pub(crate) attrs: Vec<Attribute>,
    pub(crate) base: Option<String>,
    pub(crate) discriminator_value: Option<Value>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            attrs: Vec::new(),
            base: None,
            discriminator_value: None,
        }
    }

    /// Table name; defaults to the entity name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Inherit from another entity (single-table inheritance).
    pub fn base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Value stored in the discriminator column; defaults to the entity name.
    pub fn discriminator_value(mut self, value: impl Into<Value>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    pub fn attr(mut self, attr: Attribute) -> Self {
        self.attrs.push(attr);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A validated entity inside a [`Schema`](crate::Schema).
#[derive(Debug, Clone)]
pub struct EntityInfo {
    pub(crate) name: String,
    pub(crate) table: String,
    pub(crate) root: String,
    pub(crate) base: Option<String>,
    pub(crate) children: Vec<String>,
    pub(crate) attrs: Vec<Attribute>,
    pub(crate) pk: Vec<usize>,
    pub(crate) discriminator: Option<(usize, Value)>,
}

impl EntityInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table storing this entity (shared by the whole hierarchy).
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name of the hierarchy root.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    /// Direct subclasses.
    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.base.is_none()
    }

    /// All attributes, inherited ones first.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attrs
    }

    /// Look up an attribute by name.
    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.name == name)
    }

    /// Index of an attribute in [`EntityInfo::attributes`].
    pub fn attr_index(&self, name: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a.name == name)
    }

    /// Primary-key attributes in declaration order.
    pub fn pk_attrs(&self) -> impl Iterator<Item = &Attribute> {
        self.pk.iter().map(|&i| &self.attrs[i])
    }

    /// Primary-key column names.
    pub fn pk_columns(&self) -> Vec<&str> {
        self.pk_attrs()
            .flat_map(|a| a.column_names().iter().map(String::as_str))
            .collect()
    }

    /// Whether the key is a single store-assigned column.
    pub fn has_auto_pk(&self) -> bool {
        self.pk.len() == 1 && self.attrs[self.pk[0]].is_auto()
    }

    /// Discriminator attribute and this entity's value, for hierarchies.
    pub fn discriminator(&self) -> Option<(&Attribute, &Value)> {
        self.discriminator
            .as_ref()
            .map(|(i, value)| (&self.attrs[*i], value))
    }
}
