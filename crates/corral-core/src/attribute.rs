//! Attribute declarations.
//!
//! An [`Attribute`] is declared with one of the constructors below and refined
//! with builder methods. Column names, optimistic flags and cascade rules left
//! open at declaration time are filled in when the [`Schema`](crate::Schema)
//! is built.

use crate::relationship::RelationshipInfo;
use crate::types::SqlType;
use crate::value::Value;

/// What an attribute is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKind {
    /// Part of the primary key
    PrimaryKey,
    /// NOT NULL column or required to-one reference
    Required,
    /// Nullable column or optional to-one reference
    Optional,
    /// To-many collection
    Set,
    /// Column holding the concrete entity name of a row
    Discriminator,
}

/// A declared attribute of an entity.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub(crate) name: String,
    pub(crate) kind: AttrKind,
    pub(crate) sql_type: Option<SqlType>,
    pub(crate) target: Option<String>,
    pub(crate) reverse: Option<String>,
    pub(crate) columns: Vec<String>,
    pub(crate) column_types: Vec<SqlType>,
    pub(crate) unique: bool,
    pub(crate) auto: bool,
    pub(crate) lazy: bool,
    pub(crate) optimistic: Option<bool>,
    pub(crate) cascade_delete: Option<bool>,
    pub(crate) hidden: bool,
    pub(crate) default: Option<Value>,
    pub(crate) min: Option<f64>,
    pub(crate) max: Option<f64>,
    pub(crate) min_len: Option<usize>,
    pub(crate) max_len: Option<usize>,
    pub(crate) pattern: Option<String>,
    pub(crate) link_table: Option<String>,
    pub(crate) declared_in: String,
    pub(crate) relation: Option<RelationshipInfo>,
}

impl Attribute {
    fn new(name: impl Into<String>, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
            sql_type: None,
            target: None,
            reverse: None,
            columns: Vec::new(),
            column_types: Vec::new(),
            unique: false,
            auto: false,
            lazy: false,
            optimistic: None,
            cascade_delete: None,
            hidden: false,
            default: None,
            min: None,
            max: None,
            min_len: None,
            max_len: None,
            pattern: None,
            link_table: None,
            declared_in: String::new(),
            relation: None,
        }
    }

    fn scalar(name: impl Into<String>, kind: AttrKind, sql_type: SqlType) -> Self {
        let mut attr = Self::new(name, kind);
        attr.sql_type = Some(sql_type);
        attr
    }

    fn reference(name: impl Into<String>, kind: AttrKind, target: impl Into<String>) -> Self {
        let mut attr = Self::new(name, kind);
        attr.target = Some(target.into());
        attr
    }

    /// A primary key column.
    pub fn primary_key(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self::scalar(name, AttrKind::PrimaryKey, sql_type)
    }

    /// A NOT NULL column.
    pub fn required(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self::scalar(name, AttrKind::Required, sql_type)
    }

    /// A nullable column.
    pub fn optional(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self::scalar(name, AttrKind::Optional, sql_type)
    }

    /// The discriminator column of an inheritance hierarchy.
    pub fn discriminator(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self::scalar(name, AttrKind::Discriminator, sql_type)
    }

    /// A to-one reference that must always be set.
    pub fn required_ref(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::reference(name, AttrKind::Required, target)
    }

    /// A to-one reference that may be unset.
    pub fn optional_ref(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::reference(name, AttrKind::Optional, target)
    }

    /// A to-many collection.
    pub fn set(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::reference(name, AttrKind::Set, target)
    }

    /// Name the attribute on the target entity that points back.
    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Let the store assign the value (auto-increment).
    pub fn auto(mut self) -> Self {
        self.auto = true;
        self
    }

    /// Leave the column out of default loads.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Opt in or out of optimistic checks for this attribute.
    pub fn optimistic(mut self, enabled: bool) -> Self {
        self.optimistic = Some(enabled);
        self
    }

    /// Whether deleting the owner deletes the related objects.
    pub fn cascade_delete(mut self, enabled: bool) -> Self {
        self.cascade_delete = Some(enabled);
        self
    }

    /// Never expose this attribute through the bridge.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Value applied when a new object does not set the attribute.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn min_len(mut self, len: usize) -> Self {
        self.min_len = Some(len);
        self
    }

    pub fn max_len(mut self, len: usize) -> Self {
        self.max_len = Some(len);
        self
    }

    /// Regular expression text values must match.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Name of the link table of a many-to-many pair.
    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.link_table = Some(name.into());
        self
    }

    /// Explicit column name.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns = vec![name.into()];
        self
    }

    /// Explicit column names for a reference to a composite key.
    pub fn columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = names.into_iter().map(Into::into).collect();
        self
    }

    // ==================== Accessors ====================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AttrKind {
        self.kind
    }

    /// Declared type of a scalar attribute.
    pub fn sql_type(&self) -> Option<&SqlType> {
        self.sql_type.as_ref()
    }

    /// Target entity of a relationship attribute.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn reverse_name(&self) -> Option<&str> {
        self.reverse.as_deref()
    }

    /// Columns this attribute occupies in its entity's table.
    ///
    /// Empty for collections and for to-one attributes whose column lives on
    /// the other side of a one-to-one pair.
    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Types of [`Attribute::column_names`], position for position.
    pub fn column_types(&self) -> &[SqlType] {
        &self.column_types
    }

    /// The single column of this attribute, if it has exactly one.
    pub fn single_column(&self) -> Option<&str> {
        match self.columns.as_slice() {
            [col] => Some(col),
            _ => None,
        }
    }

    pub fn is_pk(&self) -> bool {
        self.kind == AttrKind::PrimaryKey
    }

    pub fn is_relation(&self) -> bool {
        self.target.is_some()
    }

    pub fn is_collection(&self) -> bool {
        self.kind == AttrKind::Set
    }

    /// Whether a NULL may be stored (ignores inheritance widening).
    pub fn is_nullable(&self) -> bool {
        self.kind == AttrKind::Optional
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_auto(&self) -> bool {
        self.auto
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Whether this attribute qualifies optimistic UPDATE/DELETE statements.
    pub fn is_optimistic(&self) -> bool {
        self.optimistic.unwrap_or(false)
    }

    /// Whether deleting an object deletes what this attribute refers to.
    pub fn cascades_delete(&self) -> bool {
        self.cascade_delete.unwrap_or(false)
    }

    /// Whether cascade was set explicitly at declaration.
    pub fn cascade_explicit(&self) -> Option<bool> {
        self.cascade_delete
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Entity that declared this attribute (differs from the owner for inherited attributes).
    pub fn declared_in(&self) -> &str {
        &self.declared_in
    }

    /// Resolved relationship, for relationship attributes.
    pub fn relation(&self) -> Option<&RelationshipInfo> {
        self.relation.as_ref()
    }

    /// Link table name given at declaration.
    pub fn link_table(&self) -> Option<&str> {
        self.link_table.as_deref()
    }

    pub fn bounds(&self) -> (Option<f64>, Option<f64>) {
        (self.min, self.max)
    }

    pub fn length_bounds(&self) -> (Option<usize>, Option<usize>) {
        (self.min_len, self.max_len)
    }

    pub fn pattern_str(&self) -> Option<&str> {
        self.pattern.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_options() {
        let attr = Attribute::required("name", SqlType::Text)
            .unique()
            .max_len(40)
            .pattern("^[A-Z]")
            .column("full_name");
        assert_eq!(attr.kind(), AttrKind::Required);
        assert!(attr.is_unique());
        assert_eq!(attr.length_bounds(), (None, Some(40)));
        assert_eq!(attr.single_column(), Some("full_name"));
        assert!(!attr.is_relation());
    }

    #[test]
    fn references_carry_target_and_reverse() {
        let attr = Attribute::set("cars", "Car").reverse("owner").cascade_delete(true);
        assert!(attr.is_collection());
        assert_eq!(attr.target(), Some("Car"));
        assert_eq!(attr.reverse_name(), Some("owner"));
        assert_eq!(attr.cascade_explicit(), Some(true));
        assert!(attr.column_names().is_empty());
    }
}
