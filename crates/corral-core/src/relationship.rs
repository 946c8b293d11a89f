//! Resolved relationship metadata.
//!
//! Relationship attributes are declared pairwise (an attribute and its reverse
//! on the target entity). Building the [`Schema`](crate::Schema) classifies
//! each pair and decides which table carries the foreign key columns.

use crate::types::SqlType;

/// The type of relationship between two entities, seen from one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many `Car`s belong to one `Person`; the FK lives on this side.
    ManyToOne,
    /// One `Person` has many `Car`s; the FK lives on the target.
    OneToMany,
    /// One-to-one; `owner` tells whether this side stores the FK.
    OneToOne { owner: bool },
    /// Many-to-many through a link table.
    ManyToMany { link: LinkTableInfo },
}

/// Link table of a many-to-many pair, oriented from the side that holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g. `"Course_Student"`).
    pub table: String,
    /// Columns pointing at the local entity's key.
    pub local_columns: Vec<String>,
    /// Columns pointing at the remote entity's key.
    pub remote_columns: Vec<String>,
    pub local_entity: String,
    pub remote_entity: String,
    pub local_types: Vec<SqlType>,
    pub remote_types: Vec<SqlType>,
}

impl LinkTableInfo {
    /// The same link table seen from the other side.
    #[must_use]
    pub fn flipped(&self) -> Self {
        Self {
            table: self.table.clone(),
            local_columns: self.remote_columns.clone(),
            remote_columns: self.local_columns.clone(),
            local_entity: self.remote_entity.clone(),
            remote_entity: self.local_entity.clone(),
            local_types: self.remote_types.clone(),
            remote_types: self.local_types.clone(),
        }
    }
}

/// A resolved relationship attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipInfo {
    pub kind: RelationshipKind,
    pub target: String,
    /// Attribute on the target that points back.
    pub reverse: String,
    /// FK columns. They live on this entity's table when [`holds_fk`](Self::holds_fk)
    /// is true and on the target's table otherwise. Empty for many-to-many.
    pub fk_columns: Vec<String>,
    /// Primary-key columns the FK columns refer to, position for position.
    pub key_columns: Vec<String>,
}

impl RelationshipInfo {
    /// Whether the FK columns are stored in this entity's table.
    pub fn holds_fk(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::ManyToOne | RelationshipKind::OneToOne { owner: true }
        )
    }

    pub fn is_to_one(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::ManyToOne | RelationshipKind::OneToOne { .. }
        )
    }

    pub fn is_to_many(&self) -> bool {
        !self.is_to_one()
    }

    pub fn link(&self) -> Option<&LinkTableInfo> {
        match &self.kind {
            RelationshipKind::ManyToMany { link } => Some(link),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> LinkTableInfo {
        LinkTableInfo {
            table: "Course_Student".to_string(),
            local_columns: vec!["student".to_string()],
            remote_columns: vec!["course".to_string()],
            local_entity: "Student".to_string(),
            remote_entity: "Course".to_string(),
            local_types: vec![SqlType::BigInt],
            remote_types: vec![SqlType::Text],
        }
    }

    #[test]
    fn flipping_swaps_sides() {
        let flipped = link().flipped();
        assert_eq!(flipped.local_columns, vec!["course".to_string()]);
        assert_eq!(flipped.remote_entity, "Student");
        assert_eq!(flipped.local_types, vec![SqlType::Text]);
        assert_eq!(flipped.flipped(), link());
    }

    #[test]
    fn fk_side() {
        let rel = RelationshipInfo {
            kind: RelationshipKind::OneToOne { owner: false },
            target: "Passport".to_string(),
            reverse: "person".to_string(),
            fk_columns: vec!["person".to_string()],
            key_columns: vec!["id".to_string()],
        };
        assert!(rel.is_to_one());
        assert!(!rel.holds_fk());
        let m2m = RelationshipInfo {
            kind: RelationshipKind::ManyToMany { link: link() },
            ..rel
        };
        assert!(m2m.is_to_many());
        assert!(m2m.link().is_some());
    }
}
