//! Table definitions derived from a validated [`Schema`].
//!
//! Each inheritance hierarchy maps to one table named after its root; the
//! columns of subclasses are nullable. Every many-to-many pair gets a link
//! table keyed by both foreign key sets.

use corral_core::{ColumnDef, Result, Schema, SqlType};
use std::collections::HashSet;

/// A table to create.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    /// Root entity stored in the table; `None` for link tables.
    pub entity: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    /// Column sets with a UNIQUE constraint.
    pub unique: Vec<Vec<String>>,
    pub foreign_keys: Vec<ForeignKeyDef>,
    pub indexes: Vec<IndexDef>,
}

/// A foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDef {
    pub name: String,
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    pub on_delete_cascade: bool,
}

/// A secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl TableDef {
    /// Tables this one references, other than itself.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.foreign_keys
            .iter()
            .map(|fk| fk.ref_table.as_str())
            .filter(move |t| *t != self.name)
    }
}

/// All tables of `schema`, ordered so referenced tables come first where
/// the references allow it.
#[allow(clippy::result_large_err)]
pub fn schema_tables(schema: &Schema) -> Result<Vec<TableDef>> {
    let mut tables = Vec::new();
    for info in schema.entities().filter(|e| e.is_root()) {
        tables.push(entity_table(schema, info.name())?);
    }
    for link in schema.link_tables() {
        let local = schema.root_of(&link.local_entity)?;
        let remote = schema.entity(&link.remote_entity)?;
        let remote_root = schema.root_of(&link.remote_entity)?;
        let local_info = schema.entity(&link.local_entity)?;

        let mut columns = Vec::new();
        for (name, sql_type) in link.local_columns.iter().zip(&link.local_types) {
            columns.push(link_column(name, sql_type, &link.local_entity));
        }
        for (name, sql_type) in link.remote_columns.iter().zip(&link.remote_types) {
            columns.push(link_column(name, sql_type, &link.remote_entity));
        }

        let fk = |columns: &[String], target: &str, key: Vec<&str>| ForeignKeyDef {
            name: constraint_name("fk", &link.table, columns),
            columns: columns.to_vec(),
            ref_table: target.to_string(),
            ref_columns: key.into_iter().map(str::to_string).collect(),
            on_delete_cascade: true,
        };
        tables.push(TableDef {
            name: link.table.clone(),
            entity: None,
            primary_key: link
                .local_columns
                .iter()
                .chain(&link.remote_columns)
                .cloned()
                .collect(),
            unique: Vec::new(),
            foreign_keys: vec![
                fk(&link.local_columns, local.table(), local_info.pk_columns()),
                fk(&link.remote_columns, remote_root.table(), remote.pk_columns()),
            ],
            // The key already leads with the local columns.
            indexes: vec![IndexDef {
                name: constraint_name("idx", &link.table, &link.remote_columns),
                columns: link.remote_columns.clone(),
                unique: false,
            }],
            columns,
        });
    }
    Ok(order_by_dependencies(tables))
}

#[allow(clippy::result_large_err)]
fn entity_table(schema: &Schema, root: &str) -> Result<TableDef> {
    let info = schema.entity(root)?;
    let columns = schema.columns(root)?;

    let primary_key = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.clone())
        .collect();

    // Columns of one attribute stay together.
    let mut groups: Vec<(&str, Vec<&ColumnDef>)> = Vec::new();
    for col in &columns {
        match groups.last_mut() {
            Some((attr, cols)) if *attr == col.attr => cols.push(col),
            _ => groups.push((col.attr.as_str(), vec![col])),
        }
    }

    let mut unique = Vec::new();
    let mut foreign_keys = Vec::new();
    let mut indexes = Vec::new();
    for (_, cols) in &groups {
        let names: Vec<String> = cols.iter().map(|c| c.name.clone()).collect();
        if cols[0].unique && !cols[0].primary_key {
            unique.push(names.clone());
        }
        let refs: Vec<&(String, String)> = cols.iter().filter_map(|c| c.references.as_ref()).collect();
        if refs.len() == cols.len() {
            foreign_keys.push(ForeignKeyDef {
                name: constraint_name("fk", info.table(), &names),
                columns: names.clone(),
                ref_table: refs[0].0.clone(),
                ref_columns: refs.iter().map(|(_, c)| c.clone()).collect(),
                on_delete_cascade: false,
            });
            if !cols[0].unique {
                indexes.push(IndexDef {
                    name: constraint_name("idx", info.table(), &names),
                    columns: names,
                    unique: false,
                });
            }
        }
    }

    Ok(TableDef {
        name: info.table().to_string(),
        entity: Some(info.name().to_string()),
        columns,
        primary_key,
        unique,
        foreign_keys,
        indexes,
    })
}

fn link_column(name: &str, sql_type: &SqlType, entity: &str) -> ColumnDef {
    ColumnDef {
        name: name.to_string(),
        sql_type: sql_type.clone(),
        nullable: false,
        primary_key: true,
        auto_increment: false,
        unique: false,
        attr: name.to_string(),
        entity: entity.to_string(),
        references: None,
    }
}

fn constraint_name(prefix: &str, table: &str, columns: &[String]) -> String {
    format!("{prefix}_{table}_{}", columns.join("_"))
}

/// Stable topological order; a cycle is broken at the earliest remaining table.
fn order_by_dependencies(tables: Vec<TableDef>) -> Vec<TableDef> {
    let names: HashSet<String> = tables.iter().map(|t| t.name.clone()).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut pending = tables;
    let mut ordered = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let ready = pending.iter().position(|t| {
            t.dependencies()
                .all(|d| placed.contains(d) || !names.contains(d))
        });
        let next = pending.remove(ready.unwrap_or(0));
        if ready.is_none() {
            tracing::debug!(table = %next.name, "Breaking foreign key cycle");
        }
        placed.insert(next.name.clone());
        ordered.push(next);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::{Attribute, EntityDef};

    fn school() -> Schema {
        Schema::builder()
            .entity(
                EntityDef::new("Student")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required("name", SqlType::Text).unique())
                    .attr(Attribute::optional_ref("group", "Group"))
                    .attr(Attribute::set("courses", "Course")),
            )
            .entity(
                EntityDef::new("Group")
                    .attr(Attribute::primary_key("number", SqlType::Integer))
                    .attr(Attribute::set("students", "Student")),
            )
            .entity(
                EntityDef::new("Course")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required("title", SqlType::Text))
                    .attr(Attribute::set("students", "Student")),
            )
            .entity(
                EntityDef::new("Graduate")
                    .base("Student")
                    .attr(Attribute::optional("thesis", SqlType::Text)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_one_table_per_hierarchy() {
        let tables = schema_tables(&school()).unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert!(!names.contains(&"Graduate"));
        assert_eq!(names.len(), 4);

        let student = tables.iter().find(|t| t.name == "Student").unwrap();
        let thesis = student.columns.iter().find(|c| c.name == "thesis").unwrap();
        assert!(thesis.nullable);
        assert!(student.columns.iter().any(|c| c.name == "classtype"));
        assert_eq!(student.unique, vec![vec!["name".to_string()]]);
    }

    #[test]
    fn test_foreign_keys_and_order() {
        let tables = schema_tables(&school()).unwrap();
        let pos = |name: &str| tables.iter().position(|t| t.name == name).unwrap();
        assert!(pos("Group") < pos("Student"));
        assert!(pos("Course_Student") > pos("Course"));
        assert!(pos("Course_Student") > pos("Student"));

        let student = &tables[pos("Student")];
        assert_eq!(student.foreign_keys.len(), 1);
        let fk = &student.foreign_keys[0];
        assert_eq!(fk.columns, vec!["group".to_string()]);
        assert_eq!(fk.ref_table, "Group");
        assert_eq!(fk.ref_columns, vec!["number".to_string()]);
        assert_eq!(student.indexes[0].name, "idx_Student_group");
    }

    #[test]
    fn test_link_table() {
        let tables = schema_tables(&school()).unwrap();
        let link = tables.iter().find(|t| t.name == "Course_Student").unwrap();
        assert!(link.entity.is_none());
        assert_eq!(link.primary_key.len(), 2);
        assert!(link.columns.iter().all(|c| !c.nullable));
        assert_eq!(link.foreign_keys.len(), 2);
        assert!(link.foreign_keys.iter().all(|fk| fk.on_delete_cascade));
        let targets: HashSet<&str> = link.foreign_keys.iter().map(|fk| fk.ref_table.as_str()).collect();
        assert_eq!(targets, HashSet::from(["Course", "Student"]));
    }

    #[test]
    fn test_cycle_is_broken() {
        let schema = Schema::builder()
            .entity(
                EntityDef::new("A")
                    .attr(Attribute::primary_key("id", SqlType::BigInt))
                    .attr(Attribute::optional_ref("b", "B").reverse("many_a"))
                    .attr(Attribute::set("many_b", "B").reverse("a")),
            )
            .entity(
                EntityDef::new("B")
                    .attr(Attribute::primary_key("id", SqlType::BigInt))
                    .attr(Attribute::optional_ref("a", "A").reverse("many_b"))
                    .attr(Attribute::set("many_a", "A").reverse("b"))
                    .attr(Attribute::optional_ref("peer", "C")),
            )
            .entity(
                EntityDef::new("C")
                    .attr(Attribute::primary_key("id", SqlType::BigInt))
                    .attr(Attribute::set("peers", "B")),
            )
            .build()
            .unwrap();
        let tables = schema_tables(&schema).unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names.len(), 3);
        let pos = |name: &str| names.iter().position(|n| *n == name).unwrap();
        assert!(pos("C") < pos("B"));
        assert!(pos("C") < pos("A"));
    }
}
