//! The validated entity registry.
//!
//! A [`Schema`] is built once from [`EntityDef`] declarations and shared
//! (`Arc<Schema>`) by every session, query translator and DDL generator.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::Result;
use crate::attribute::{AttrKind, Attribute};
use crate::entity::{EntityDef, EntityInfo};
use crate::error::{Error, SchemaErrorKind};
use crate::relationship::{LinkTableInfo, RelationshipInfo, RelationshipKind};
use crate::types::SqlType;
use crate::validate::{is_identifier, validate_pattern};
use crate::value::Value;

/// Name of the discriminator column added to hierarchies that do not declare one.
pub const IMPLICIT_DISCRIMINATOR: &str = "classtype";

/// A column of an entity table, for DDL and full-row loads.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    /// Attribute owning the column
    pub attr: String,
    /// Entity that declared the attribute
    pub entity: String,
    /// `(target table, target column)` for FK columns
    pub references: Option<(String, String)>,
}

/// Validated, immutable registry of entities.
#[derive(Debug, Clone)]
pub struct Schema {
    entities: IndexMap<String, EntityInfo>,
    link_tables: Vec<LinkTableInfo>,
}

/// Collects entity declarations for [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    defs: Vec<EntityDef>,
}

fn invalid(message: impl Into<String>) -> Error {
    Error::schema(SchemaErrorKind::Invalid, message)
}

fn relationship_error(message: impl Into<String>) -> Error {
    Error::schema(SchemaErrorKind::Relationship, message)
}

fn inheritance_error(message: impl Into<String>) -> Error {
    Error::schema(SchemaErrorKind::Inheritance, message)
}

fn check_identifier(name: &str, what: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(invalid(format!("invalid {what} '{name}'")))
    }
}

/// Key column of a hierarchy root: `(attribute, column, type)`.
type KeyPart = (String, String, SqlType);

impl SchemaBuilder {
    /// Add an entity declaration.
    pub fn entity(mut self, def: EntityDef) -> Self {
        self.defs.push(def);
        self
    }

    /// Validate the declarations and resolve relationships.
    #[tracing::instrument(level = "debug", skip(self), fields(entities = self.defs.len()))]
    pub fn build(self) -> Result<Schema> {
        let mut defs: IndexMap<String, EntityDef> = IndexMap::new();
        for def in self.defs {
            check_identifier(&def.name, "entity name")?;
            if defs.contains_key(&def.name) {
                return Err(invalid(format!("entity '{}' declared twice", def.name)));
            }
            defs.insert(def.name.clone(), def);
        }

        let chains = resolve_chains(&defs)?;
        add_discriminators(&mut defs, &chains)?;
        resolve_scalars(&mut defs, &chains)?;

        let keys = collect_keys(&defs, &chains)?;
        let link_tables = resolve_relationships(&mut defs, &chains, &keys)?;

        let mut entities = IndexMap::new();
        for name in defs.keys() {
            let info = assemble(&defs, &chains[name], name)?;
            entities.insert(name.clone(), info);
        }
        check_hierarchy_columns(&entities)?;

        let tables: HashSet<&str> = entities.values().map(|e| e.table.as_str()).collect();
        for link in &link_tables {
            if tables.contains(link.table.as_str()) {
                return Err(invalid(format!(
                    "link table '{}' collides with an entity table",
                    link.table
                )));
            }
        }

        tracing::debug!(
            entities = entities.len(),
            link_tables = link_tables.len(),
            "Schema built"
        );
        Ok(Schema {
            entities,
            link_tables,
        })
    }
}

/// Inheritance chain (root first) of every entity.
fn resolve_chains(defs: &IndexMap<String, EntityDef>) -> Result<HashMap<String, Vec<String>>> {
    let mut chains = HashMap::new();
    for name in defs.keys() {
        let mut chain = vec![name.clone()];
        let mut current = name.as_str();
        while let Some(base) = defs[current].base.as_deref() {
            if !defs.contains_key(base) {
                return Err(Error::schema(
                    SchemaErrorKind::UnknownEntity,
                    format!("entity '{current}' inherits from unknown entity '{base}'"),
                ));
            }
            if chain.iter().any(|c| c == base) {
                return Err(inheritance_error(format!(
                    "inheritance cycle through '{base}'"
                )));
            }
            chain.push(base.to_string());
            current = base;
        }
        chain.reverse();
        chains.insert(name.clone(), chain);
    }
    Ok(chains)
}

fn add_discriminators(
    defs: &mut IndexMap<String, EntityDef>,
    chains: &HashMap<String, Vec<String>>,
) -> Result<()> {
    let roots_with_children: HashSet<String> = chains
        .values()
        .filter(|chain| chain.len() > 1)
        .map(|chain| chain[0].clone())
        .collect();

    for (name, def) in defs.iter_mut() {
        let declared = def
            .attrs
            .iter()
            .filter(|a| a.kind == AttrKind::Discriminator)
            .count();
        if def.base.is_some() && declared > 0 {
            return Err(inheritance_error(format!(
                "only the root of a hierarchy can declare a discriminator ('{name}')"
            )));
        }
        if declared > 1 {
            return Err(inheritance_error(format!(
                "entity '{name}' declares more than one discriminator"
            )));
        }
        if declared == 0 && roots_with_children.contains(name) {
            def.attrs.push(Attribute::discriminator(
                IMPLICIT_DISCRIMINATOR,
                SqlType::Text,
            ));
        }
    }
    Ok(())
}

fn resolve_scalars(
    defs: &mut IndexMap<String, EntityDef>,
    chains: &HashMap<String, Vec<String>>,
) -> Result<()> {
    for (name, def) in defs.iter_mut() {
        if let Some(table) = &def.table {
            check_identifier(table, "table name")?;
        }
        let is_root = chains[name].len() == 1;
        let mut seen = HashSet::new();
        for attr in &mut def.attrs {
            check_identifier(&attr.name, "attribute name")?;
            if !seen.insert(attr.name.clone()) {
                return Err(invalid(format!(
                    "attribute '{}.{}' declared twice",
                    name, attr.name
                )));
            }
            for column in &attr.columns {
                check_identifier(column, "column name")?;
            }
            attr.declared_in = name.clone();

            if attr.kind == AttrKind::PrimaryKey && !is_root {
                return Err(inheritance_error(format!(
                    "subclass '{}' cannot declare primary key '{}'",
                    name, attr.name
                )));
            }
            if attr.auto && attr.kind != AttrKind::PrimaryKey {
                return Err(invalid(format!(
                    "only primary keys can be auto ('{}.{}')",
                    name, attr.name
                )));
            }
            if let Some(pattern) = &attr.pattern {
                if let Some(message) = validate_pattern(pattern) {
                    return Err(invalid(format!("{}.{}: {}", name, attr.name, message)));
                }
            }

            if let Some(sql_type) = attr.sql_type.clone() {
                if attr.auto && !sql_type.is_integer() {
                    return Err(invalid(format!(
                        "auto key '{}.{}' must be an integer",
                        name, attr.name
                    )));
                }
                if attr.columns.len() > 1 {
                    return Err(invalid(format!(
                        "scalar attribute '{}.{}' maps to one column",
                        name, attr.name
                    )));
                }
                if attr.columns.is_empty() {
                    attr.columns = vec![attr.name.clone()];
                }
                attr.optimistic = Some(match attr.kind {
                    AttrKind::PrimaryKey | AttrKind::Discriminator => false,
                    _ => attr
                        .optimistic
                        .unwrap_or_else(|| sql_type.optimistic_by_default()),
                });
                attr.cascade_delete = Some(false);
                attr.column_types = vec![sql_type];
            }
        }
    }
    Ok(())
}

fn collect_keys(
    defs: &IndexMap<String, EntityDef>,
    chains: &HashMap<String, Vec<String>>,
) -> Result<HashMap<String, Vec<KeyPart>>> {
    let mut keys = HashMap::new();
    for (name, def) in defs {
        if chains[name].len() > 1 {
            continue;
        }
        let parts: Vec<KeyPart> = def
            .attrs
            .iter()
            .filter(|a| a.kind == AttrKind::PrimaryKey)
            .map(|a| {
                (
                    a.name.clone(),
                    a.columns[0].clone(),
                    a.column_types[0].clone(),
                )
            })
            .collect();
        if parts.is_empty() {
            return Err(invalid(format!("entity '{name}' has no primary key")));
        }
        let auto_count = def.attrs.iter().filter(|a| a.auto).count();
        if auto_count > 0 && parts.len() > 1 {
            return Err(invalid(format!(
                "composite key of '{name}' cannot be auto"
            )));
        }
        keys.insert(name.clone(), parts);
    }
    for (name, chain) in chains {
        if chain.len() > 1 {
            let root_key = keys[&chain[0]].clone();
            keys.insert(name.clone(), root_key);
        }
    }
    Ok(keys)
}

/// All attributes visible on an entity: `(declaring entity, index)`.
fn visible_attrs<'a>(
    defs: &'a IndexMap<String, EntityDef>,
    chain: &'a [String],
) -> impl Iterator<Item = (&'a str, usize, &'a Attribute)> {
    chain.iter().flat_map(move |entity| {
        defs[entity.as_str()]
            .attrs
            .iter()
            .enumerate()
            .map(move |(i, a)| (entity.as_str(), i, a))
    })
}

struct Resolved {
    relation: RelationshipInfo,
    columns: Vec<String>,
    column_types: Vec<SqlType>,
    cascade: bool,
    optimistic: bool,
}

fn link_column_names(entity: &str, key: &[KeyPart], suffix: &str) -> Vec<String> {
    let base = entity.to_lowercase();
    if key.len() == 1 {
        vec![format!("{base}{suffix}")]
    } else {
        key.iter()
            .map(|(attr, _, _)| format!("{base}{suffix}_{attr}"))
            .collect()
    }
}

fn fk_columns(entity: &str, attr: &Attribute, key: &[KeyPart]) -> Result<Vec<String>> {
    if !attr.columns.is_empty() {
        if attr.columns.len() != key.len() {
            return Err(relationship_error(format!(
                "'{}.{}' names {} columns but the key of '{}' has {}",
                entity,
                attr.name,
                attr.columns.len(),
                attr.target.as_deref().unwrap_or_default(),
                key.len()
            )));
        }
        return Ok(attr.columns.clone());
    }
    if key.len() == 1 {
        Ok(vec![attr.name.clone()])
    } else {
        Ok(key
            .iter()
            .map(|(part, _, _)| format!("{}_{}", attr.name, part))
            .collect())
    }
}

fn resolve_relationships(
    defs: &mut IndexMap<String, EntityDef>,
    chains: &HashMap<String, Vec<String>>,
    keys: &HashMap<String, Vec<KeyPart>>,
) -> Result<Vec<LinkTableInfo>> {
    let mut resolved: HashMap<(String, String), Resolved> = HashMap::new();
    let mut link_tables: Vec<LinkTableInfo> = Vec::new();

    let rel_attrs: Vec<(String, usize)> = defs
        .iter()
        .flat_map(|(name, def)| {
            def.attrs
                .iter()
                .enumerate()
                .filter(|(_, a)| a.target.is_some())
                .map(move |(i, _)| (name.clone(), i))
        })
        .collect();

    for (entity, index) in rel_attrs {
        let attr = defs[entity.as_str()].attrs[index].clone();
        if resolved.contains_key(&(entity.clone(), attr.name.clone())) {
            continue;
        }
        let target = attr.target.clone().unwrap_or_default();
        if !defs.contains_key(&target) {
            return Err(Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("'{}.{}' refers to unknown entity '{}'", entity, attr.name, target),
            ));
        }
        if matches!(attr.kind, AttrKind::PrimaryKey | AttrKind::Discriminator) {
            return Err(invalid(format!(
                "'{}.{}' cannot be a relationship",
                entity, attr.name
            )));
        }

        let candidates: Vec<(&str, usize, &Attribute)> = visible_attrs(defs, &chains[&target])
            .filter(|(decl, _, rev)| {
                rev.target.as_deref() == Some(entity.as_str())
                    && !(*decl == entity && rev.name == attr.name)
                    && attr.reverse.as_ref().is_none_or(|r| *r == rev.name)
                    && rev.reverse.as_ref().is_none_or(|r| *r == attr.name)
            })
            .collect();
        let (rev_entity, rev_index) = match candidates.as_slice() {
            [(decl, i, _)] => ((*decl).to_string(), *i),
            [] => {
                return Err(relationship_error(format!(
                    "'{}.{}' has no reverse attribute on '{}'",
                    entity, attr.name, target
                )));
            }
            _ => {
                return Err(relationship_error(format!(
                    "reverse of '{}.{}' is ambiguous; name it with reverse()",
                    entity, attr.name
                )));
            }
        };
        let rev = defs[rev_entity.as_str()].attrs[rev_index].clone();
        if rev_entity != target {
            return Err(relationship_error(format!(
                "'{}.{}' targets '{}' but its reverse is declared on '{}'",
                entity, attr.name, target, rev_entity
            )));
        }

        let (a_res, b_res) = pair(&entity, &attr, &rev_entity, &rev, keys, &mut link_tables)?;
        resolved.insert((entity.clone(), attr.name.clone()), a_res);
        resolved.insert((rev_entity.clone(), rev.name.clone()), b_res);
    }

    for (name, def) in defs.iter_mut() {
        for attr in &mut def.attrs {
            if let Some(res) = resolved.remove(&(name.clone(), attr.name.clone())) {
                attr.reverse = Some(res.relation.reverse.clone());
                attr.columns = res.columns;
                attr.column_types = res.column_types;
                attr.cascade_delete = Some(res.cascade);
                attr.optimistic = Some(res.optimistic);
                attr.relation = Some(res.relation);
            }
        }
    }
    Ok(link_tables)
}

/// Resolve one attribute pair `a` (on `ea`) and `b` (on `eb`).
fn pair(
    ea: &str,
    a: &Attribute,
    eb: &str,
    b: &Attribute,
    keys: &HashMap<String, Vec<KeyPart>>,
    link_tables: &mut Vec<LinkTableInfo>,
) -> Result<(Resolved, Resolved)> {
    use AttrKind::{Optional, Required, Set};

    let key_a = &keys[ea];
    let key_b = &keys[eb];
    let key_cols = |key: &[KeyPart]| key.iter().map(|(_, c, _)| c.clone()).collect::<Vec<_>>();
    let key_types = |key: &[KeyPart]| key.iter().map(|(_, _, t)| t.clone()).collect::<Vec<_>>();
    let cascade_default = |this: &Attribute, other: &Attribute| {
        this.cascade_delete.unwrap_or(other.kind == Required)
    };

    let no_columns = |attr: &Attribute, entity: &str| {
        if attr.columns.is_empty() {
            Ok(())
        } else {
            Err(relationship_error(format!(
                "'{}.{}' does not store a foreign key and cannot name columns",
                entity, attr.name
            )))
        }
    };

    match (a.kind, b.kind) {
        (Required | Optional, Set) | (Set, Required | Optional) => {
            let (owner, owner_e, many, many_e, owner_is_a) = if a.kind == Set {
                (b, eb, a, ea, false)
            } else {
                (a, ea, b, eb, true)
            };
            no_columns(many, many_e)?;
            let owner_key = &keys[many_e];
            let cols = fk_columns(owner_e, owner, owner_key)?;
            let types = key_types(owner_key);
            let owner_res = Resolved {
                relation: RelationshipInfo {
                    kind: RelationshipKind::ManyToOne,
                    target: many_e.to_string(),
                    reverse: many.name.clone(),
                    fk_columns: cols.clone(),
                    key_columns: key_cols(owner_key),
                },
                columns: cols.clone(),
                column_types: types,
                cascade: cascade_default(owner, many),
                optimistic: owner.optimistic.unwrap_or(true),
            };
            let many_res = Resolved {
                relation: RelationshipInfo {
                    kind: RelationshipKind::OneToMany,
                    target: owner_e.to_string(),
                    reverse: owner.name.clone(),
                    fk_columns: cols,
                    key_columns: key_cols(owner_key),
                },
                columns: Vec::new(),
                column_types: Vec::new(),
                cascade: cascade_default(many, owner),
                optimistic: false,
            };
            Ok(if owner_is_a {
                (owner_res, many_res)
            } else {
                (many_res, owner_res)
            })
        }
        (Set, Set) => {
            no_columns(a, ea)?;
            no_columns(b, eb)?;
            let table = match (&a.link_table, &b.link_table) {
                (Some(x), Some(y)) if x != y => {
                    return Err(relationship_error(format!(
                        "'{}.{}' and '{}.{}' name different link tables",
                        ea, a.name, eb, b.name
                    )));
                }
                (Some(x), _) | (_, Some(x)) => x.clone(),
                (None, None) => {
                    let mut names = [ea, eb];
                    names.sort_unstable();
                    format!("{}_{}", names[0], names[1])
                }
            };
            check_identifier(&table, "link table name")?;
            let (suffix_a, suffix_b) = if ea == eb {
                if a.name < b.name { ("", "_2") } else { ("_2", "") }
            } else {
                ("", "")
            };
            let link = LinkTableInfo {
                table,
                local_columns: link_column_names(ea, key_a, suffix_a),
                remote_columns: link_column_names(eb, key_b, suffix_b),
                local_entity: ea.to_string(),
                remote_entity: eb.to_string(),
                local_types: key_types(key_a),
                remote_types: key_types(key_b),
            };
            if link_tables.iter().any(|l| l.table == link.table) {
                return Err(relationship_error(format!(
                    "link table '{}' is used by more than one relationship",
                    link.table
                )));
            }
            link_tables.push(link.clone());
            let a_res = Resolved {
                relation: RelationshipInfo {
                    kind: RelationshipKind::ManyToMany { link: link.clone() },
                    target: eb.to_string(),
                    reverse: b.name.clone(),
                    fk_columns: Vec::new(),
                    key_columns: key_cols(key_b),
                },
                columns: Vec::new(),
                column_types: Vec::new(),
                cascade: a.cascade_delete.unwrap_or(false),
                optimistic: false,
            };
            let b_res = Resolved {
                relation: RelationshipInfo {
                    kind: RelationshipKind::ManyToMany {
                        link: link.flipped(),
                    },
                    target: ea.to_string(),
                    reverse: a.name.clone(),
                    fk_columns: Vec::new(),
                    key_columns: key_cols(key_a),
                },
                columns: Vec::new(),
                column_types: Vec::new(),
                cascade: b.cascade_delete.unwrap_or(false),
                optimistic: false,
            };
            Ok((a_res, b_res))
        }
        (Required | Optional, Required | Optional) => {
            if a.kind == Required && b.kind == Required {
                return Err(relationship_error(format!(
                    "'{}.{}' and '{}.{}' cannot both be required",
                    ea, a.name, eb, b.name
                )));
            }
            let a_owns = match (a.columns.is_empty(), b.columns.is_empty()) {
                (false, false) => {
                    return Err(relationship_error(format!(
                        "only one side of '{}.{}' / '{}.{}' can name columns",
                        ea, a.name, eb, b.name
                    )));
                }
                (false, true) => true,
                (true, false) => false,
                (true, true) => {
                    if a.kind != b.kind {
                        a.kind == Required
                    } else {
                        (ea, a.name.as_str()) < (eb, b.name.as_str())
                    }
                }
            };
            let (owner, owner_e, other, other_e) = if a_owns { (a, ea, b, eb) } else { (b, eb, a, ea) };
            let other_key = &keys[other_e];
            let cols = fk_columns(owner_e, owner, other_key)?;
            let owner_res = Resolved {
                relation: RelationshipInfo {
                    kind: RelationshipKind::OneToOne { owner: true },
                    target: other_e.to_string(),
                    reverse: other.name.clone(),
                    fk_columns: cols.clone(),
                    key_columns: key_cols(other_key),
                },
                columns: cols.clone(),
                column_types: key_types(other_key),
                cascade: cascade_default(owner, other),
                optimistic: owner.optimistic.unwrap_or(true),
            };
            let other_res = Resolved {
                relation: RelationshipInfo {
                    kind: RelationshipKind::OneToOne { owner: false },
                    target: owner_e.to_string(),
                    reverse: owner.name.clone(),
                    fk_columns: cols,
                    key_columns: key_cols(other_key),
                },
                columns: Vec::new(),
                column_types: Vec::new(),
                cascade: cascade_default(other, owner),
                optimistic: false,
            };
            Ok(if a_owns {
                (owner_res, other_res)
            } else {
                (other_res, owner_res)
            })
        }
        _ => Err(invalid(format!(
            "'{}.{}' cannot pair with '{}.{}'",
            ea, a.name, eb, b.name
        ))),
    }
}

fn assemble(
    defs: &IndexMap<String, EntityDef>,
    chain: &[String],
    name: &str,
) -> Result<EntityInfo> {
    let root_def = &defs[chain[0].as_str()];
    let def = &defs[name];
    let table = root_def.table.clone().unwrap_or_else(|| root_def.name.clone());
    if let Some(own) = &def.table {
        if def.base.is_some() && *own != table {
            return Err(inheritance_error(format!(
                "subclass '{name}' is stored in '{table}' and cannot name table '{own}'"
            )));
        }
    }

    let attrs: Vec<Attribute> = visible_attrs(defs, chain).map(|(_, _, a)| a.clone()).collect();
    let pk = attrs
        .iter()
        .enumerate()
        .filter(|(_, a)| a.kind == AttrKind::PrimaryKey)
        .map(|(i, _)| i)
        .collect();

    let discriminator = match attrs.iter().position(|a| a.kind == AttrKind::Discriminator) {
        Some(index) => {
            let sql_type = attrs[index].column_types[0].clone();
            let raw = def
                .discriminator_value
                .clone()
                .unwrap_or_else(|| Value::Text(name.to_string()));
            let value = raw.coerce(&sql_type).map_err(|_| {
                inheritance_error(format!(
                    "discriminator value of '{name}' does not fit {}",
                    sql_type.sql_name()
                ))
            })?;
            Some((index, value))
        }
        None => None,
    };

    let children = defs
        .values()
        .filter(|d| d.base.as_deref() == Some(name))
        .map(|d| d.name.clone())
        .collect();

    Ok(EntityInfo {
        name: name.to_string(),
        table,
        root: chain[0].clone(),
        base: def.base.clone(),
        children,
        attrs,
        pk,
        discriminator,
    })
}

fn check_hierarchy_columns(entities: &IndexMap<String, EntityInfo>) -> Result<()> {
    let mut by_root: HashMap<&str, Vec<&EntityInfo>> = HashMap::new();
    for info in entities.values() {
        by_root.entry(info.root.as_str()).or_default().push(info);
    }
    for (root, members) in by_root {
        let mut attrs: HashMap<&str, &str> = HashMap::new();
        let mut columns: HashMap<&str, &str> = HashMap::new();
        let mut values: Vec<(&Value, &str)> = Vec::new();
        for info in &members {
            for attr in info.attrs.iter().filter(|a| a.declared_in == info.name) {
                if let Some(other) = attrs.insert(attr.name.as_str(), info.name.as_str()) {
                    return Err(inheritance_error(format!(
                        "attribute '{}' is declared by both '{}' and '{}' in hierarchy '{}'",
                        attr.name, other, info.name, root
                    )));
                }
                for column in &attr.columns {
                    if let Some(other) = columns.insert(column.as_str(), attr.name.as_str()) {
                        return Err(invalid(format!(
                            "column '{}' of table '{}' is used by '{}' and '{}'",
                            column, info.table, other, attr.name
                        )));
                    }
                }
            }
            if let Some((_, value)) = &info.discriminator {
                if let Some((_, other)) = values.iter().find(|(v, _)| v.key_eq(value)) {
                    return Err(inheritance_error(format!(
                        "'{}' and '{}' share a discriminator value",
                        other, info.name
                    )));
                }
                values.push((value, info.name.as_str()));
            }
        }
    }
    Ok(())
}

impl Schema {
    /// Start declaring a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// All entities in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityInfo> {
        self.entities.values()
    }

    /// Look up an entity.
    #[allow(clippy::result_large_err)]
    pub fn entity(&self, name: &str) -> Result<&EntityInfo> {
        self.entities.get(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("unknown entity '{name}'"),
            )
        })
    }

    /// Root of the hierarchy `name` belongs to.
    #[allow(clippy::result_large_err)]
    pub fn root_of(&self, name: &str) -> Result<&EntityInfo> {
        let entity = self.entity(name)?;
        self.entity(&entity.root)
    }

    /// Attributes of an entity, inherited ones first.
    #[allow(clippy::result_large_err)]
    pub fn attributes(&self, name: &str) -> Result<&[Attribute]> {
        Ok(self.entity(name)?.attributes())
    }

    /// Look up an attribute.
    #[allow(clippy::result_large_err)]
    pub fn attribute(&self, entity: &str, attr: &str) -> Result<&Attribute> {
        self.entity(entity)?.attr(attr).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownAttribute,
                format!("entity '{entity}' has no attribute '{attr}'"),
            )
        })
    }

    /// Resolved relationship of a relationship attribute.
    #[allow(clippy::result_large_err)]
    pub fn relation(&self, entity: &str, attr: &str) -> Result<&RelationshipInfo> {
        self.attribute(entity, attr)?.relation().ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::Relationship,
                format!("'{entity}.{attr}' is not a relationship"),
            )
        })
    }

    /// Whether `entity` is `ancestor` or inherits from it.
    pub fn is_subclass_of(&self, entity: &str, ancestor: &str) -> bool {
        let mut current = self.entities.get(entity);
        while let Some(info) = current {
            if info.name == ancestor {
                return true;
            }
            current = info.base.as_deref().and_then(|b| self.entities.get(b));
        }
        false
    }

    /// All subclasses of `name`, transitively, excluding `name`.
    pub fn descendants(&self, name: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut stack = vec![name];
        while let Some(current) = stack.pop() {
            if let Some(info) = self.entities.get(current) {
                for child in &info.children {
                    out.push(child.as_str());
                    stack.push(child.as_str());
                }
            }
        }
        out
    }

    /// Discriminator values selecting `name` and its subclasses.
    ///
    /// Empty when the hierarchy has no discriminator.
    pub fn discriminator_values(&self, name: &str) -> Vec<Value> {
        std::iter::once(name)
            .chain(self.descendants(name))
            .filter_map(|e| self.entities.get(e))
            .filter_map(|info| info.discriminator.as_ref().map(|(_, v)| v.clone()))
            .collect()
    }

    /// Concrete entity stored with `value` in the discriminator column of `root`'s table.
    pub fn entity_for_discriminator(&self, root: &str, value: &Value) -> Option<&EntityInfo> {
        self.entities.values().find(|info| {
            info.root == root
                && info
                    .discriminator
                    .as_ref()
                    .is_some_and(|(_, v)| v.key_eq(value))
        })
    }

    /// Attributes stored in the table of `name`'s hierarchy: the root's, then
    /// every subclass's own attributes.
    #[allow(clippy::result_large_err)]
    pub fn table_attributes(&self, name: &str) -> Result<Vec<&Attribute>> {
        let root = self.root_of(name)?;
        let mut out: Vec<&Attribute> = root.attributes().iter().collect();
        for sub in self.descendants(&root.name) {
            let info = self.entity(sub)?;
            out.extend(info.attrs.iter().filter(|a| a.declared_in == info.name));
        }
        Ok(out)
    }

    /// Columns of the table storing `name`.
    #[allow(clippy::result_large_err)]
    pub fn columns(&self, name: &str) -> Result<Vec<ColumnDef>> {
        let root = self.root_of(name)?;
        let mut out = Vec::new();
        for attr in self.table_attributes(name)? {
            let subclass_column = attr.declared_in != root.name;
            let references = attr
                .relation()
                .filter(|r| r.holds_fk())
                .map(|r| -> Result<Vec<(String, String)>> {
                    let target = self.entity(&r.target)?;
                    Ok(r.key_columns
                        .iter()
                        .map(|c| (target.table.clone(), c.clone()))
                        .collect())
                })
                .transpose()?;
            for (i, (column, sql_type)) in attr.columns.iter().zip(&attr.column_types).enumerate() {
                out.push(ColumnDef {
                    name: column.clone(),
                    sql_type: sql_type.clone(),
                    nullable: attr.kind == AttrKind::Optional || subclass_column,
                    primary_key: attr.kind == AttrKind::PrimaryKey,
                    auto_increment: attr.auto,
                    unique: attr.unique,
                    attr: attr.name.clone(),
                    entity: attr.declared_in.clone(),
                    references: references.as_ref().and_then(|r| r.get(i).cloned()),
                });
            }
        }
        Ok(out)
    }

    /// Link tables of all many-to-many relationships.
    pub fn link_tables(&self) -> &[LinkTableInfo] {
        &self.link_tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> SchemaBuilder {
        Schema::builder()
            .entity(
                EntityDef::new("Person")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required("name", SqlType::Text))
                    .attr(Attribute::required("age", SqlType::Integer))
                    .attr(Attribute::set("cars", "Car")),
            )
            .entity(
                EntityDef::new("Car")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required("make", SqlType::Text))
                    .attr(Attribute::required_ref("owner", "Person")),
            )
    }

    #[test]
    fn resolves_one_to_many_pair() {
        let schema = people().build().unwrap();
        let owner = schema.relation("Car", "owner").unwrap();
        assert_eq!(owner.kind, RelationshipKind::ManyToOne);
        assert_eq!(owner.fk_columns, vec!["owner".to_string()]);
        assert!(owner.holds_fk());

        let cars = schema.attribute("Person", "cars").unwrap();
        assert_eq!(cars.reverse_name(), Some("owner"));
        assert_eq!(cars.relation().unwrap().kind, RelationshipKind::OneToMany);
        // reverse is required, so deleting a person deletes their cars
        assert!(cars.cascades_delete());
        assert!(!schema.attribute("Car", "owner").unwrap().cascades_delete());
    }

    #[test]
    fn optimistic_defaults() {
        let schema = Schema::builder()
            .entity(
                EntityDef::new("Item")
                    .attr(Attribute::primary_key("id", SqlType::Integer))
                    .attr(Attribute::required("price", SqlType::Double))
                    .attr(Attribute::optional("meta", SqlType::Json))
                    .attr(Attribute::required("title", SqlType::Text))
                    .attr(Attribute::required("stock", SqlType::Integer).optimistic(false)),
            )
            .build()
            .unwrap();
        let opt = |a: &str| schema.attribute("Item", a).unwrap().is_optimistic();
        assert!(!opt("id"));
        assert!(!opt("price"));
        assert!(!opt("meta"));
        assert!(opt("title"));
        assert!(!opt("stock"));
    }

    #[test]
    fn many_to_many_link_table_naming() {
        let schema = Schema::builder()
            .entity(
                EntityDef::new("Student")
                    .attr(Attribute::primary_key("id", SqlType::BigInt))
                    .attr(Attribute::set("courses", "Course")),
            )
            .entity(
                EntityDef::new("Course")
                    .attr(Attribute::primary_key("name", SqlType::Text))
                    .attr(Attribute::primary_key("semester", SqlType::Integer))
                    .attr(Attribute::set("students", "Student")),
            )
            .build()
            .unwrap();
        let link = schema.relation("Student", "courses").unwrap().link().unwrap().clone();
        assert_eq!(link.table, "Course_Student");
        assert_eq!(link.local_columns, vec!["student".to_string()]);
        assert_eq!(
            link.remote_columns,
            vec!["course_name".to_string(), "course_semester".to_string()]
        );
        let back = schema.relation("Course", "students").unwrap().link().unwrap().clone();
        assert_eq!(back, link.flipped());
        assert_eq!(schema.link_tables().len(), 1);
    }

    #[test]
    fn composite_key_reference_columns() {
        let schema = Schema::builder()
            .entity(
                EntityDef::new("Course")
                    .attr(Attribute::primary_key("name", SqlType::Text))
                    .attr(Attribute::primary_key("semester", SqlType::Integer))
                    .attr(Attribute::set("lessons", "Lesson")),
            )
            .entity(
                EntityDef::new("Lesson")
                    .attr(Attribute::primary_key("id", SqlType::BigInt))
                    .attr(Attribute::optional_ref("course", "Course")),
            )
            .build()
            .unwrap();
        let course = schema.attribute("Lesson", "course").unwrap();
        assert_eq!(
            course.column_names(),
            &["course_name".to_string(), "course_semester".to_string()]
        );
        assert_eq!(course.column_types(), &[SqlType::Text, SqlType::Integer]);
        // optional reverse: no cascade
        assert!(!schema.attribute("Course", "lessons").unwrap().cascades_delete());
    }

    #[test]
    fn inheritance_gets_implicit_discriminator() {
        let schema = Schema::builder()
            .entity(
                EntityDef::new("Person")
                    .attr(Attribute::primary_key("id", SqlType::BigInt).auto())
                    .attr(Attribute::required("name", SqlType::Text)),
            )
            .entity(
                EntityDef::new("Student")
                    .base("Person")
                    .attr(Attribute::required("gpa", SqlType::Double)),
            )
            .entity(
                EntityDef::new("Lecturer")
                    .base("Person")
                    .discriminator_value("T")
                    .attr(Attribute::optional("degree", SqlType::Text)),
            )
            .build()
            .unwrap();
        let student = schema.entity("Student").unwrap();
        assert_eq!(student.table(), "Person");
        assert_eq!(student.root(), "Person");
        let (disc, value) = student.discriminator().unwrap();
        assert_eq!(disc.name(), IMPLICIT_DISCRIMINATOR);
        assert_eq!(value, &Value::Text("Student".into()));
        assert!(schema.is_subclass_of("Student", "Person"));
        assert!(!schema.is_subclass_of("Person", "Student"));
        assert_eq!(schema.descendants("Person").len(), 2);
        assert_eq!(schema.discriminator_values("Lecturer"), vec![Value::Text("T".into())]);
        assert_eq!(
            schema
                .entity_for_discriminator("Person", &Value::Text("T".into()))
                .map(EntityInfo::name),
            Some("Lecturer")
        );

        let columns = schema.columns("Student").unwrap();
        let gpa = columns.iter().find(|c| c.name == "gpa").unwrap();
        assert!(gpa.nullable);
        assert!(columns.iter().any(|c| c.name == "degree"));
        // inherited attributes come first
        assert_eq!(schema.attributes("Student").unwrap()[0].name(), "id");
    }

    #[test]
    fn rejects_invalid_declarations() {
        let missing_reverse = Schema::builder()
            .entity(
                EntityDef::new("A")
                    .attr(Attribute::primary_key("id", SqlType::Integer))
                    .attr(Attribute::optional_ref("b", "B")),
            )
            .entity(EntityDef::new("B").attr(Attribute::primary_key("id", SqlType::Integer)))
            .build();
        assert!(matches!(missing_reverse, Err(Error::Schema(e)) if e.kind == SchemaErrorKind::Relationship));

        let bad_name = Schema::builder()
            .entity(EntityDef::new("Bad Name").attr(Attribute::primary_key("id", SqlType::Integer)))
            .build();
        assert!(matches!(bad_name, Err(Error::Schema(e)) if e.kind == SchemaErrorKind::Invalid));

        let no_pk = Schema::builder()
            .entity(EntityDef::new("A").attr(Attribute::required("x", SqlType::Integer)))
            .build();
        assert!(no_pk.is_err());

        let sub_pk = Schema::builder()
            .entity(EntityDef::new("A").attr(Attribute::primary_key("id", SqlType::Integer)))
            .entity(
                EntityDef::new("B")
                    .base("A")
                    .attr(Attribute::primary_key("id2", SqlType::Integer)),
            )
            .build();
        assert!(matches!(sub_pk, Err(Error::Schema(e)) if e.kind == SchemaErrorKind::Inheritance));

        let both_required = Schema::builder()
            .entity(
                EntityDef::new("A")
                    .attr(Attribute::primary_key("id", SqlType::Integer))
                    .attr(Attribute::required_ref("b", "B")),
            )
            .entity(
                EntityDef::new("B")
                    .attr(Attribute::primary_key("id", SqlType::Integer))
                    .attr(Attribute::required_ref("a", "A")),
            )
            .build();
        assert!(both_required.is_err());
    }

    #[test]
    fn one_to_one_owner_is_required_side() {
        let schema = Schema::builder()
            .entity(
                EntityDef::new("Person")
                    .attr(Attribute::primary_key("id", SqlType::BigInt))
                    .attr(Attribute::optional_ref("passport", "Passport")),
            )
            .entity(
                EntityDef::new("Passport")
                    .attr(Attribute::primary_key("id", SqlType::BigInt))
                    .attr(Attribute::required_ref("person", "Person")),
            )
            .build()
            .unwrap();
        let person = schema.relation("Passport", "person").unwrap();
        assert_eq!(person.kind, RelationshipKind::OneToOne { owner: true });
        let passport = schema.attribute("Person", "passport").unwrap();
        assert!(passport.column_names().is_empty());
        // reverse is required: deleting the person deletes the passport
        assert!(passport.cascades_delete());
    }
}
