//! Permission rules for packets.
//!
//! A rule grants operations on entities to a subject: a user group, a role
//! the user holds towards an object, or a label carried by an object. Rules
//! may also exclude attributes. An attribute is visible when at least one
//! rule applies and none of the applicable rules excludes it. Attributes
//! declared `hidden` are never visible.

use corral_core::{Attribute, Error, Result, Schema};
use corral_session::Entity;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Group every user belongs to.
pub const ANYBODY: &str = "anybody";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Permission {
    View,
    Edit,
    Create,
    Delete,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::View => "view",
            Permission::Edit => "edit",
            Permission::Create => "create",
            Permission::Delete => "delete",
        }
    }

    /// Parse a whitespace separated list such as `"view edit"`. `"*"` grants
    /// every permission.
    #[allow(clippy::result_large_err)]
    pub fn parse_list(text: &str) -> Result<Vec<Permission>> {
        let mut out = Vec::new();
        for word in text.split_whitespace() {
            match word {
                "view" => out.push(Permission::View),
                "edit" => out.push(Permission::Edit),
                "create" => out.push(Permission::Create),
                "delete" => out.push(Permission::Delete),
                "*" => out.extend([
                    Permission::View,
                    Permission::Edit,
                    Permission::Create,
                    Permission::Delete,
                ]),
                other => {
                    return Err(Error::malformed(format!("unknown permission '{other}'")));
                }
            }
        }
        Ok(out)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Group(String),
    /// A role the user holds towards the object
    Role(String),
    /// A label the object carries
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub entities: Vec<String>,
    pub permissions: BTreeSet<Permission>,
    pub subject: Subject,
    /// Attributes this rule keeps out of reach
    pub exclude: Vec<String>,
}

impl Rule {
    /// Grant `permissions` on `entities` (and their subclasses) to anybody.
    pub fn new<I, S>(permissions: impl IntoIterator<Item = Permission>, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entities: entities.into_iter().map(Into::into).collect(),
            permissions: permissions.into_iter().collect(),
            subject: Subject::Group(ANYBODY.to_string()),
            exclude: Vec::new(),
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.subject = Subject::Group(group.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.subject = Subject::Role(role.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.subject = Subject::Label(label.into());
        self
    }

    pub fn exclude<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = attrs.into_iter().map(Into::into).collect();
        self
    }
}

/// An ordered set of rules.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    rules: Vec<Rule>,
}

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Check that every rule names existing entities, and that each
    /// excluded attribute exists on at least one of the rule's entities.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        for rule in &self.rules {
            let infos = rule
                .entities
                .iter()
                .map(|entity| schema.entity(entity))
                .collect::<Result<Vec<_>>>()?;
            for attr in &rule.exclude {
                if !infos.iter().any(|info| info.attr(attr).is_some()) {
                    return Err(Error::malformed(format!(
                        "permission rule excludes '{attr}', which none of {} has",
                        rule.entities.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

type Provider = Box<dyn Fn(&Entity) -> Result<Vec<String>>>;

/// The current user as the permission checks see it.
pub struct PermissionContext {
    permissions: Arc<Permissions>,
    groups: BTreeSet<String>,
    roles: Option<Provider>,
    labels: Option<Provider>,
    seen_roles: RefCell<HashMap<Entity, Vec<String>>>,
    seen_labels: RefCell<HashMap<Entity, Vec<String>>>,
}

impl std::fmt::Debug for PermissionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionContext")
            .field("rules", &self.permissions.rules.len())
            .field("groups", &self.groups)
            .field("roles", &self.roles.is_some())
            .field("labels", &self.labels.is_some())
            .finish()
    }
}

impl PermissionContext {
    pub fn new(permissions: Arc<Permissions>) -> Self {
        Self {
            permissions,
            groups: BTreeSet::from([ANYBODY.to_string()]),
            roles: None,
            labels: None,
            seen_roles: RefCell::new(HashMap::new()),
            seen_labels: RefCell::new(HashMap::new()),
        }
    }

    /// Groups of the current user, in addition to `anybody`.
    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Roles the current user holds towards an object.
    pub fn roles(mut self, provider: impl Fn(&Entity) -> Result<Vec<String>> + 'static) -> Self {
        self.roles = Some(Box::new(provider));
        self
    }

    /// Labels an object carries.
    pub fn labels(mut self, provider: impl Fn(&Entity) -> Result<Vec<String>> + 'static) -> Self {
        self.labels = Some(Box::new(provider));
        self
    }

    #[allow(clippy::result_large_err)]
    fn provided(
        provider: Option<&Provider>,
        seen: &RefCell<HashMap<Entity, Vec<String>>>,
        object: &Entity,
        wanted: &str,
    ) -> Result<bool> {
        let Some(provider) = provider else {
            return Ok(false);
        };
        if let Some(known) = seen.borrow().get(object) {
            return Ok(known.iter().any(|v| v == wanted));
        }
        let values = provider(object)?;
        let found = values.iter().any(|v| v == wanted);
        seen.borrow_mut().insert(object.clone(), values);
        Ok(found)
    }

    /// Rules granting `permission` on `object` to the current user.
    #[allow(clippy::result_large_err)]
    fn applicable(
        &self,
        schema: &Schema,
        object: &Entity,
        permission: Permission,
    ) -> Result<Vec<&Rule>> {
        let entity = object.entity_name()?;
        let mut out = Vec::new();
        for rule in &self.permissions.rules {
            if !rule.permissions.contains(&permission)
                || !rule.entities.iter().any(|e| schema.is_subclass_of(&entity, e))
            {
                continue;
            }
            let holds = match &rule.subject {
                Subject::Group(group) => self.groups.contains(group),
                Subject::Role(role) => {
                    Self::provided(self.roles.as_ref(), &self.seen_roles, object, role)?
                }
                Subject::Label(label) => {
                    Self::provided(self.labels.as_ref(), &self.seen_labels, object, label)?
                }
            };
            if holds {
                out.push(rule);
            }
        }
        Ok(out)
    }

    /// Whether the current user may perform `permission` on `object`.
    #[allow(clippy::result_large_err)]
    pub fn can(&self, schema: &Schema, object: &Entity, permission: Permission) -> Result<bool> {
        Ok(!self.applicable(schema, object, permission)?.is_empty())
    }

    /// Whether the current user may perform `permission` on one attribute.
    #[allow(clippy::result_large_err)]
    pub fn can_attr(
        &self,
        schema: &Schema,
        object: &Entity,
        attr: &Attribute,
        permission: Permission,
    ) -> Result<bool> {
        if attr.is_hidden() {
            return Ok(false);
        }
        let rules = self.applicable(schema, object, permission)?;
        Ok(!rules.is_empty() && rules.iter().all(|r| !r.exclude.iter().any(|e| e == attr.name())))
    }

    #[allow(clippy::result_large_err)]
    pub fn require(&self, schema: &Schema, object: &Entity, permission: Permission) -> Result<()> {
        if self.can(schema, object, permission)? {
            Ok(())
        } else {
            Err(Error::permission(object.entity_name()?, None, permission.as_str()))
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn require_attr(
        &self,
        schema: &Schema,
        object: &Entity,
        attr: &Attribute,
        permission: Permission,
    ) -> Result<()> {
        if self.can_attr(schema, object, attr, permission)? {
            Ok(())
        } else {
            Err(Error::permission(
                object.entity_name()?,
                Some(attr.name()),
                permission.as_str(),
            ))
        }
    }
}

/// Attribute check that also applies without a context: only `hidden`
/// attributes are refused then.
#[allow(clippy::result_large_err)]
pub(crate) fn attr_allowed(
    context: Option<&PermissionContext>,
    schema: &Schema,
    object: &Entity,
    attr: &Attribute,
    permission: Permission,
) -> Result<bool> {
    match context {
        Some(context) => context.can_attr(schema, object, attr, permission),
        None => Ok(!attr.is_hidden()),
    }
}

#[allow(clippy::result_large_err)]
pub(crate) fn require(
    context: Option<&PermissionContext>,
    schema: &Schema,
    object: &Entity,
    permission: Permission,
) -> Result<()> {
    match context {
        Some(context) => context.require(schema, object, permission),
        None => Ok(()),
    }
}
