//! Relationship maintenance and deletion.
//!
//! Both sides of a relationship are kept in step in memory: assigning a
//! to-one attribute updates the reverse attribute or the loaded reverse
//! collection, and many-to-many edits record link rows for the next flush.
//! Every check runs before the first mutation, so a failed operation leaves
//! the session unchanged.

use crate::change_tracker::Field;
use crate::identity_map::ObjId;
use crate::{LinkChange, SessionInner, expired};
use corral_core::error::SchemaErrorKind;
use corral_core::{
    AttrKind, Attribute, Error, RelationshipKind, Result, ValidationError, ValidationErrorKind,
};
use indexmap::{IndexMap, IndexSet};
use tracing::debug;

/// A validated change of a to-one attribute.
#[derive(Debug)]
pub(crate) struct RefPlan {
    attr: String,
    tracked: bool,
    old: Option<ObjId>,
    new: Option<ObjId>,
    reverse: String,
    reverse_tracked: bool,
    reverse_is_set: bool,
    /// Previous partner of `new` in a one-to-one, which loses it
    displaced: Option<ObjId>,
}

pub(crate) fn not_a(kind: &str, attr: &Attribute) -> Error {
    Error::schema(
        SchemaErrorKind::Relationship,
        format!("'{}.{}' is not {kind}", attr.declared_in(), attr.name()),
    )
}

fn record(links: &mut IndexMap<LinkChange, bool>, change: LinkChange, add: bool) {
    match links.get(&change) {
        // An add and a remove of the same row cancel out.
        Some(&pending) if pending != add => {
            links.shift_remove(&change);
        }
        _ => {
            links.insert(change, add);
        }
    }
}

impl SessionInner {
    fn describe(&self, id: ObjId) -> String {
        self.instance(id, |i| match &i.key {
            Some(key) => key.to_string(),
            None => format!("new {} object", i.entity),
        })
        .unwrap_or_default()
    }

    #[allow(clippy::result_large_err)]
    fn check_target(&self, attr: &Attribute, target: ObjId) -> Result<()> {
        self.check_live(target)?;
        let Some(rel) = attr.relation() else {
            return Err(not_a("a relationship", attr));
        };
        let actual = self.entity_of(target)?;
        if !self.schema.is_subclass_of(&actual, &rel.target) {
            let mut errors = ValidationError::new(attr.declared_in());
            errors.add(
                attr.name(),
                ValidationErrorKind::Type,
                format!("expects a {} object, got {actual}", rel.target),
            );
            return Err(errors.into());
        }
        Ok(())
    }

    /// Validate assigning `new` to the to-one `attr` of `id`.
    ///
    /// `id` is `None` while the owning object is being created.
    #[allow(clippy::result_large_err)]
    pub(crate) fn plan_ref(
        &self,
        id: Option<ObjId>,
        attr: &Attribute,
        old: Option<ObjId>,
        new: Option<ObjId>,
    ) -> Result<RefPlan> {
        let rel = attr
            .relation()
            .filter(|r| r.is_to_one())
            .ok_or_else(|| not_a("a to-one relationship", attr))?;
        if new.is_none() && attr.kind() == AttrKind::Required {
            let mut errors = ValidationError::new(attr.declared_in());
            errors.add(attr.name(), ValidationErrorKind::Required, "is required");
            return Err(errors.into());
        }
        if let Some(target) = new {
            self.check_target(attr, target)?;
        }

        let reverse = self.schema.attribute(&rel.target, &rel.reverse)?;
        let reverse_is_set = reverse.is_collection();
        let mut displaced = None;
        if !reverse_is_set {
            if let Some(target) = new {
                displaced = self.current_ref(target, reverse)?.filter(|p| Some(*p) != id);
            }
            if let Some(partner) = displaced {
                if attr.kind() == AttrKind::Required {
                    return Err(Error::constraint(
                        self.entity_of(partner)?,
                        self.key_of(partner)?,
                        Some(attr.name()),
                        format!(
                            "{} would lose its required '{}'",
                            self.describe(partner),
                            attr.name()
                        ),
                    ));
                }
            }
            if let Some(partner) = old {
                if reverse.kind() == AttrKind::Required {
                    return Err(Error::constraint(
                        self.entity_of(partner)?,
                        self.key_of(partner)?,
                        Some(reverse.name()),
                        format!(
                            "{} would lose its required '{}'",
                            self.describe(partner),
                            reverse.name()
                        ),
                    ));
                }
            }
        }

        Ok(RefPlan {
            attr: attr.name().to_string(),
            tracked: !attr.column_names().is_empty(),
            old,
            new,
            reverse: reverse.name().to_string(),
            reverse_tracked: !reverse.column_names().is_empty(),
            reverse_is_set,
            displaced,
        })
    }

    /// Carry out a planned to-one change on both sides.
    #[allow(clippy::result_large_err)]
    pub(crate) fn apply_ref(&self, id: ObjId, plan: RefPlan) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let map = &mut state.map;
        if plan.reverse_is_set {
            if let Some(old) = plan.old.and_then(|o| map.get_mut(o)) {
                if let Some(members) = old.collections.get_mut(&plan.reverse) {
                    members.ids.shift_remove(&id);
                }
            }
            if let Some(new) = plan.new.and_then(|n| map.get_mut(n)) {
                if let Some(members) = new.collections.get_mut(&plan.reverse).filter(|m| m.loaded) {
                    members.ids.insert(id);
                }
            }
        } else {
            if let Some(partner) = plan.displaced.and_then(|p| map.get_mut(p)) {
                partner.assign(&plan.attr, Field::Ref(None), plan.tracked);
            }
            if let Some(old) = plan.old.and_then(|o| map.get_mut(o)) {
                old.assign(&plan.reverse, Field::Ref(None), plan.reverse_tracked);
            }
            if let Some(new) = plan.new.and_then(|n| map.get_mut(n)) {
                new.assign(&plan.reverse, Field::Ref(Some(id)), plan.reverse_tracked);
            }
        }
        map.get_mut(id)
            .ok_or_else(expired)?
            .assign(&plan.attr, Field::Ref(plan.new), plan.tracked);
        Ok(())
    }

    /// Assign a to-one attribute, keeping the reverse side in step.
    #[allow(clippy::result_large_err)]
    pub(crate) fn set_ref(&self, id: ObjId, attr: &Attribute, new: Option<ObjId>) -> Result<()> {
        self.check_live(id)?;
        let old = self.current_ref(id, attr)?;
        if old == new {
            self.instance_mut(id, |i| i.mark_read(attr.name()))?;
            return Ok(());
        }
        let plan = self.plan_ref(Some(id), attr, old, new)?;
        debug!(attr = attr.name(), ?old, ?new, "Assigning reference");
        self.apply_ref(id, plan)
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Link row for `owner.attr` containing `member`, oriented like the
    /// schema's link table.
    #[allow(clippy::result_large_err)]
    fn link_change(&self, attr: &Attribute, owner: ObjId, member: ObjId) -> Result<LinkChange> {
        let link = attr
            .relation()
            .and_then(|r| r.link())
            .ok_or_else(|| not_a("a many-to-many relationship", attr))?;
        let forward = self
            .schema
            .link_tables()
            .iter()
            .find(|l| l.table == link.table)
            .is_none_or(|l| l.local_columns == link.local_columns);
        let (local, remote) = if forward { (owner, member) } else { (member, owner) };
        Ok(LinkChange {
            table: link.table.clone(),
            local,
            remote,
        })
    }

    /// Unflushed link edits of `id.attr`, as `(member, added)`.
    #[allow(clippy::result_large_err)]
    pub(crate) fn pending_links(&self, id: ObjId, attr: &Attribute) -> Result<Vec<(ObjId, bool)>> {
        let link = attr
            .relation()
            .and_then(|r| r.link())
            .ok_or_else(|| not_a("a many-to-many relationship", attr))?;
        let forward = self
            .schema
            .link_tables()
            .iter()
            .find(|l| l.table == link.table)
            .is_none_or(|l| l.local_columns == link.local_columns);
        let state = self.state.borrow();
        Ok(state
            .links
            .iter()
            .filter(|(c, _)| c.table == link.table)
            .filter_map(|(c, add)| {
                if forward && c.local == id {
                    Some((c.remote, *add))
                } else if !forward && c.remote == id {
                    Some((c.local, *add))
                } else {
                    None
                }
            })
            .collect())
    }

    /// Members of a collection, loading them when needed.
    #[allow(clippy::result_large_err)]
    pub(crate) fn members(&self, id: ObjId, attr: &Attribute) -> Result<Vec<ObjId>> {
        if !attr.is_collection() {
            return Err(not_a("a collection", attr));
        }
        self.ensure_members(id, attr)?;
        self.instance(id, |i| {
            i.loaded_members(attr.name())
                .map(|m| m.iter().copied().collect())
                .unwrap_or_default()
        })
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn add_member(&self, id: ObjId, attr: &Attribute, member: ObjId) -> Result<()> {
        self.check_live(id)?;
        let rel = attr.relation().ok_or_else(|| not_a("a collection", attr))?;
        self.check_target(attr, member)?;
        match &rel.kind {
            RelationshipKind::OneToMany => {
                let reverse = self.schema.attribute(&rel.target, &rel.reverse)?;
                self.set_ref(member, reverse, Some(id))
            }
            RelationshipKind::ManyToMany { .. } => {
                self.ensure_members(id, attr)?;
                let present = self.instance(id, |i| {
                    i.loaded_members(attr.name())
                        .is_some_and(|m| m.contains(&member))
                })?;
                if present {
                    return Ok(());
                }
                let change = self.link_change(attr, id, member)?;
                let mut state = self.state.borrow_mut();
                record(&mut state.links, change, true);
                if let Some(owner) = state.map.get_mut(id) {
                    owner.members_mut(attr.name()).ids.insert(member);
                }
                if let Some(other) = state.map.get_mut(member) {
                    if let Some(members) = other.collections.get_mut(&rel.reverse).filter(|m| m.loaded) {
                        members.ids.insert(id);
                    }
                }
                Ok(())
            }
            _ => Err(not_a("a collection", attr)),
        }
    }

    #[allow(clippy::result_large_err)]
    fn check_removable(&self, attr: &Attribute, member: ObjId) -> Result<()> {
        let Some(rel) = attr.relation() else {
            return Err(not_a("a collection", attr));
        };
        if matches!(rel.kind, RelationshipKind::OneToMany) {
            let reverse = self.schema.attribute(&rel.target, &rel.reverse)?;
            if reverse.kind() == AttrKind::Required {
                return Err(Error::constraint(
                    self.entity_of(member)?,
                    self.key_of(member)?,
                    Some(reverse.name()),
                    format!(
                        "{} cannot be removed from '{}' because its '{}' is required",
                        self.describe(member),
                        attr.name(),
                        reverse.name()
                    ),
                ));
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn remove_member(&self, id: ObjId, attr: &Attribute, member: ObjId) -> Result<()> {
        self.check_live(id)?;
        let rel = attr.relation().ok_or_else(|| not_a("a collection", attr))?;
        match &rel.kind {
            RelationshipKind::OneToMany => {
                let reverse = self.schema.attribute(&rel.target, &rel.reverse)?;
                if self.current_ref(member, reverse)? != Some(id) {
                    return Ok(());
                }
                self.check_removable(attr, member)?;
                self.set_ref(member, reverse, None)
            }
            RelationshipKind::ManyToMany { .. } => {
                self.ensure_members(id, attr)?;
                let present = self.instance(id, |i| {
                    i.loaded_members(attr.name())
                        .is_some_and(|m| m.contains(&member))
                })?;
                if !present {
                    return Ok(());
                }
                let change = self.link_change(attr, id, member)?;
                let mut state = self.state.borrow_mut();
                record(&mut state.links, change, false);
                if let Some(owner) = state.map.get_mut(id) {
                    owner.members_mut(attr.name()).ids.shift_remove(&member);
                }
                if let Some(other) = state.map.get_mut(member) {
                    if let Some(members) = other.collections.get_mut(&rel.reverse) {
                        members.ids.shift_remove(&id);
                    }
                }
                Ok(())
            }
            _ => Err(not_a("a collection", attr)),
        }
    }

    /// Make the collection hold exactly `wanted`.
    #[allow(clippy::result_large_err)]
    pub(crate) fn replace_members(&self, id: ObjId, attr: &Attribute, wanted: &[ObjId]) -> Result<()> {
        let current = self.members(id, attr)?;
        let wanted_set: IndexSet<ObjId> = wanted.iter().copied().collect();
        let removed: Vec<ObjId> = current
            .iter()
            .copied()
            .filter(|m| !wanted_set.contains(m))
            .collect();
        for member in &removed {
            self.check_removable(attr, *member)?;
        }
        for member in &wanted_set {
            self.check_target(attr, *member)?;
        }
        for member in removed {
            self.remove_member(id, attr, member)?;
        }
        for member in wanted_set {
            self.add_member(id, attr, member)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Collect the objects a deletion removes and the references it clears.
    #[allow(clippy::result_large_err)]
    fn plan_delete(
        &self,
        id: ObjId,
        plan: &mut IndexSet<ObjId>,
        detach: &mut Vec<(ObjId, String)>,
    ) -> Result<()> {
        if !plan.insert(id) {
            return Ok(());
        }
        let loaded = self.instance(id, |i| i.loaded)?;
        if !loaded {
            self.load_row(id, false)?;
        }
        let entity = self.entity_of(id)?;
        let info = self.schema.entity(&entity)?;
        for attr in info.attributes() {
            let Some(rel) = attr.relation() else { continue };
            let dependents = match &rel.kind {
                RelationshipKind::OneToMany => self.members(id, attr)?,
                RelationshipKind::OneToOne { owner: false } => {
                    self.current_ref(id, attr)?.into_iter().collect()
                }
                RelationshipKind::ManyToMany { .. } => continue,
                _ => {
                    if attr.cascades_delete() {
                        if let Some(target) = self.current_ref(id, attr)? {
                            self.plan_delete(target, plan, detach)?;
                        }
                    }
                    continue;
                }
            };
            let reverse = self.schema.attribute(&rel.target, &rel.reverse)?;
            for dependent in dependents {
                if plan.contains(&dependent) {
                    continue;
                }
                if attr.cascades_delete() {
                    self.plan_delete(dependent, plan, detach)?;
                } else if reverse.kind() == AttrKind::Required {
                    return Err(Error::constraint(
                        &entity,
                        self.key_of(id)?,
                        Some(attr.name()),
                        format!(
                            "cannot delete {}: {} still refers to it through '{}'",
                            self.describe(id),
                            self.describe(dependent),
                            reverse.name()
                        ),
                    ));
                } else {
                    detach.push((dependent, reverse.name().to_string()));
                }
            }
        }
        Ok(())
    }

    /// Delete an object, cascading or detaching its dependents.
    #[allow(clippy::result_large_err)]
    pub(crate) fn delete(&self, id: ObjId) -> Result<()> {
        if self.instance(id, |i| i.status.is_deleted())? {
            return Ok(());
        }
        let mut plan = IndexSet::new();
        let mut detach = Vec::new();
        self.plan_delete(id, &mut plan, &mut detach)?;
        debug!(objects = plan.len(), detached = detach.len(), "Deleting");

        let mut state = self.state.borrow_mut();
        for (dependent, reverse) in &detach {
            if plan.contains(dependent) {
                continue;
            }
            if let Some(instance) = state.map.get_mut(*dependent) {
                instance.assign(reverse, Field::Ref(None), true);
            }
        }

        for other in state.map.ids() {
            let Some(instance) = state.map.get_mut(other) else { continue };
            for members in instance.collections.values_mut() {
                members.ids.retain(|m| !plan.contains(m));
            }
            if plan.contains(&other) {
                continue;
            }
            let entity = instance.entity.clone();
            for (name, field) in &mut instance.fields {
                let stale = matches!(field, Field::Ref(Some(t)) if plan.contains(t));
                let untracked = self
                    .schema
                    .attribute(&entity, name)
                    .is_ok_and(|a| a.column_names().is_empty());
                if stale && untracked {
                    *field = Field::Ref(None);
                }
            }
        }
        state
            .links
            .retain(|c, _| !plan.contains(&c.local) && !plan.contains(&c.remote));

        for target in &plan {
            let created = match state.map.get_mut(*target) {
                Some(instance) if instance.status == crate::Status::Created => {
                    instance.status = crate::Status::Cancelled;
                    true
                }
                Some(instance) => {
                    instance.status = crate::Status::MarkedToDelete;
                    false
                }
                None => false,
            };
            if created {
                state.map.forget_key(*target);
            }
        }
        Ok(())
    }
}
