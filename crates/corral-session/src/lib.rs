//! Identity-mapped sessions for corral.
//!
//! `corral-session` is the **unit-of-work layer**. A [`Session`] owns one
//! connection, keeps exactly one in-memory instance per stored row, records
//! every change made through [`Entity`] handles and writes the changes back
//! in dependency order on flush.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: loading the same row twice yields the same instance.
//! - **Change tracking**: assignments, collection edits and deletions are
//!   recorded until the next flush.
//! - **Optimistic checks**: UPDATEs and DELETEs are qualified by the values
//!   that were read, so concurrent writers are detected as conflicts.
//! - **Transactions**: in optimistic mode reads run in autocommit and the
//!   transaction starts at the first flush that writes; in strict mode every
//!   statement runs inside a transaction.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(schema, Box::new(SqliteConnection::open_memory()?));
//! session.scope(|s| {
//!     let ann = s.create("Person", vec![("name", "Ann".into()), ("age", 30.into())])?;
//!     s.create("Car", vec![("make", "Toyota".into()), ("owner", (&ann).into())])?;
//!     Ok(())
//! })?;
//! ```

pub mod change_tracker;
mod entity;
mod fetch;
pub mod flush;
pub mod identity_map;
mod relations;

pub use change_tracker::Status;
pub use entity::{AttrValue, Entity, Item, ToJsonOptions};
pub use flush::FlushResult;
pub use identity_map::{ObjId, ObjectKey};

use change_tracker::{Field, Instance};
use corral_core::error::SessionErrorKind;
use corral_core::{
    AttrKind, BeginOptions, Connection, Error, IsolationLevel, Result, Row, Schema, Value,
    ValidationError, ValidationErrorKind,
};
use corral_query::{Query, RawSql, Source, TranslationCache};
use identity_map::IdentityMap;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Configuration
// ============================================================================

/// When a session opens its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Reads run in autocommit; the transaction starts at the first flush
    /// that writes or the first locking read.
    #[default]
    Optimistic,
    /// Every statement runs inside a transaction.
    Strict,
}

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: TransactionMode,
    /// Flush pending changes before queries that could observe them.
    pub auto_flush: bool,
    /// Isolation requested when the transaction starts.
    pub isolation: Option<IsolationLevel>,
    /// Number of translated queries kept per session.
    pub cache_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: TransactionMode::Optimistic,
            auto_flush: true,
            isolation: None,
            cache_size: 256,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: TransactionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn auto_flush(mut self, enabled: bool) -> Self {
        self.auto_flush = enabled;
        self
    }

    pub fn isolation(mut self, level: Option<IsolationLevel>) -> Self {
        self.isolation = level;
        self
    }

    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }
}

/// Transaction lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Nothing has been written and no transaction is open
    NoTransaction,
    Active,
    /// The last transaction committed; the next write opens a new one
    Committed,
    RolledBack,
}

// ============================================================================
// Keys
// ============================================================================

/// Values usable as a primary key in [`Session::get`].
pub trait IntoKey {
    fn into_key(self) -> Vec<Value>;
}

impl IntoKey for Value {
    fn into_key(self) -> Vec<Value> {
        vec![self]
    }
}

impl IntoKey for i32 {
    fn into_key(self) -> Vec<Value> {
        vec![Value::Int(self)]
    }
}

impl IntoKey for i64 {
    fn into_key(self) -> Vec<Value> {
        vec![Value::BigInt(self)]
    }
}

impl IntoKey for &str {
    fn into_key(self) -> Vec<Value> {
        vec![Value::from(self)]
    }
}

impl IntoKey for String {
    fn into_key(self) -> Vec<Value> {
        vec![Value::Text(self)]
    }
}

impl IntoKey for Vec<Value> {
    fn into_key(self) -> Vec<Value> {
        self
    }
}

impl IntoKey for &[Value] {
    fn into_key(self) -> Vec<Value> {
        self.to_vec()
    }
}

impl<const N: usize> IntoKey for [Value; N] {
    fn into_key(self) -> Vec<Value> {
        self.into()
    }
}

// ============================================================================
// Session state
// ============================================================================

/// A pending link-table row change, oriented like the schema's link table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LinkChange {
    pub table: String,
    pub local: ObjId,
    pub remote: ObjId,
}

pub(crate) struct State {
    pub map: IdentityMap,
    /// Link rows to add (`true`) or remove (`false`), in the order requested
    pub links: IndexMap<LinkChange, bool>,
    pub cache: TranslationCache,
    /// Bumped when the session ends a transaction; older handles are expired
    pub epoch: u64,
    /// Nesting depth of [`Session::scope`]
    pub depth: usize,
    /// Open savepoints, innermost last
    pub savepoints: usize,
    pub tx: TransactionState,
    /// Whether the open transaction holds the write lock
    pub write_locked: bool,
}

impl State {
    fn has_changes(&self) -> bool {
        !self.links.is_empty() || self.map.iter().any(|(_, i)| i.is_modified())
    }
}

pub(crate) struct SessionInner {
    pub id: u64,
    pub schema: Arc<Schema>,
    pub conn: Box<dyn Connection>,
    pub config: SessionConfig,
    pub state: RefCell<State>,
}

pub(crate) fn expired() -> Error {
    Error::session(
        SessionErrorKind::Expired,
        "the session that loaded this object has ended",
    )
}

impl SessionInner {
    pub(crate) fn epoch(&self) -> u64 {
        self.state.borrow().epoch
    }

    pub(crate) fn handle(self: &Rc<Self>, id: ObjId) -> Entity {
        Entity::new(Rc::downgrade(self), self.id, self.epoch(), id)
    }

    pub(crate) fn instance<T>(&self, id: ObjId, f: impl FnOnce(&Instance) -> T) -> Result<T> {
        let state = self.state.borrow();
        state.map.get(id).map(f).ok_or_else(expired)
    }

    pub(crate) fn instance_mut<T>(
        &self,
        id: ObjId,
        f: impl FnOnce(&mut Instance) -> T,
    ) -> Result<T> {
        let mut state = self.state.borrow_mut();
        state.map.get_mut(id).map(f).ok_or_else(expired)
    }

    /// Concrete entity of an instance.
    pub(crate) fn entity_of(&self, id: ObjId) -> Result<String> {
        self.instance(id, |i| i.entity.clone())
    }

    /// Key values of an instance; empty until an auto key is assigned.
    pub(crate) fn key_of(&self, id: ObjId) -> Result<Vec<Value>> {
        self.instance(id, |i| {
            i.key.as_ref().map(|k| k.values().to_vec()).unwrap_or_default()
        })
    }

    /// Fail when the instance is deleted or about to be.
    pub(crate) fn check_live(&self, id: ObjId) -> Result<()> {
        let (entity, status, key) = self.instance(id, |i| {
            (
                i.entity.clone(),
                i.status,
                i.key.as_ref().map(ToString::to_string),
            )
        })?;
        if status.is_deleted() {
            return Err(Error::session(
                SessionErrorKind::ObjectDeleted,
                format!(
                    "{} was deleted",
                    key.unwrap_or_else(|| format!("new {entity} object"))
                ),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Open a transaction unless one is open. A `write` request inside a
    /// read transaction takes the write lock: server backends lock rows per
    /// statement, SQLite ends the read transaction and begins a write one.
    pub(crate) fn begin_if_needed(&self, write: bool, nowait: bool) -> Result<()> {
        if self.conn.in_transaction() {
            let (locked, savepoints) = {
                let state = self.state.borrow();
                (state.write_locked, state.savepoints)
            };
            if !write || locked {
                return Ok(());
            }
            if self.conn.dialect().supports_row_locks() || savepoints > 0 {
                self.state.borrow_mut().write_locked = true;
                return Ok(());
            }
            self.conn.commit()?;
            self.state.borrow_mut().tx = TransactionState::NoTransaction;
            debug!(session = self.id, "Read transaction ended to take the write lock");
        }
        let options = if write {
            BeginOptions::write()
        } else {
            BeginOptions::default()
        }
        .isolation(self.config.isolation)
        .nowait(nowait);
        self.conn.begin(&options)?;
        {
            let mut state = self.state.borrow_mut();
            state.tx = TransactionState::Active;
            state.write_locked = write;
        }
        debug!(session = self.id, write, "Transaction started");
        Ok(())
    }

    /// Run a read statement, opening a transaction first in strict mode.
    #[allow(clippy::result_large_err)]
    pub(crate) fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        if self.config.mode == TransactionMode::Strict {
            self.begin_if_needed(false, false)?;
        }
        debug!(session = self.id, sql, params = params.len(), "Executing query");
        self.conn.query(sql, params)
    }

    pub(crate) fn auto_flush(&self) -> Result<()> {
        if self.config.auto_flush {
            self.flush()?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(session = self.id))]
    pub(crate) fn flush(&self) -> Result<FlushResult> {
        if !self.state.borrow().has_changes() {
            return Ok(FlushResult::default());
        }
        self.begin_if_needed(true, false)?;
        let mut state = self.state.borrow_mut();
        let result = flush::flush(&self.schema, self.conn.as_ref(), &mut state)?;
        info!(
            session = self.id,
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            links_added = result.links_added,
            links_removed = result.links_removed,
            "Flush complete"
        );
        Ok(result)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(session = self.id))]
    pub(crate) fn commit(&self) -> Result<()> {
        if let Err(e) = self.flush() {
            self.abort();
            return Err(e);
        }
        if self.conn.in_transaction() {
            if let Err(e) = self.conn.commit() {
                self.abort();
                return Err(e);
            }
            info!(session = self.id, "Transaction committed");
        }
        self.finish(TransactionState::Committed);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(session = self.id))]
    pub(crate) fn rollback(&self) -> Result<()> {
        let result = if self.conn.in_transaction() {
            self.conn.rollback()
        } else {
            Ok(())
        };
        self.finish(TransactionState::RolledBack);
        info!(session = self.id, "Transaction rolled back");
        result
    }

    fn abort(&self) {
        if let Err(e) = self.rollback() {
            warn!(session = self.id, error = %e, "Rollback after failed commit also failed");
        }
    }

    /// Forget every instance and expire outstanding handles.
    fn finish(&self, tx: TransactionState) {
        let mut state = self.state.borrow_mut();
        state.map.clear();
        state.links.clear();
        state.epoch += 1;
        state.savepoints = 0;
        state.tx = tx;
        state.write_locked = false;
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.conn.in_transaction() {
            warn!(session = self.id, "Session dropped with an open transaction; rolling back");
            if let Err(e) = self.conn.rollback() {
                warn!(session = self.id, error = %e, "Rollback on drop failed");
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work over one connection.
///
/// Cloning a session yields another handle to the same unit of work. Sessions
/// are single-threaded; give each thread its own.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("objects", &state.map.len())
            .field("transaction", &state.tx)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session with the default configuration.
    pub fn new(schema: Arc<Schema>, conn: Box<dyn Connection>) -> Self {
        Self::with_config(schema, conn, SessionConfig::default())
    }

    pub fn with_config(schema: Arc<Schema>, conn: Box<dyn Connection>, config: SessionConfig) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, mode = ?config.mode, "Session opened");
        let state = State {
            map: IdentityMap::new(),
            links: IndexMap::new(),
            cache: TranslationCache::new(config.cache_size),
            epoch: 0,
            depth: 0,
            savepoints: 0,
            tx: TransactionState::NoTransaction,
            write_locked: false,
        };
        Self {
            inner: Rc::new(SessionInner {
                id,
                schema,
                conn,
                config,
                state: RefCell::new(state),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The underlying connection, for statements outside the unit of work.
    pub fn connection(&self) -> &dyn Connection {
        self.inner.conn.as_ref()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.inner.state.borrow().tx
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.conn.in_transaction()
    }

    /// Number of instances the session tracks.
    pub fn len(&self) -> usize {
        self.inner.state.borrow().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `entity` belongs to this session and is still valid.
    pub fn owns(&self, entity: &Entity) -> bool {
        entity.session_id() == self.inner.id && entity.epoch() == self.inner.epoch()
    }

    /// Whether a flush would write anything.
    pub fn has_changes(&self) -> bool {
        self.inner.state.borrow().has_changes()
    }

    // ------------------------------------------------------------------
    // Creating objects
    // ------------------------------------------------------------------

    /// Create a new object.
    ///
    /// Attributes not given take their declared default. The object is
    /// inserted by the next flush; a store-assigned key is known from then on.
    #[tracing::instrument(level = "debug", skip(self, values), fields(session = self.inner.id))]
    pub fn create<'a>(
        &self,
        entity: &str,
        values: impl IntoIterator<Item = (&'a str, AttrValue)>,
    ) -> Result<Entity> {
        let inner = &self.inner;
        let schema = inner.schema.clone();
        let info = schema.entity(entity)?;
        let mut given: IndexMap<&str, AttrValue> = IndexMap::new();
        for (name, value) in values {
            if info.attr(name).is_none() {
                return Err(Error::schema(
                    corral_core::error::SchemaErrorKind::UnknownAttribute,
                    format!("{entity} has no attribute '{name}'"),
                ));
            }
            given.insert(name, value);
        }

        let mut errors = ValidationError::new(entity);
        let mut fields: Vec<(String, Field)> = Vec::new();
        let mut refs: Vec<(&corral_core::Attribute, Option<ObjId>)> = Vec::new();
        let mut sets: Vec<(&corral_core::Attribute, Vec<ObjId>)> = Vec::new();
        let mut key_values = Vec::new();

        for attr in info.attributes() {
            let value = given.shift_remove(attr.name());
            match attr.kind() {
                AttrKind::Discriminator => {
                    if value.is_some() {
                        errors.add(attr.name(), ValidationErrorKind::ReadOnly, "is set automatically");
                    }
                    if let Some((_, v)) = info.discriminator() {
                        fields.push((attr.name().to_string(), Field::Value(v.clone())));
                    }
                }
                AttrKind::Set => {
                    let members = match value {
                        None => Vec::new(),
                        Some(AttrValue::Objects(list)) => list
                            .iter()
                            .map(|e| e.id_in(inner))
                            .collect::<Result<Vec<_>>>()?,
                        Some(_) => {
                            errors.add(attr.name(), ValidationErrorKind::Type, "expects a list of objects");
                            continue;
                        }
                    };
                    sets.push((attr, members));
                }
                _ if attr.is_relation() => {
                    let target = match value {
                        None => None,
                        Some(AttrValue::Object(Some(e))) => Some(e.id_in(inner)?),
                        Some(AttrValue::Object(None) | AttrValue::Value(Value::Null)) => None,
                        Some(_) => {
                            errors.add(attr.name(), ValidationErrorKind::Type, "expects an object");
                            continue;
                        }
                    };
                    if target.is_none() && attr.kind() == AttrKind::Required {
                        errors.add(attr.name(), ValidationErrorKind::Required, "is required");
                        continue;
                    }
                    refs.push((attr, target));
                }
                _ => {
                    let value = match value {
                        Some(AttrValue::Value(v)) => v,
                        Some(_) => {
                            errors.add(attr.name(), ValidationErrorKind::Type, "expects a value, not an object");
                            continue;
                        }
                        None => attr.default_value().cloned().unwrap_or(Value::Null),
                    };
                    match corral_core::validate::check_value(entity, attr, value) {
                        Ok(v) => {
                            if attr.is_pk() {
                                key_values.push(v.clone());
                            }
                            fields.push((attr.name().to_string(), Field::Value(v)));
                        }
                        Err(Error::Validation(e)) => errors.errors.extend(e.errors),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }

        let key = if key_values.iter().any(Value::is_null) {
            None
        } else {
            Some(ObjectKey::new(info.root(), key_values))
        };
        if let Some(key) = &key {
            let existing = inner.state.borrow().map.lookup(key);
            if let Some(existing) = existing {
                let live = inner.instance(existing, |i| !i.status.is_deleted())?;
                if live {
                    return Err(Error::constraint(
                        entity,
                        key.values().to_vec(),
                        None,
                        format!("an object with key {key} already exists in this session"),
                    ));
                }
            }
        }

        let mut plans = Vec::with_capacity(refs.len());
        for (attr, target) in &refs {
            plans.push(inner.plan_ref(None, attr, None, *target)?);
        }

        let id = {
            let mut instance = Instance::created(info.name(), key);
            for (name, field) in fields {
                instance.fields.insert(name, field);
            }
            for attr in info.attributes().iter().filter(|a| a.is_collection()) {
                instance.members_mut(attr.name()).loaded = true;
            }
            inner.state.borrow_mut().map.insert(instance)
        };
        for plan in plans {
            inner.apply_ref(id, plan)?;
        }
        for (attr, members) in sets {
            for member in members {
                inner.add_member(id, attr, member)?;
            }
        }
        debug!(entity, "Object created");
        Ok(inner.handle(id))
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Get an object by primary key.
    ///
    /// Consults the identity map first; fails with `NotFound` when no row
    /// has the key or the row belongs to another entity of the hierarchy.
    pub fn get(&self, entity: &str, key: impl IntoKey) -> Result<Entity> {
        let values = key.into_key();
        self.try_get(entity, values.clone())?
            .ok_or_else(|| Error::not_found(entity, values))
    }

    pub fn try_get(&self, entity: &str, key: impl IntoKey) -> Result<Option<Entity>> {
        let id = self.inner.get_by_key(entity, key.into_key())?;
        Ok(id.map(|id| self.inner.handle(id)))
    }

    /// Get an object by attribute values.
    ///
    /// A lookup by primary key or by one unique attribute is answered from
    /// the identity map when possible. More than one match is an error.
    pub fn get_by(&self, entity: &str, criteria: &[(&str, Value)]) -> Result<Option<Entity>> {
        let id = self.inner.get_by(entity, criteria)?;
        Ok(id.map(|id| self.inner.handle(id)))
    }

    /// Load an object with `SELECT ... FOR UPDATE`, opening a write
    /// transaction first.
    pub fn get_for_update(&self, entity: &str, key: impl IntoKey, nowait: bool) -> Result<Entity> {
        let values = key.into_key();
        let id = self.inner.get_for_update(entity, values.clone(), nowait)?;
        id.map(|id| self.inner.handle(id))
            .ok_or_else(|| Error::not_found(entity, values))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Execute a query and return its rows.
    pub fn fetch(&self, query: &Query) -> Result<Vec<Vec<Item>>> {
        self.inner.fetch(query)
    }

    /// Execute a query projecting one object per row.
    pub fn fetch_entities(&self, query: &Query) -> Result<Vec<Entity>> {
        Ok(self
            .fetch(query)?
            .into_iter()
            .filter_map(|row| row.into_iter().next().and_then(Item::into_entity))
            .collect())
    }

    /// Execute a query projecting one value per row.
    pub fn fetch_values(&self, query: &Query) -> Result<Vec<Value>> {
        Ok(self
            .fetch(query)?
            .into_iter()
            .filter_map(|row| row.into_iter().next().and_then(Item::into_value))
            .collect())
    }

    /// The only object the query selects, if any.
    pub fn fetch_one(&self, query: &Query) -> Result<Option<Entity>> {
        let mut found = self.fetch_entities(&query.limit(2))?;
        if found.len() > 1 {
            let entity = match query.vars().first().map(|v| &v.source) {
                Some(Source::Entity(name)) => name.clone(),
                _ => String::new(),
            };
            return Err(Error::MultipleFound(corral_core::error::MultipleFoundError {
                entity,
                criteria: "query".to_string(),
            }));
        }
        Ok(found.pop())
    }

    pub fn fetch_first(&self, query: &Query) -> Result<Option<Entity>> {
        Ok(self.fetch_entities(&query.limit(1))?.into_iter().next())
    }

    pub fn exists(&self, query: &Query) -> Result<bool> {
        Ok(!self.fetch(&query.limit(1))?.is_empty())
    }

    /// Number of rows the query selects.
    pub fn count(&self, query: &Query) -> Result<u64> {
        let value = self.scalar(&query.count_of())?;
        Ok(value.as_i64().and_then(|n| u64::try_from(n).ok()).unwrap_or(0))
    }

    /// First column of the first row, or NULL when there is none.
    pub fn scalar(&self, query: &Query) -> Result<Value> {
        Ok(self
            .fetch(query)?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .and_then(Item::into_value)
            .unwrap_or(Value::Null))
    }

    /// Load objects of `entity` with a raw SELECT.
    ///
    /// Result columns are matched to attribute columns by name; the key
    /// columns must be present.
    pub fn fetch_by_sql(&self, entity: &str, sql: &RawSql) -> Result<Vec<Entity>> {
        let ids = self.inner.fetch_by_sql(entity, sql)?;
        Ok(ids.into_iter().map(|id| self.inner.handle(id)).collect())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Write pending changes without committing.
    pub fn flush(&self) -> Result<FlushResult> {
        self.inner.flush()
    }

    /// Flush and commit. The session stays usable; handles obtained before
    /// the commit are expired.
    pub fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    /// Discard pending changes and roll back.
    pub fn rollback(&self) -> Result<()> {
        self.inner.rollback()
    }

    /// Run `f` so that it takes effect completely or not at all.
    ///
    /// When `f` fails, the objects and pending changes of the session and
    /// the rows written since the call began are put back as they were, and
    /// the error is returned. An enclosing transaction stays open.
    pub fn savepoint<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let inner = &self.inner;
        let marker = if inner.conn.in_transaction() {
            inner.begin_if_needed(true, false)?;
            let name = {
                let mut state = inner.state.borrow_mut();
                state.savepoints += 1;
                format!("corral_sp{}", state.savepoints)
            };
            if let Err(e) = inner.conn.savepoint(&name) {
                inner.state.borrow_mut().savepoints -= 1;
                return Err(e);
            }
            Some(name)
        } else {
            None
        };
        let (map, links, tx, write_locked, epoch) = {
            let state = inner.state.borrow();
            (
                state.map.clone(),
                state.links.clone(),
                state.tx,
                state.write_locked,
                state.epoch,
            )
        };

        let result = f(self);
        if inner.epoch() != epoch {
            // `f` ended the transaction; there is nothing left to go back to
            return result;
        }
        if marker.is_some() {
            inner.state.borrow_mut().savepoints -= 1;
        }
        match result {
            Ok(value) => {
                if let Some(name) = &marker {
                    inner.conn.release(name)?;
                }
                Ok(value)
            }
            Err(e) => {
                let undo = match &marker {
                    Some(name) => inner
                        .conn
                        .rollback_to(name)
                        .and_then(|()| inner.conn.release(name)),
                    None if inner.conn.in_transaction() => inner.conn.rollback(),
                    None => Ok(()),
                };
                {
                    let mut state = inner.state.borrow_mut();
                    state.map.restore(map);
                    state.links = links;
                    state.tx = tx;
                    state.write_locked = write_locked;
                }
                if let Err(undo) = undo {
                    warn!(session = inner.id, error = %undo, "Rolling back to savepoint failed");
                    return Err(undo);
                }
                debug!(session = inner.id, error = %e, "Rolled back to savepoint");
                Err(e)
            }
        }
    }

    /// Run `f` as a unit of work.
    ///
    /// The outermost scope commits when `f` succeeds and rolls back when it
    /// fails; nested scopes join the enclosing one.
    pub fn scope<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let outermost = {
            let mut state = self.inner.state.borrow_mut();
            state.depth += 1;
            state.depth == 1
        };
        let result = f(self);
        self.inner.state.borrow_mut().depth -= 1;
        if !outermost {
            return result;
        }
        match result {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = self.rollback() {
                    warn!(session = self.inner.id, error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}
