//! Local object store collaborator.
//!
//! The engine never owns a persistence engine of its own for application
//! data. It talks to one through [`LocalStore`], which exposes typed objects
//! with scalar attributes and to-one relations, transactional save, and a
//! synchronous [`CommitObserver`] callback fired after every committed save.
//!
//! [`MemoryLocalStore`] is a complete in-memory implementation used by the
//! test kit and the engine's own tests.

use crate::error::{LocalStoreError, LocalStoreResult};
use crate::schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use zonesync_record::FieldValue;

/// Stable identity of a local object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalRef(Uuid);

impl LocalRef {
    /// Generates a new random reference.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LocalRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live object in the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalObject {
    local_ref: LocalRef,
    entity: String,
    attributes: BTreeMap<String, FieldValue>,
    relations: BTreeMap<String, LocalRef>,
}

impl LocalObject {
    /// Creates an empty object of the given entity type.
    pub fn new(local_ref: LocalRef, entity: impl Into<String>) -> Self {
        Self {
            local_ref,
            entity: entity.into(),
            attributes: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// The object's identity.
    pub fn local_ref(&self) -> LocalRef {
        self.local_ref
    }

    /// The object's entity type.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Reads an attribute.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.attributes.get(name)
    }

    /// Writes an attribute. Writing `Null` clears it.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let value = value.into();
        let name = name.into();
        if value.is_null() {
            self.attributes.remove(&name);
        } else {
            self.attributes.insert(name, value);
        }
    }

    /// Removes an attribute.
    pub fn clear(&mut self, name: &str) {
        self.attributes.remove(name);
    }

    /// All attributes that hold a value.
    pub fn attributes(&self) -> &BTreeMap<String, FieldValue> {
        &self.attributes
    }

    /// Reads a to-one relation.
    pub fn relation(&self, name: &str) -> Option<LocalRef> {
        self.relations.get(name).copied()
    }

    /// Points a to-one relation at `target`.
    pub fn link(&mut self, name: impl Into<String>, target: LocalRef) {
        self.relations.insert(name.into(), target);
    }

    /// Clears a to-one relation.
    pub fn unlink(&mut self, name: &str) {
        self.relations.remove(name);
    }

    /// All set relations.
    pub fn relations(&self) -> &BTreeMap<String, LocalRef> {
        &self.relations
    }
}

/// Who produced a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOrigin {
    /// Application code.
    Application,
    /// The sync engine applying remote changes.
    Sync,
}

/// An object touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedObject {
    /// Object identity.
    pub local_ref: LocalRef,
    /// Entity type.
    pub entity: String,
}

impl ChangedObject {
    /// Creates a changed-object record.
    pub fn new(local_ref: LocalRef, entity: impl Into<String>) -> Self {
        Self {
            local_ref,
            entity: entity.into(),
        }
    }
}

/// The inserted, updated and deleted sets of one committed save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitChanges {
    /// Who saved.
    pub origin: CommitOrigin,
    /// Objects created by the save.
    pub inserted: Vec<ChangedObject>,
    /// Objects modified by the save.
    pub updated: Vec<ChangedObject>,
    /// Objects removed by the save.
    pub deleted: Vec<ChangedObject>,
}

impl CommitChanges {
    /// Creates an empty change set.
    pub fn empty(origin: CommitOrigin) -> Self {
        Self {
            origin,
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Inserted and updated objects together.
    pub fn upserted(&self) -> Vec<ChangedObject> {
        self.inserted
            .iter()
            .chain(self.updated.iter())
            .cloned()
            .collect()
    }
}

/// Receives committed change sets from a local store.
///
/// Called synchronously from inside [`LocalStore::save`], after the commit
/// succeeded. Implementations must not call back into the store.
pub trait CommitObserver: Send + Sync {
    /// Handles one committed save.
    fn did_commit(&self, changes: &CommitChanges);
}

/// A single-writer local object store.
pub trait LocalStore: Send {
    /// Entity descriptors for every type the store holds.
    fn schema(&self) -> &SchemaRegistry;

    /// Creates an object of the given entity type.
    fn insert(&mut self, entity: &str) -> LocalStoreResult<LocalRef>;

    /// Reads a live object.
    fn object(&self, local_ref: LocalRef) -> Option<&LocalObject>;

    /// Opens a live object for modification.
    fn object_mut(&mut self, local_ref: LocalRef) -> Option<&mut LocalObject>;

    /// Deletes an object.
    fn delete(&mut self, local_ref: LocalRef) -> LocalStoreResult<()>;

    /// References of all live objects of an entity type.
    fn refs_of(&self, entity: &str) -> Vec<LocalRef>;

    /// Commits pending changes and notifies the observer.
    fn save(&mut self, origin: CommitOrigin) -> LocalStoreResult<CommitChanges>;

    /// Discards pending changes.
    fn rollback(&mut self);

    /// Installs or removes the commit observer.
    fn set_observer(&mut self, observer: Option<Arc<dyn CommitObserver>>);
}

/// In-memory local store.
pub struct MemoryLocalStore {
    schema: SchemaRegistry,
    committed: BTreeMap<LocalRef, LocalObject>,
    working: BTreeMap<LocalRef, LocalObject>,
    inserted: BTreeSet<LocalRef>,
    updated: BTreeSet<LocalRef>,
    deleted: BTreeMap<LocalRef, String>,
    observer: Option<Arc<dyn CommitObserver>>,
    fail_next_commit: Option<String>,
    commits: u64,
}

impl MemoryLocalStore {
    /// Creates an empty store over `schema`.
    pub fn new(schema: SchemaRegistry) -> Self {
        Self {
            schema,
            committed: BTreeMap::new(),
            working: BTreeMap::new(),
            inserted: BTreeSet::new(),
            updated: BTreeSet::new(),
            deleted: BTreeMap::new(),
            observer: None,
            fail_next_commit: None,
            commits: 0,
        }
    }

    /// Makes the next `save` fail with `message`.
    pub fn fail_next_commit(&mut self, message: impl Into<String>) {
        self.fail_next_commit = Some(message.into());
    }

    /// Number of successful saves.
    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    /// Returns true if there are unsaved changes.
    pub fn has_changes(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }

    /// All live objects, ordered by reference.
    pub fn objects(&self) -> impl Iterator<Item = &LocalObject> {
        self.working.values()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.working.len()
    }

    /// Returns true if the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.working.is_empty()
    }
}

impl fmt::Debug for MemoryLocalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLocalStore")
            .field("objects", &self.working.len())
            .field("commits", &self.commits)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

impl LocalStore for MemoryLocalStore {
    fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    fn insert(&mut self, entity: &str) -> LocalStoreResult<LocalRef> {
        if !self.schema.contains(entity) {
            return Err(LocalStoreError::UnknownEntity(entity.to_string()));
        }
        let local_ref = LocalRef::new();
        self.working
            .insert(local_ref, LocalObject::new(local_ref, entity));
        self.inserted.insert(local_ref);
        Ok(local_ref)
    }

    fn object(&self, local_ref: LocalRef) -> Option<&LocalObject> {
        self.working.get(&local_ref)
    }

    fn object_mut(&mut self, local_ref: LocalRef) -> Option<&mut LocalObject> {
        let object = self.working.get_mut(&local_ref)?;
        if !self.inserted.contains(&local_ref) {
            self.updated.insert(local_ref);
        }
        Some(object)
    }

    fn delete(&mut self, local_ref: LocalRef) -> LocalStoreResult<()> {
        let object = self
            .working
            .remove(&local_ref)
            .ok_or(LocalStoreError::UnknownObject(local_ref))?;
        self.updated.remove(&local_ref);
        if !self.inserted.remove(&local_ref) {
            self.deleted.insert(local_ref, object.entity);
        }

        // Relations pointing at the deleted object are nullified.
        for other in self.working.values_mut() {
            let inbound: Vec<String> = other
                .relations
                .iter()
                .filter(|(_, target)| **target == local_ref)
                .map(|(name, _)| name.clone())
                .collect();
            if inbound.is_empty() {
                continue;
            }
            for name in &inbound {
                other.relations.remove(name);
            }
            if !self.inserted.contains(&other.local_ref) {
                self.updated.insert(other.local_ref);
            }
        }
        Ok(())
    }

    fn refs_of(&self, entity: &str) -> Vec<LocalRef> {
        self.working
            .values()
            .filter(|o| o.entity == entity)
            .map(|o| o.local_ref)
            .collect()
    }

    fn save(&mut self, origin: CommitOrigin) -> LocalStoreResult<CommitChanges> {
        if let Some(message) = self.fail_next_commit.take() {
            return Err(LocalStoreError::CommitFailed(message));
        }

        let changed = |refs: &BTreeSet<LocalRef>, objects: &BTreeMap<LocalRef, LocalObject>| {
            refs.iter()
                .filter_map(|r| objects.get(r))
                .map(|o| ChangedObject::new(o.local_ref, o.entity.clone()))
                .collect::<Vec<_>>()
        };

        let changes = CommitChanges {
            origin,
            inserted: changed(&self.inserted, &self.working),
            updated: changed(&self.updated, &self.working),
            deleted: self
                .deleted
                .iter()
                .map(|(r, entity)| ChangedObject::new(*r, entity.clone()))
                .collect(),
        };

        self.committed = self.working.clone();
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
        self.commits += 1;

        if !changes.is_empty() {
            if let Some(observer) = &self.observer {
                observer.did_commit(&changes);
            }
        }

        Ok(changes)
    }

    fn rollback(&mut self) {
        self.working = self.committed.clone();
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
    }

    fn set_observer(&mut self, observer: Option<Arc<dyn CommitObserver>>) {
        self.observer = observer;
    }
}
