//! Sync queue tracker.
//!
//! One [`SyncQueueEntry`] exists per tracked local object. It pairs the
//! object's [`LocalRef`] with the remote record id it syncs to and records
//! whether the object still has to be pushed.
//!
//! ## Key Invariants
//!
//! - At most one entry per `local_ref` and one per `remote_id`
//! - `remote_id` never changes once assigned
//! - Tombstoned entries have no live local object
//! - Entries are never dropped because a push or pull failed

use crate::local::{ChangedObject, LocalRef};
use crate::meta::{MetaOp, SyncMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use zonesync_record::RecordId;

/// Reconciliation state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Local and remote agree.
    Clean,
    /// The local object changed and must be saved remotely.
    Dirty,
    /// The local object was deleted and the remote record must be removed.
    Tombstoned,
}

impl EntryStatus {
    /// Returns true for entries that still have to be pushed.
    pub fn is_pending(self) -> bool {
        !matches!(self, EntryStatus::Clean)
    }

    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Clean => "clean",
            EntryStatus::Dirty => "dirty",
            EntryStatus::Tombstoned => "tombstoned",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one tracked local object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    /// Local object identity.
    pub local_ref: LocalRef,
    /// Remote record id.
    pub remote_id: RecordId,
    /// Entity type name.
    pub entity_type: String,
    /// Freshness of this entry as last seen by the engine.
    pub last_modified_at: DateTime<Utc>,
    /// Reconciliation state.
    pub status: EntryStatus,
    /// Relationship fields whose target record is not yet known locally.
    #[serde(default)]
    pub unresolved_refs: BTreeMap<String, RecordId>,
}

impl SyncQueueEntry {
    /// Creates an entry with no unresolved references.
    pub fn new(
        local_ref: LocalRef,
        remote_id: RecordId,
        entity_type: impl Into<String>,
        last_modified_at: DateTime<Utc>,
        status: EntryStatus,
    ) -> Self {
        Self {
            local_ref,
            remote_id,
            entity_type: entity_type.into(),
            last_modified_at,
            status,
            unresolved_refs: BTreeMap::new(),
        }
    }
}

/// Entries waiting to be pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingEntries {
    /// Entries to save remotely.
    pub dirty: Vec<SyncQueueEntry>,
    /// Entries to delete remotely.
    pub tombstoned: Vec<SyncQueueEntry>,
}

impl PendingEntries {
    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.tombstoned.is_empty()
    }
}

/// Typed access to the queue entries of a [`SyncMeta`].
///
/// Mutations become durable on the next [`SyncMeta::commit`].
pub struct SyncQueueTracker<'a> {
    meta: &'a mut SyncMeta,
}

impl<'a> SyncQueueTracker<'a> {
    pub(crate) fn new(meta: &'a mut SyncMeta) -> Self {
        Self { meta }
    }

    /// Records local mutations.
    ///
    /// Finds or creates the entry of each object, sets `status`, and stamps
    /// it with `now`. New entries get a freshly generated remote id. A
    /// deletion of an object that was never tracked is ignored. Returns the
    /// number of entries touched.
    pub fn record_local_change(
        &mut self,
        objects: &[ChangedObject],
        status: EntryStatus,
        now: DateTime<Utc>,
    ) -> usize {
        let mut touched = 0;
        for object in objects {
            let entry = match self.meta.state().entry_for_local(object.local_ref) {
                Some(existing) => SyncQueueEntry {
                    status,
                    last_modified_at: now,
                    ..existing.clone()
                },
                None if status == EntryStatus::Tombstoned => continue,
                None => SyncQueueEntry::new(
                    object.local_ref,
                    RecordId::generate(),
                    object.entity.clone(),
                    now,
                    status,
                ),
            };
            debug!(
                local_ref = %entry.local_ref,
                record_id = %entry.remote_id,
                entity = %entry.entity_type,
                status = %status,
                "recorded local change"
            );
            self.meta.apply(MetaOp::Upsert(entry));
            touched += 1;
        }
        touched
    }

    /// Entries with a status other than clean.
    pub fn pending_entries(&self) -> PendingEntries {
        let mut pending = PendingEntries::default();
        for entry in self.meta.state().entries() {
            match entry.status {
                EntryStatus::Clean => {}
                EntryStatus::Dirty => pending.dirty.push(entry.clone()),
                EntryStatus::Tombstoned => pending.tombstoned.push(entry.clone()),
            }
        }
        pending
    }

    /// Marks an entry clean with a server-confirmed timestamp.
    ///
    /// Remote ids are assigned when an entry is created, so there is never
    /// an id to backfill here. Returns false if no entry has `remote_id`.
    pub fn mark_clean(&mut self, remote_id: &RecordId, timestamp: DateTime<Utc>) -> bool {
        let Some(existing) = self.meta.state().entry_for_remote(remote_id) else {
            return false;
        };
        let entry = SyncQueueEntry {
            status: EntryStatus::Clean,
            last_modified_at: timestamp,
            ..existing.clone()
        };
        self.meta.apply(MetaOp::Upsert(entry));
        true
    }

    /// Deletes the entries bound to `remote_ids`. Returns how many existed.
    pub fn remove_entries(&mut self, remote_ids: &[RecordId]) -> usize {
        let mut removed = 0;
        for remote_id in remote_ids {
            let local_ref = self
                .meta
                .state()
                .entry_for_remote(remote_id)
                .map(|e| e.local_ref);
            if let Some(local_ref) = local_ref {
                self.meta.apply(MetaOp::Remove(local_ref));
                removed += 1;
            }
        }
        removed
    }

    /// Entry tracking a local object.
    pub fn entry_for_local(&self, local_ref: LocalRef) -> Option<&SyncQueueEntry> {
        self.meta.state().entry_for_local(local_ref)
    }

    /// Entry bound to a remote id.
    pub fn entry_for_remote(&self, remote_id: &RecordId) -> Option<&SyncQueueEntry> {
        self.meta.state().entry_for_remote(remote_id)
    }

    /// Creates a clean entry for an object created from a remote record.
    pub fn bind_remote(
        &mut self,
        local_ref: LocalRef,
        entity_type: &str,
        remote_id: RecordId,
        timestamp: DateTime<Utc>,
    ) -> SyncQueueEntry {
        let entry = SyncQueueEntry::new(
            local_ref,
            remote_id,
            entity_type,
            timestamp,
            EntryStatus::Clean,
        );
        self.meta.apply(MetaOp::Upsert(entry.clone()));
        entry
    }

    /// Points the entry of `remote_id` at a different local object.
    ///
    /// The remote id is kept. Returns false if no entry has `remote_id`.
    pub fn rebind_local(&mut self, remote_id: &RecordId, local_ref: LocalRef) -> bool {
        let Some(existing) = self.meta.state().entry_for_remote(remote_id) else {
            return false;
        };
        let entry = SyncQueueEntry {
            local_ref,
            ..existing.clone()
        };
        self.meta.apply(MetaOp::Upsert(entry));
        true
    }

    /// Replaces the unresolved relationship fields of an entry.
    pub fn set_unresolved(
        &mut self,
        remote_id: &RecordId,
        unresolved: BTreeMap<String, RecordId>,
    ) -> bool {
        let Some(existing) = self.meta.state().entry_for_remote(remote_id) else {
            return false;
        };
        if existing.unresolved_refs == unresolved {
            return true;
        }
        let entry = SyncQueueEntry {
            unresolved_refs: unresolved,
            ..existing.clone()
        };
        self.meta.apply(MetaOp::Upsert(entry));
        true
    }

    /// Entries that still reference unknown records.
    pub fn entries_with_unresolved(&self) -> Vec<SyncQueueEntry> {
        self.meta
            .state()
            .entries()
            .filter(|e| !e.unresolved_refs.is_empty())
            .cloned()
            .collect()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.meta.apply(MetaOp::ClearEntries);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.meta.state().len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.meta.state().is_empty()
    }
}
