//! In-memory view of the sync metadata.

use crate::local::LocalRef;
use crate::tracker::{EntryStatus, SyncQueueEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use zonesync_record::{ChangeCursor, RecordId};

/// A single mutation of the sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaOp {
    /// Insert or replace the entry for its `local_ref`.
    Upsert(SyncQueueEntry),
    /// Remove the entry for a local object.
    Remove(LocalRef),
    /// Store or clear the change cursor.
    SetCursor(Option<ChangeCursor>),
    /// Remove every entry.
    ClearEntries,
}

/// Serialized form of a complete state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    entries: Vec<SyncQueueEntry>,
    cursor: Option<ChangeCursor>,
}

/// Queue entries and change cursor, indexed by both identities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaState {
    entries: BTreeMap<LocalRef, SyncQueueEntry>,
    by_remote: HashMap<RecordId, LocalRef>,
    cursor: Option<ChangeCursor>,
}

impl MetaState {
    /// All entries, ordered by local reference.
    pub fn entries(&self) -> impl Iterator<Item = &SyncQueueEntry> {
        self.entries.values()
    }

    /// Entry tracking a local object.
    pub fn entry_for_local(&self, local_ref: LocalRef) -> Option<&SyncQueueEntry> {
        self.entries.get(&local_ref)
    }

    /// Entry bound to a remote record id.
    pub fn entry_for_remote(&self, remote_id: &RecordId) -> Option<&SyncQueueEntry> {
        self.by_remote
            .get(remote_id)
            .and_then(|local_ref| self.entries.get(local_ref))
    }

    /// Stored change cursor.
    pub fn cursor(&self) -> Option<&ChangeCursor> {
        self.cursor.as_ref()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries with the given status.
    pub fn count_by_status(&self, status: EntryStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }

    /// Number of entries waiting to be pushed.
    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| e.status.is_pending()).count()
    }

    pub(crate) fn apply(&mut self, op: &MetaOp) {
        match op {
            MetaOp::Upsert(entry) => {
                if let Some(old) = self.entries.get(&entry.local_ref) {
                    if old.remote_id != entry.remote_id {
                        self.by_remote.remove(&old.remote_id);
                    }
                }
                if let Some(old_ref) = self.by_remote.get(&entry.remote_id).copied() {
                    if old_ref != entry.local_ref {
                        self.entries.remove(&old_ref);
                    }
                }
                self.by_remote
                    .insert(entry.remote_id.clone(), entry.local_ref);
                self.entries.insert(entry.local_ref, entry.clone());
            }
            MetaOp::Remove(local_ref) => {
                if let Some(old) = self.entries.remove(local_ref) {
                    self.by_remote.remove(&old.remote_id);
                }
            }
            MetaOp::SetCursor(cursor) => self.cursor = cursor.clone(),
            MetaOp::ClearEntries => {
                self.entries.clear();
                self.by_remote.clear();
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.entries.values().cloned().collect(),
            cursor: self.cursor.clone(),
        }
    }

    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = MetaState {
            cursor: snapshot.cursor,
            ..Default::default()
        };
        for entry in snapshot.entries {
            state.apply(&MetaOp::Upsert(entry));
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(remote: &str) -> SyncQueueEntry {
        SyncQueueEntry::new(
            LocalRef::new(),
            RecordId::new(remote).unwrap(),
            "Item",
            Utc::now(),
            EntryStatus::Dirty,
        )
    }

    #[test]
    fn upsert_indexes_both_ids() {
        let mut state = MetaState::default();
        let e = entry("r1");
        state.apply(&MetaOp::Upsert(e.clone()));

        assert_eq!(state.entry_for_local(e.local_ref), Some(&e));
        assert_eq!(state.entry_for_remote(&e.remote_id), Some(&e));
        assert_eq!(state.pending_count(), 1);
    }

    #[test]
    fn rebinding_a_remote_id_drops_the_old_local_entry() {
        let mut state = MetaState::default();
        let old = entry("r1");
        state.apply(&MetaOp::Upsert(old.clone()));

        let mut moved = old.clone();
        moved.local_ref = LocalRef::new();
        state.apply(&MetaOp::Upsert(moved.clone()));

        assert_eq!(state.len(), 1);
        assert!(state.entry_for_local(old.local_ref).is_none());
        assert_eq!(state.entry_for_remote(&old.remote_id), Some(&moved));
    }

    #[test]
    fn remove_and_clear() {
        let mut state = MetaState::default();
        let a = entry("a");
        let b = entry("b");
        state.apply(&MetaOp::Upsert(a.clone()));
        state.apply(&MetaOp::Upsert(b.clone()));

        state.apply(&MetaOp::Remove(a.local_ref));
        assert!(state.entry_for_remote(&a.remote_id).is_none());
        assert_eq!(state.len(), 1);

        state.apply(&MetaOp::ClearEntries);
        assert!(state.is_empty());
        assert!(state.entry_for_remote(&b.remote_id).is_none());
    }

    #[test]
    fn snapshot_restores_indexes() {
        let mut state = MetaState::default();
        let e = entry("r1");
        state.apply(&MetaOp::Upsert(e.clone()));
        state.apply(&MetaOp::SetCursor(Some(ChangeCursor::from_bytes(vec![3]))));

        let restored = MetaState::from_snapshot(state.snapshot());
        assert_eq!(restored, state);
        assert_eq!(restored.entry_for_remote(&e.remote_id), Some(&e));
    }
}
