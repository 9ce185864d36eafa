//! Shared fixtures for the engine's unit tests.

use crate::clock::{Clock, ManualClock};
use crate::config::SyncConfig;
use crate::local::{ChangedObject, CommitOrigin, LocalObject, LocalRef, LocalStore, MemoryLocalStore};
use crate::meta::SyncMeta;
use crate::remote::{MemoryRemoteStore, RemoteStore};
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::session::SessionContext;
use crate::tracker::{EntryStatus, SyncQueueEntry};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use zonesync_record::{ChangeCursor, FieldKind, RecordId, ZoneId};

pub(crate) fn schema() -> SchemaRegistry {
    SchemaRegistry::new(vec![
        EntitySchema::new("Group")
            .attribute("name", FieldKind::Text)
            .to_many("items", "Item"),
        EntitySchema::new("Item")
            .attribute("name", FieldKind::Text)
            .attribute("position", FieldKind::Integer)
            .to_one("group", "Group"),
    ])
}

pub(crate) struct Fixture {
    pub(crate) local: Mutex<MemoryLocalStore>,
    pub(crate) meta: Mutex<SyncMeta>,
    pub(crate) remote: MemoryRemoteStore,
    pub(crate) zone: ZoneId,
    pub(crate) config: SyncConfig,
    pub(crate) clock: Arc<ManualClock>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        Self {
            local: Mutex::new(MemoryLocalStore::new(schema())),
            meta: Mutex::new(SyncMeta::in_memory()),
            remote: MemoryRemoteStore::new(clock.clone()),
            zone: ZoneId::new("Library").unwrap(),
            config: SyncConfig::new(),
            clock,
        }
    }

    pub(crate) async fn with_zone() -> Self {
        let fx = Self::new();
        fx.remote.create_zone(&fx.zone).await.unwrap();
        fx
    }

    pub(crate) async fn with_zone_and_page_size(size: u32) -> Self {
        let mut fx = Self::with_zone().await;
        fx.config = fx.config.with_change_page_size(size);
        fx
    }

    pub(crate) fn ctx(&self) -> SessionContext<'_, MemoryLocalStore, MemoryRemoteStore> {
        SessionContext {
            local: &self.local,
            meta: &self.meta,
            remote: &self.remote,
            zone: &self.zone,
            config: &self.config,
            clock: &*self.clock,
        }
    }

    pub(crate) fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn record(&self, local_ref: LocalRef, status: EntryStatus) {
        let entity = self
            .meta
            .lock()
            .state()
            .entry_for_local(local_ref)
            .map(|e| e.entity_type.clone());
        let entity = entity.unwrap_or_else(|| {
            self.local
                .lock()
                .object(local_ref)
                .unwrap()
                .entity()
                .to_string()
        });
        let mut meta = self.meta.lock();
        meta.tracker().record_local_change(
            &[ChangedObject::new(local_ref, entity)],
            status,
            self.clock.now(),
        );
        meta.commit().unwrap();
    }

    pub(crate) fn track(&self, local_ref: LocalRef) {
        self.record(local_ref, EntryStatus::Dirty);
    }

    pub(crate) fn create(&self, entity: &str, name: &str) -> LocalRef {
        let local_ref = {
            let mut local = self.local.lock();
            let local_ref = local.insert(entity).unwrap();
            local.object_mut(local_ref).unwrap().set("name", name);
            local.save(CommitOrigin::Sync).unwrap();
            local_ref
        };
        self.track(local_ref);
        local_ref
    }

    pub(crate) fn rename(&self, local_ref: LocalRef, name: &str) {
        {
            let mut local = self.local.lock();
            local.object_mut(local_ref).unwrap().set("name", name);
            local.save(CommitOrigin::Sync).unwrap();
        }
        self.track(local_ref);
    }

    pub(crate) fn delete(&self, local_ref: LocalRef) {
        {
            let mut local = self.local.lock();
            local.delete(local_ref).unwrap();
            local.save(CommitOrigin::Sync).unwrap();
        }
        self.record(local_ref, EntryStatus::Tombstoned);
    }

    pub(crate) fn entry(&self, local_ref: LocalRef) -> SyncQueueEntry {
        self.meta
            .lock()
            .state()
            .entry_for_local(local_ref)
            .cloned()
            .unwrap()
    }

    pub(crate) fn remote_id(&self, local_ref: LocalRef) -> RecordId {
        self.entry(local_ref).remote_id
    }

    pub(crate) fn local_for(&self, id: &RecordId) -> LocalRef {
        self.meta
            .lock()
            .state()
            .entry_for_remote(id)
            .map(|e| e.local_ref)
            .unwrap()
    }

    pub(crate) fn object(&self, local_ref: LocalRef) -> LocalObject {
        self.local.lock().object(local_ref).cloned().unwrap()
    }

    pub(crate) fn cursor(&self) -> Option<ChangeCursor> {
        self.meta.lock().cursor_store().current()
    }
}
