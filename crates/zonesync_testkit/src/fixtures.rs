//! Test fixtures and device helpers.
//!
//! A [`SharedCloud`] owns the remote store and the clock. Every [`Device`]
//! made from it has its own local store and metadata journal but talks to
//! the same zone, so tests can play several installations against each
//! other.

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use zonesync_engine::{
    CommitOrigin, EntitySchema, FullSyncPolicy, LocalObject, LocalRef, LocalStore, ManualClock, MemoryLocalStore,
    MemoryRemoteStore, SchemaRegistry, SessionOutcome, SessionReport, SyncConfig, SyncEngine,
    SyncMeta, SyncQueueEntry, SyncResult, META_FILE_NAME,
};
use zonesync_record::{FieldKind, FieldValue, RecordId, RemoteRecord, ZoneId};

/// Name of the zone every fixture device works in.
pub const ZONE: &str = "Library";

/// Engine over the in-memory stores.
pub type TestEngine = SyncEngine<MemoryLocalStore, Arc<MemoryRemoteStore>>;

/// Two entities: `Group { name, items -> [Item] }` and
/// `Item { name, position, group -> Group }`.
pub fn library_schema() -> SchemaRegistry {
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

/// The fixture zone id.
pub fn zone_id() -> ZoneId {
    ZoneId::new(ZONE).expect("fixture zone name is valid")
}

/// A remote store and a clock shared by several devices.
#[derive(Debug, Clone)]
pub struct SharedCloud {
    /// The remote store.
    pub remote: Arc<MemoryRemoteStore>,
    /// Clock used by the remote store and every device.
    pub clock: Arc<ManualClock>,
}

impl SharedCloud {
    /// Creates an empty cloud with a stopped clock.
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        Self {
            remote: Arc::new(MemoryRemoteStore::new(clock.clone())),
            clock,
        }
    }

    /// Creates a device with auto-sync disabled and an in-memory journal.
    pub fn device(&self, name: &str) -> Device {
        self.device_with_config(name, SyncConfig::new().with_auto_sync_on_save(false))
    }

    /// Creates a device with an in-memory journal and the given config.
    pub fn device_with_config(&self, name: &str, config: SyncConfig) -> Device {
        let engine = SyncEngine::with_parts(
            config,
            MemoryLocalStore::new(library_schema()),
            self.remote.clone(),
            SyncMeta::in_memory(),
            self.clock.clone(),
        );
        Device {
            name: name.to_string(),
            engine,
            cloud: self.clone(),
        }
    }

    /// Creates a device whose journal lives at `journal`.
    ///
    /// The engine stamps local changes with the system clock.
    pub fn persistent_device(&self, name: &str, journal: &TempJournal) -> SyncResult<Device> {
        let engine = SyncEngine::new(
            journal.config(),
            MemoryLocalStore::new(library_schema()),
            self.remote.clone(),
        )?;
        Ok(Device {
            name: name.to_string(),
            engine,
            cloud: self.clone(),
        })
    }

    /// Records currently stored in the fixture zone.
    pub fn records(&self) -> Vec<RemoteRecord> {
        self.remote.records(&zone_id())
    }

    /// The stored record with text field `name` equal to `value`.
    pub fn record_named(&self, value: &str) -> Option<RemoteRecord> {
        self.records()
            .into_iter()
            .find(|r| r.field("name").and_then(FieldValue::as_text) == Some(value))
    }
}

impl Default for SharedCloud {
    fn default() -> Self {
        Self::new()
    }
}

/// One installation of the application.
#[derive(Debug)]
pub struct Device {
    /// Name used in assertion messages.
    pub name: String,
    /// The device's engine.
    pub engine: TestEngine,
    /// The cloud this device syncs with.
    pub cloud: SharedCloud,
}

impl Device {
    /// Sets up the fixture zone.
    pub async fn setup(&self) {
        self.engine
            .setup_work_zone(ZONE)
            .await
            .unwrap_or_else(|e| panic!("{}: zone setup failed: {e}", self.name));
    }

    /// Runs one incremental session and returns its report.
    pub async fn sync(&self) -> SessionReport {
        match self.engine.perform_sync().await {
            Ok(SessionOutcome::Completed(report)) => report,
            Ok(SessionOutcome::Coalesced) => panic!("{}: unexpected coalesced session", self.name),
            Err(e) => panic!("{}: sync failed: {e}", self.name),
        }
    }

    /// Rebuilds one side from the other and returns the session report.
    ///
    /// The shared clock moves one second first, as for a local edit.
    pub async fn full_sync(&self, policy: FullSyncPolicy) -> SessionReport {
        self.cloud.clock.advance_secs(1);
        self.engine
            .perform_full_sync(policy)
            .await
            .unwrap_or_else(|e| panic!("{}: full sync failed: {e}", self.name))
    }

    /// Runs `f` on the local store and saves as the application.
    ///
    /// The shared clock moves one second first so that every edit has its
    /// own timestamp.
    pub fn commit<T>(&self, f: impl FnOnce(&mut MemoryLocalStore) -> T) -> T {
        self.cloud.clock.advance_secs(1);
        self.engine.with_local(|local| {
            let out = f(local);
            local
                .save(CommitOrigin::Application)
                .unwrap_or_else(|e| panic!("{}: local save failed: {e}", self.name));
            out
        })
    }

    /// Inserts a group.
    pub fn create_group(&self, name: &str) -> LocalRef {
        self.commit(|local| {
            let group = local.insert("Group").expect("Group is in the schema");
            set_field(local, group, "name", name);
            group
        })
    }

    /// Inserts an item, optionally inside `group`.
    pub fn create_item(&self, name: &str, group: Option<LocalRef>) -> LocalRef {
        self.commit(|local| {
            let item = local.insert("Item").expect("Item is in the schema");
            set_field(local, item, "name", name);
            if let (Some(group), Some(object)) = (group, local.object_mut(item)) {
                object.link("group", group);
            }
            item
        })
    }

    /// Changes the `name` attribute.
    pub fn rename(&self, local_ref: LocalRef, name: &str) {
        self.commit(|local| set_field(local, local_ref, "name", name));
    }

    /// Changes an item's `position` attribute.
    pub fn set_position(&self, item: LocalRef, position: i64) {
        self.commit(|local| set_field(local, item, "position", position));
    }

    /// Points an item at a group.
    pub fn link(&self, item: LocalRef, group: LocalRef) {
        self.commit(|local| {
            if let Some(object) = local.object_mut(item) {
                object.link("group", group);
            }
        });
    }

    /// Deletes an object.
    pub fn delete(&self, local_ref: LocalRef) {
        self.commit(|local| {
            local
                .delete(local_ref)
                .unwrap_or_else(|e| panic!("delete failed: {e}"));
        });
    }

    /// A copy of a local object.
    pub fn object(&self, local_ref: LocalRef) -> Option<LocalObject> {
        self.engine.with_local(|local| local.object(local_ref).cloned())
    }

    /// Every local object.
    pub fn objects(&self) -> Vec<LocalObject> {
        self.engine.with_local(|local| local.objects().cloned().collect())
    }

    /// Local objects of one entity.
    pub fn refs_of(&self, entity: &str) -> Vec<LocalRef> {
        self.engine.with_local(|local| local.refs_of(entity))
    }

    /// The first local object of `entity` named `name`.
    pub fn find(&self, entity: &str, name: &str) -> Option<LocalRef> {
        self.engine.with_local(|local| {
            local
                .objects()
                .find(|o| {
                    o.entity() == entity && o.get("name").and_then(FieldValue::as_text) == Some(name)
                })
                .map(LocalObject::local_ref)
        })
    }

    /// The text of an object's `name` attribute.
    pub fn name_of(&self, local_ref: LocalRef) -> Option<String> {
        self.object(local_ref)
            .and_then(|o| o.get("name").and_then(FieldValue::as_text).map(str::to_string))
    }

    /// The queue entry tracking a local object.
    pub fn entry(&self, local_ref: LocalRef) -> Option<SyncQueueEntry> {
        self.engine
            .queue_entries()
            .into_iter()
            .find(|e| e.local_ref == local_ref)
    }

    /// The remote id assigned to a local object.
    pub fn remote_id(&self, local_ref: LocalRef) -> Option<RecordId> {
        self.entry(local_ref).map(|e| e.remote_id)
    }

    /// The local object bound to a remote id.
    pub fn local_for(&self, remote_id: &RecordId) -> Option<LocalRef> {
        self.engine
            .queue_entries()
            .into_iter()
            .find(|e| &e.remote_id == remote_id)
            .map(|e| e.local_ref)
    }
}

fn set_field(
    local: &mut MemoryLocalStore,
    local_ref: LocalRef,
    name: &str,
    value: impl Into<FieldValue>,
) {
    if let Some(object) = local.object_mut(local_ref) {
        object.set(name, value);
    }
}

/// A metadata journal location inside a temporary directory.
///
/// The directory is removed when this value is dropped.
#[derive(Debug)]
pub struct TempJournal {
    dir: TempDir,
}

impl TempJournal {
    /// Creates a fresh temporary directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp directory"),
        }
    }

    /// Path of the journal file.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join(META_FILE_NAME)
    }

    /// Engine config pointing at this journal, with auto-sync disabled.
    pub fn config(&self) -> SyncConfig {
        SyncConfig::new()
            .with_meta_path(self.path())
            .with_auto_sync_on_save(false)
    }
}

impl Default for TempJournal {
    fn default() -> Self {
        Self::new()
    }
}
