//! Multi-device scenario harness.
//!
//! Applies [`Mutation`]s to devices, runs sessions until nothing moves any
//! more, and compares what every device holds with what the zone holds.
//!
//! Both sides are reduced to a [`ZoneView`]: records keyed by remote id,
//! with null fields dropped and references to records that no longer exist
//! treated as absent.

use crate::fixtures::{Device, SharedCloud};
use crate::generators::Mutation;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use zonesync_engine::{EntryStatus, LocalObject, LocalRef};
use zonesync_record::{FieldValue, RecordId};

/// Rounds [`settle`] runs before giving up.
pub const MAX_ROUNDS: usize = 8;

/// Observable content of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordView {
    /// Entity type.
    pub record_type: String,
    /// Non-null fields.
    pub fields: BTreeMap<String, FieldValue>,
    /// References to records that exist.
    pub references: BTreeMap<String, RecordId>,
}

/// Observable content of a zone.
pub type ZoneView = BTreeMap<RecordId, RecordView>;

fn non_null(fields: &BTreeMap<String, FieldValue>) -> BTreeMap<String, FieldValue> {
    fields
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// What the zone holds.
pub fn remote_view(cloud: &SharedCloud) -> ZoneView {
    let records = cloud.records();
    let ids: BTreeSet<RecordId> = records.iter().map(|r| r.record_id.clone()).collect();
    records
        .into_iter()
        .map(|record| {
            let references = record
                .references
                .iter()
                .filter(|(_, target)| ids.contains(*target))
                .map(|(name, target)| (name.clone(), target.clone()))
                .collect();
            let view = RecordView {
                record_type: record.record_type.clone(),
                fields: non_null(&record.fields),
                references,
            };
            (record.record_id, view)
        })
        .collect()
}

/// What a device holds, keyed by the remote ids it has assigned or learned.
///
/// # Panics
///
/// Panics if a local object has no live queue entry.
pub fn local_view(device: &Device) -> ZoneView {
    let ids: HashMap<LocalRef, RecordId> = device
        .engine
        .queue_entries()
        .into_iter()
        .filter(|e| e.status != EntryStatus::Tombstoned)
        .map(|e| (e.local_ref, e.remote_id))
        .collect();

    device
        .objects()
        .into_iter()
        .map(|object| {
            let Some(id) = ids.get(&object.local_ref()) else {
                panic!(
                    "{}: {} {} is not tracked",
                    device.name,
                    object.entity(),
                    object.local_ref()
                );
            };
            let references = object
                .relations()
                .iter()
                .filter_map(|(name, target)| ids.get(target).map(|id| (name.clone(), id.clone())))
                .collect();
            let view = RecordView {
                record_type: object.entity().to_string(),
                fields: non_null(object.attributes()),
                references,
            };
            (id.clone(), view)
        })
        .collect()
}

/// Syncs every device in turn until a full round changes nothing.
///
/// Returns the number of rounds run, the quiet one included.
///
/// # Panics
///
/// Panics if a session fails or the devices are still exchanging changes
/// after [`MAX_ROUNDS`] rounds.
pub async fn settle(devices: &[&Device]) -> usize {
    for round in 1..=MAX_ROUNDS {
        let mut quiet = true;
        for device in devices {
            let report = device.sync().await;
            let moved = !report.push.is_empty()
                || report.merge.changed_objects() > 0
                || report.merge.relinked > 0;
            quiet &= !moved && device.engine.pending_count() == 0;
        }
        if quiet {
            return round;
        }
    }
    panic!("devices did not settle within {MAX_ROUNDS} rounds");
}

/// Settles `devices` and asserts each one mirrors the zone.
///
/// # Panics
///
/// Panics with both views rendered as JSON on the first mismatch.
pub async fn assert_converged(cloud: &SharedCloud, devices: &[&Device]) {
    settle(devices).await;
    let remote = remote_view(cloud);
    for device in devices {
        let local = local_view(device);
        if local != remote {
            panic!(
                "{} diverged from the zone\nlocal: {}\nremote: {}",
                device.name,
                render(&local),
                render(&remote)
            );
        }
    }
}

fn render(view: &ZoneView) -> String {
    serde_json::to_string_pretty(view).unwrap_or_else(|e| format!("<unrenderable: {e}>"))
}

fn pick(refs: &[LocalRef], index: usize) -> Option<LocalRef> {
    if refs.is_empty() {
        None
    } else {
        Some(refs[index % refs.len()])
    }
}

/// Applies one mutation. Indexes wrap around the objects the device holds;
/// steps that address an empty set do nothing.
pub async fn apply(devices: &[Device], mutation: &Mutation) {
    let device = &devices[mutation.device() % devices.len()];
    match mutation {
        Mutation::CreateGroup { name, .. } => {
            device.create_group(name);
        }
        Mutation::CreateItem { name, group, .. } => {
            let group = group.and_then(|i| pick(&device.refs_of("Group"), i));
            device.create_item(name, group);
        }
        Mutation::Rename { target, name, .. } => {
            let all: Vec<LocalRef> = device.objects().iter().map(LocalObject::local_ref).collect();
            if let Some(target) = pick(&all, *target) {
                device.rename(target, name);
            }
        }
        Mutation::Reposition { item, position, .. } => {
            if let Some(item) = pick(&device.refs_of("Item"), *item) {
                device.set_position(item, *position);
            }
        }
        Mutation::Link { item, group, .. } => {
            let item = pick(&device.refs_of("Item"), *item);
            let group = pick(&device.refs_of("Group"), *group);
            if let (Some(item), Some(group)) = (item, group) {
                device.link(item, group);
            }
        }
        Mutation::Delete { target, .. } => {
            let all: Vec<LocalRef> = device.objects().iter().map(LocalObject::local_ref).collect();
            if let Some(target) = pick(&all, *target) {
                device.delete(target);
            }
        }
        Mutation::Sync { .. } => {
            device.sync().await;
        }
        Mutation::FullSync { policy, .. } => {
            device.full_sync(*policy).await;
        }
    }
}

/// Creates `count` devices on `cloud` and sets up the fixture zone on each.
pub async fn ready_devices(cloud: &SharedCloud, count: usize) -> Vec<Device> {
    let mut devices = Vec::with_capacity(count);
    for i in 0..count {
        let device = cloud.device(&format!("device-{i}"));
        device.setup().await;
        devices.push(device);
    }
    devices
}

/// A single-threaded runtime for driving async scenarios from proptest.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonesync_record::RemoteRecord;

    #[test]
    fn dangling_remote_references_are_ignored() {
        let cloud = SharedCloud::new();
        let zone = crate::fixtures::zone_id();
        runtime().block_on(async {
            use zonesync_engine::RemoteStore;
            cloud.remote.create_zone(&zone).await.unwrap();
        });
        let item = RemoteRecord::new("Item", RecordId::new("item-1").unwrap())
            .with_field("name", "pen")
            .with_field("position", FieldValue::Null)
            .with_reference("group", RecordId::new("gone").unwrap());
        cloud.remote.put_record(&zone, item).unwrap();

        let view = remote_view(&cloud);
        let record = &view[&RecordId::new("item-1").unwrap()];
        assert!(record.references.is_empty());
        assert_eq!(record.fields.len(), 1);
    }

    #[tokio::test]
    async fn empty_devices_settle_in_one_round() {
        let cloud = SharedCloud::new();
        let devices = ready_devices(&cloud, 2).await;
        let refs: Vec<&Device> = devices.iter().collect();
        assert_eq!(settle(&refs).await, 1);
        assert!(local_view(&devices[0]).is_empty());
    }

    #[tokio::test]
    async fn apply_ignores_steps_without_targets() {
        let cloud = SharedCloud::new();
        let devices = ready_devices(&cloud, 1).await;
        apply(&devices, &Mutation::Delete { device: 0, target: 3 }).await;
        apply(
            &devices,
            &Mutation::Link {
                device: 0,
                item: 0,
                group: 0,
            },
        )
        .await;
        assert!(devices[0].objects().is_empty());
        assert_eq!(devices[0].engine.pending_count(), 0);
    }
}
