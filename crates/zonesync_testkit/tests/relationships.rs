//! References are linked no matter which end arrives first.

use zonesync_engine::{RemoteStore, SyncConfig};
use zonesync_record::{RecordId, RemoteRecord};
use zonesync_testkit::prelude::*;

fn id(name: &str) -> RecordId {
    RecordId::new(name).unwrap()
}

// Merge walks a batch in record id order, so ids choose which end of a
// reference is applied first.
fn group(record_id: &str) -> RemoteRecord {
    RemoteRecord::new("Group", id(record_id)).with_field("name", "Inbox")
}

fn item(record_id: &str, group: &str) -> RemoteRecord {
    RemoteRecord::new("Item", id(record_id))
        .with_field("name", "pen")
        .with_reference("group", id(group))
}

async fn cloud_with_zone() -> SharedCloud {
    let cloud = SharedCloud::new();
    cloud.remote.create_zone(&zone_id()).await.unwrap();
    cloud
}

fn assert_linked(device: &Device, item_id: &str, group_id: &str) {
    let item = device.local_for(&id(item_id)).unwrap();
    let group = device.local_for(&id(group_id)).unwrap();
    assert_eq!(device.object(item).unwrap().relation("group"), Some(group));
    assert!(device.entry(item).unwrap().unresolved_refs.is_empty());
}

#[tokio::test]
async fn child_before_parent_in_one_batch() {
    let cloud = cloud_with_zone().await;
    cloud.remote.put_record(&zone_id(), item("1-pen", "2-inbox")).unwrap();
    cloud.remote.put_record(&zone_id(), group("2-inbox")).unwrap();

    let device = cloud.device("phone");
    device.setup().await;
    let report = device.sync().await;

    assert_eq!(report.merge.created, 2);
    assert_eq!(report.merge.deferred, 1);
    assert_linked(&device, "1-pen", "2-inbox");
}

#[tokio::test]
async fn parent_before_child_in_one_batch() {
    let cloud = cloud_with_zone().await;
    cloud.remote.put_record(&zone_id(), group("1-inbox")).unwrap();
    cloud.remote.put_record(&zone_id(), item("2-pen", "1-inbox")).unwrap();

    let device = cloud.device("phone");
    device.setup().await;
    let report = device.sync().await;

    assert_eq!(report.merge.created, 2);
    assert_eq!(report.merge.deferred, 0);
    assert_linked(&device, "2-pen", "1-inbox");
}

#[tokio::test]
async fn child_and_parent_on_different_pages() {
    let cloud = cloud_with_zone().await;
    cloud.remote.put_record(&zone_id(), item("1-pen", "2-inbox")).unwrap();
    cloud.remote.put_record(&zone_id(), group("2-inbox")).unwrap();

    let device = cloud.device_with_config(
        "phone",
        SyncConfig::new()
            .with_auto_sync_on_save(false)
            .with_change_page_size(1),
    );
    device.setup().await;
    let report = device.sync().await;

    assert_eq!(report.pages, 2);
    assert_linked(&device, "1-pen", "2-inbox");
}

#[tokio::test]
async fn missing_parent_is_linked_when_it_arrives() {
    let cloud = cloud_with_zone().await;
    cloud.remote.put_record(&zone_id(), item("pen", "inbox")).unwrap();

    let device = cloud.device("phone");
    device.setup().await;
    let report = device.sync().await;
    assert_eq!(report.merge.still_unresolved, 1);

    let pen = device.local_for(&id("pen")).unwrap();
    assert!(device.object(pen).unwrap().relation("group").is_none());
    assert_eq!(
        device.entry(pen).unwrap().unresolved_refs.get("group"),
        Some(&id("inbox"))
    );

    cloud.remote.put_record(&zone_id(), group("inbox")).unwrap();
    let report = device.sync().await;
    assert_eq!(report.merge.relinked, 1);
    assert_eq!(report.merge.still_unresolved, 0);
    assert_linked(&device, "pen", "inbox");
}

#[tokio::test]
async fn item_created_with_its_group_arrives_linked() {
    let cloud = SharedCloud::new();
    let devices = ready_devices(&cloud, 2).await;
    let (phone, laptop) = (&devices[0], &devices[1]);

    let inbox = phone.create_group("Inbox");
    let pen = phone.create_item("pen", Some(inbox));
    let report = phone.sync().await;
    assert_eq!(report.push.saved, 2);

    laptop.sync().await;
    let pen_id = phone.remote_id(pen).unwrap();
    let inbox_id = phone.remote_id(inbox).unwrap();
    assert_linked(laptop, pen_id.as_str(), inbox_id.as_str());
}
