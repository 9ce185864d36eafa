//! Conflicting edits resolve to the newer one, in either direction.

use zonesync_testkit::prelude::*;

async fn shared_group(cloud: &SharedCloud) -> Vec<Device> {
    let devices = ready_devices(cloud, 2).await;
    devices[0].create_group("Inbox");
    assert_converged(cloud, &[&devices[0], &devices[1]]).await;
    devices
}

#[tokio::test]
async fn newer_remote_edit_replaces_older_local_edit() {
    let cloud = SharedCloud::new();
    let devices = shared_group(&cloud).await;
    let (phone, laptop) = (&devices[0], &devices[1]);
    let on_phone = phone.find("Group", "Inbox").unwrap();
    let on_laptop = laptop.find("Group", "Inbox").unwrap();

    phone.rename(on_phone, "Phone inbox");
    laptop.rename(on_laptop, "Laptop inbox");
    laptop.sync().await;

    let report = phone.sync().await;
    assert_eq!(report.push.stale, 1);
    assert_eq!(report.push.saved, 0);
    assert_eq!(report.merge.applied, 1);
    assert_eq!(phone.name_of(on_phone).as_deref(), Some("Laptop inbox"));
    assert!(cloud.record_named("Laptop inbox").is_some());
    assert!(cloud.record_named("Phone inbox").is_none());

    assert_converged(&cloud, &[phone, laptop]).await;
}

#[tokio::test]
async fn newer_local_edit_replaces_older_remote_edit() {
    let cloud = SharedCloud::new();
    let devices = shared_group(&cloud).await;
    let (phone, laptop) = (&devices[0], &devices[1]);
    let on_phone = phone.find("Group", "Inbox").unwrap();
    let on_laptop = laptop.find("Group", "Inbox").unwrap();

    laptop.rename(on_laptop, "Laptop inbox");
    laptop.sync().await;
    phone.rename(on_phone, "Phone inbox");

    let report = phone.sync().await;
    assert_eq!(report.push.saved, 1);
    assert_eq!(report.push.stale, 0);
    assert_eq!(phone.name_of(on_phone).as_deref(), Some("Phone inbox"));

    laptop.sync().await;
    assert_eq!(laptop.name_of(on_laptop).as_deref(), Some("Phone inbox"));
    assert_converged(&cloud, &[phone, laptop]).await;
}

#[tokio::test]
async fn edit_by_another_client_wins_over_clean_copy() {
    let cloud = SharedCloud::new();
    let devices = shared_group(&cloud).await;
    let phone = &devices[0];
    let zone = zone_id();

    let mut record = cloud.record_named("Inbox").unwrap();
    cloud.clock.advance_secs(5);
    record.fields.insert("name".into(), "Renamed elsewhere".into());
    cloud.remote.put_record(&zone, record).unwrap();

    let report = phone.sync().await;
    assert_eq!(report.merge.applied, 1);
    assert!(phone.find("Group", "Renamed elsewhere").is_some());
}
