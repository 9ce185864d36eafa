//! Push engine.
//!
//! Drains the sync queue against the remote store in one batch:
//!
//! 1. Pending entries are collected. Dirty entries whose object is gone
//!    become tombstones, and related objects with no entry yet are enqueued
//!    so their references resolve in the same batch.
//! 2. The server copies of all dirty records are fetched.
//! 3. A fetched record is overwritten only when the local entry is at least
//!    as fresh. Otherwise it is handed to the merge phase.
//! 4. Dirty ids with no server copy become new records.
//! 5. Saves (optimistic) and deletes go out as one batch.
//! 6. Accepted saves are marked clean with the server timestamp and
//!    accepted deletes drop their entries. Everything else stays queued.

use crate::error::SyncResult;
use crate::local::{ChangedObject, LocalRef, LocalStore};
use crate::mapper::RecordMapper;
use crate::meta::SyncMeta;
use crate::remote::RemoteStore;
use crate::session::SessionContext;
use crate::tracker::{EntryStatus, PendingEntries};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use zonesync_record::{Freshness, RecordFailure, RecordId, RemoteRecord, SavePolicy};

/// Counts from one push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushReport {
    /// Records accepted by the remote store.
    pub saved: usize,
    /// Deletions accepted by the remote store.
    pub deleted: usize,
    /// Records the remote store did not apply.
    pub failures: Vec<RecordFailure>,
    /// Dirty records left alone because the server copy was at least as fresh.
    pub stale: usize,
}

impl PushReport {
    /// Returns true if nothing was sent.
    pub fn is_empty(&self) -> bool {
        self.saved == 0 && self.deleted == 0 && self.failures.is_empty()
    }

    /// Returns true if every record in the batch was accepted.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of [`push`]: the report plus the fresher server copies for merge.
#[derive(Debug, Default)]
pub(crate) struct PushOutput {
    pub(crate) report: PushReport,
    pub(crate) stale_remote: Vec<RemoteRecord>,
}

/// Collects pending entries, repairing the queue first.
fn prepare<L: LocalStore + ?Sized>(
    local: &L,
    meta: &mut SyncMeta,
    now: DateTime<Utc>,
) -> SyncResult<PendingEntries> {
    let pending = meta.tracker().pending_entries();

    let orphaned: Vec<ChangedObject> = pending
        .dirty
        .iter()
        .filter(|e| local.object(e.local_ref).is_none())
        .map(|e| ChangedObject::new(e.local_ref, e.entity_type.clone()))
        .collect();
    if !orphaned.is_empty() {
        warn!(
            count = orphaned.len(),
            "dirty entries without a local object, converting to tombstones"
        );
        meta.tracker()
            .record_local_change(&orphaned, EntryStatus::Tombstoned, now);
    }

    let mut frontier: Vec<LocalRef> = pending
        .dirty
        .iter()
        .map(|e| e.local_ref)
        .filter(|r| local.object(*r).is_some())
        .collect();
    let mut enqueued = 0usize;
    while let Some(local_ref) = frontier.pop() {
        let Some(object) = local.object(local_ref) else {
            continue;
        };
        let Some(entity) = local.schema().entity(object.entity()) else {
            continue;
        };
        for relationship in entity.to_one_relationships() {
            let Some(target) = object.relation(&relationship.name) else {
                continue;
            };
            if meta.state().entry_for_local(target).is_some() {
                continue;
            }
            let Some(target_object) = local.object(target) else {
                continue;
            };
            meta.tracker().record_local_change(
                &[ChangedObject::new(target, target_object.entity())],
                EntryStatus::Dirty,
                now,
            );
            frontier.push(target);
            enqueued += 1;
        }
    }
    if enqueued > 0 {
        debug!(count = enqueued, "enqueued untracked relationship targets");
    }

    meta.commit()?;
    Ok(meta.tracker().pending_entries())
}

/// Pushes every pending entry.
///
/// A transport failure aborts the push with nothing marked clean.
pub(crate) async fn push<L, R>(ctx: &SessionContext<'_, L, R>) -> SyncResult<PushOutput>
where
    L: LocalStore,
    R: RemoteStore + ?Sized,
{
    let pending = {
        let local = ctx.local.lock();
        let mut meta = ctx.meta.lock();
        prepare(&*local, &mut meta, ctx.clock.now())?
    };
    if pending.is_empty() {
        debug!(zone = %ctx.zone, "nothing to push");
        return Ok(PushOutput::default());
    }

    let dirty_ids: Vec<RecordId> = pending.dirty.iter().map(|e| e.remote_id.clone()).collect();
    let mut fetched: HashMap<RecordId, RemoteRecord> = if dirty_ids.is_empty() {
        HashMap::new()
    } else {
        ctx.call("fetch_records", ctx.remote.fetch_records(ctx.zone, &dirty_ids))
            .await?
            .into_iter()
            .map(|r| (r.record_id.clone(), r))
            .collect()
    };

    let mut output = PushOutput::default();
    let mut to_save = Vec::new();
    let mut sent_at: HashMap<RecordId, DateTime<Utc>> = HashMap::new();
    {
        let local = ctx.local.lock();
        let meta = ctx.meta.lock();
        let mapper = RecordMapper::new(local.schema());
        for entry in &pending.dirty {
            let Some(object) = local.object(entry.local_ref) else {
                continue;
            };
            let base = match fetched.remove(&entry.remote_id) {
                Some(remote) => {
                    match Freshness::compare(entry.last_modified_at, remote.modified_at) {
                        Freshness::RemoteNewer => {
                            debug!(
                                record_id = %entry.remote_id,
                                "server copy is newer, leaving it to merge"
                            );
                            output.report.stale += 1;
                            output.stale_remote.push(remote);
                            continue;
                        }
                        Freshness::LocalNewer | Freshness::Same => remote,
                    }
                }
                None => RemoteRecord::new(entry.entity_type.clone(), entry.remote_id.clone()),
            };
            let mapped = mapper.to_remote(object, base, |target| {
                meta.state()
                    .entry_for_local(target)
                    .map(|e| e.remote_id.clone())
            });
            if !mapped.is_complete() {
                debug!(
                    record_id = %entry.remote_id,
                    missing = mapped.unresolved_targets.len(),
                    "pushing record with unresolved relationships"
                );
            }
            sent_at.insert(entry.remote_id.clone(), entry.last_modified_at);
            to_save.push(mapped.record);
        }
    }

    let to_delete: Vec<RecordId> = pending
        .tombstoned
        .iter()
        .map(|e| e.remote_id.clone())
        .collect();
    if to_save.is_empty() && to_delete.is_empty() {
        return Ok(output);
    }

    let save_count = to_save.len();
    let delete_count = to_delete.len();
    let outcome = ctx
        .call(
            "modify_records",
            ctx.remote.modify_records(
                ctx.zone,
                to_save,
                to_delete,
                SavePolicy::IfServerRecordUnchanged,
            ),
        )
        .await?;

    {
        let mut meta = ctx.meta.lock();
        for record in &outcome.saved {
            let unchanged_since_send = meta
                .state()
                .entry_for_remote(&record.record_id)
                .is_some_and(|e| {
                    e.status == EntryStatus::Dirty
                        && sent_at.get(&record.record_id) == Some(&e.last_modified_at)
                });
            match record.modified_at {
                Some(ts) if unchanged_since_send => {
                    meta.tracker().mark_clean(&record.record_id, ts);
                }
                Some(_) => debug!(
                    record_id = %record.record_id,
                    "entry changed during push, leaving it dirty"
                ),
                None => warn!(
                    record_id = %record.record_id,
                    "saved record has no server timestamp"
                ),
            }
        }

        let confirmed: Vec<RecordId> = outcome
            .deleted
            .iter()
            .filter(|id| {
                meta.state()
                    .entry_for_remote(id)
                    .is_some_and(|e| e.status == EntryStatus::Tombstoned)
            })
            .cloned()
            .collect();
        meta.tracker().remove_entries(&confirmed);

        for failure in &outcome.failures {
            warn!(
                zone = %ctx.zone,
                record_id = %failure.record_id,
                kind = ?failure.kind,
                "remote store did not apply record"
            );
        }

        meta.commit()?;
    }

    output.report.saved = outcome.saved.len();
    output.report.deleted = outcome.deleted.len();
    output.report.failures = outcome.failures;
    info!(
        zone = %ctx.zone,
        sent = save_count,
        deletes = delete_count,
        saved = output.report.saved,
        deleted = output.report.deleted,
        failed = output.report.failures.len(),
        stale = output.report.stale,
        "push complete"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::CommitOrigin;
    use crate::test_support::Fixture;
    use zonesync_record::{FieldValue, FailureKind};

    #[tokio::test]
    async fn new_objects_become_records() {
        let fx = Fixture::with_zone().await;
        let group = fx.create("Group", "Inbox");
        let id = fx.remote_id(group);

        let out = push(&fx.ctx()).await.unwrap();
        assert_eq!(out.report.saved, 1);
        let stored = fx.remote.record(&fx.zone, &id).unwrap();
        assert_eq!(stored.field("name"), Some(&FieldValue::from("Inbox")));

        let entry = fx.entry(group);
        assert_eq!(entry.status, EntryStatus::Clean);
        assert_eq!(Some(entry.last_modified_at), stored.modified_at);
    }

    #[tokio::test]
    async fn empty_queue_makes_no_calls() {
        let fx = Fixture::with_zone().await;
        let before = fx.remote.calls().total();
        let out = push(&fx.ctx()).await.unwrap();
        assert!(out.report.is_empty());
        assert_eq!(fx.remote.calls().total(), before);
    }

    #[tokio::test]
    async fn untracked_parent_is_pushed_with_child() {
        let fx = Fixture::with_zone().await;
        let (group, item) = {
            let mut local = fx.local.lock();
            let group = local.insert("Group").unwrap();
            local.object_mut(group).unwrap().set("name", "Work");
            local.save(CommitOrigin::Sync).unwrap();
            let item = local.insert("Item").unwrap();
            local.object_mut(item).unwrap().link("group", group);
            (group, item)
        };
        fx.track(item);

        let out = push(&fx.ctx()).await.unwrap();
        assert_eq!(out.report.saved, 2);
        let item_record = fx.remote.record(&fx.zone, &fx.remote_id(item)).unwrap();
        assert_eq!(item_record.reference("group"), Some(&fx.remote_id(group)));
    }

    #[tokio::test]
    async fn newer_local_overwrites_remote() {
        let fx = Fixture::with_zone().await;
        let group = fx.create("Group", "v1");
        push(&fx.ctx()).await.unwrap();

        fx.clock.advance_secs(10);
        fx.rename(group, "v2");
        let out = push(&fx.ctx()).await.unwrap();

        assert_eq!(out.report.saved, 1);
        let stored = fx.remote.record(&fx.zone, &fx.remote_id(group)).unwrap();
        assert_eq!(stored.field("name"), Some(&FieldValue::from("v2")));
    }

    #[tokio::test]
    async fn newer_remote_is_left_for_merge() {
        let fx = Fixture::with_zone().await;
        let group = fx.create("Group", "v1");
        push(&fx.ctx()).await.unwrap();
        let id = fx.remote_id(group);

        fx.rename(group, "local");
        fx.clock.advance_secs(10);
        let mut theirs = fx.remote.record(&fx.zone, &id).unwrap();
        theirs.fields.insert("name".into(), "theirs".into());
        fx.remote.put_record(&fx.zone, theirs).unwrap();

        let out = push(&fx.ctx()).await.unwrap();
        assert_eq!(out.report.saved, 0);
        assert_eq!(out.report.stale, 1);
        assert_eq!(out.stale_remote.len(), 1);
        assert_eq!(fx.entry(group).status, EntryStatus::Dirty);
        let stored = fx.remote.record(&fx.zone, &id).unwrap();
        assert_eq!(stored.field("name"), Some(&FieldValue::from("theirs")));
    }

    #[tokio::test]
    async fn conflict_leaves_entry_dirty() {
        let fx = Fixture::with_zone().await;
        let group = fx.create("Group", "v1");
        let id = fx.remote_id(group);
        fx.remote.arm_conflict(id.clone());

        let out = push(&fx.ctx()).await.unwrap();
        assert_eq!(out.report.failures.len(), 1);
        assert_eq!(out.report.failures[0].kind, FailureKind::ServerRecordChanged);
        assert_eq!(fx.entry(group).status, EntryStatus::Dirty);

        let out = push(&fx.ctx()).await.unwrap();
        assert!(out.report.is_complete());
        assert_eq!(fx.entry(group).status, EntryStatus::Clean);
    }

    #[tokio::test]
    async fn tombstones_delete_remote_records() {
        let fx = Fixture::with_zone().await;
        let group = fx.create("Group", "doomed");
        let id = fx.remote_id(group);
        push(&fx.ctx()).await.unwrap();

        fx.delete(group);
        let out = push(&fx.ctx()).await.unwrap();
        assert_eq!(out.report.deleted, 1);
        assert!(fx.remote.record(&fx.zone, &id).is_none());
        assert!(fx.meta.lock().state().entry_for_remote(&id).is_none());
    }

    #[tokio::test]
    async fn transport_failure_keeps_queue() {
        let fx = Fixture::with_zone().await;
        let group = fx.create("Group", "offline");
        fx.remote.set_available(false);

        assert!(push(&fx.ctx()).await.is_err());
        assert_eq!(fx.entry(group).status, EntryStatus::Dirty);
    }

    #[tokio::test]
    async fn orphaned_dirty_entry_becomes_tombstone() {
        let fx = Fixture::with_zone().await;
        let group = fx.create("Group", "ghost");
        {
            let mut local = fx.local.lock();
            local.delete(group).unwrap();
            local.save(CommitOrigin::Sync).unwrap();
        }

        let out = push(&fx.ctx()).await.unwrap();
        assert_eq!(out.report.saved, 0);
        assert_eq!(out.report.deleted, 1);
        assert!(fx.meta.lock().state().entry_for_local(group).is_none());
    }
}
