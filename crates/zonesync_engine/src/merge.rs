//! Pull and merge engine.
//!
//! [`pull`] reads the change feed from the stored cursor until the server
//! reports no more pages. [`merge`] reconciles the result against the local
//! store with last-writer-wins and commits both stores at the end.
//!
//! ## Merge order
//!
//! 1. Known records: the server copy is applied only when it is strictly
//!    newer than the entry. A tombstone older than the server copy is
//!    resurrected as a new local object.
//! 2. Unknown records of a known type create a local object and a clean
//!    entry. Unknown types are skipped.
//! 3. Records whose references did not resolve are applied a second time,
//!    so forward references inside one batch link regardless of order.
//! 4. References that still do not resolve are stored on the entry and
//!    retried by every later merge.
//! 5. Deleted ids remove the local object and its entry.
//! 6. After a read from the start of the feed, clean entries whose record
//!    was not listed are removed with their local objects. The zone was
//!    replaced or the cursor was lost, and the feed is now the whole zone.
//!    Dirty and tombstoned entries stay queued for the next push.

use crate::error::{RemoteError, SyncError, SyncResult};
use crate::local::{CommitOrigin, LocalRef, LocalStore};
use crate::mapper::{ApplyOutcome, RecordMapper};
use crate::meta::SyncMeta;
use crate::remote::RemoteStore;
use crate::session::SessionContext;
use crate::tracker::EntryStatus;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, warn};
use zonesync_record::{ChangeCursor, Freshness, RecordId, RemoteRecord};

/// Everything read from the change feed in one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PulledChanges {
    /// Latest state of each changed record.
    pub changed: BTreeMap<RecordId, RemoteRecord>,
    /// Ids deleted on the server.
    pub deleted: BTreeSet<RecordId>,
    /// Last cursor returned by the server.
    pub cursor: Option<ChangeCursor>,
    /// The stored cursor had expired and the feed was read from the start.
    pub restarted: bool,
    /// The feed was read from its beginning, so `changed` lists every live
    /// record in the zone.
    pub full: bool,
    /// Pages read.
    pub pages: usize,
}

impl PulledChanges {
    /// Adds a changed record. A later copy of the same id replaces the
    /// earlier one and cancels a deletion.
    pub fn add_changed(&mut self, record: RemoteRecord) {
        self.deleted.remove(&record.record_id);
        self.changed.insert(record.record_id.clone(), record);
    }

    /// Adds a deleted id, dropping any pending change for it.
    pub fn add_deleted(&mut self, id: RecordId) {
        self.changed.remove(&id);
        self.deleted.insert(id);
    }

    /// Adds server copies read during push. The feed's own view of an id
    /// takes precedence.
    pub fn absorb_stale(&mut self, records: Vec<RemoteRecord>) {
        for record in records {
            if !self.changed.contains_key(&record.record_id)
                && !self.deleted.contains(&record.record_id)
            {
                self.changed.insert(record.record_id.clone(), record);
            }
        }
    }

    /// Returns true if there is nothing to merge.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Counts from one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Server copies applied over existing local objects.
    pub applied: usize,
    /// Local objects created from server records.
    pub created: usize,
    /// Records that needed a second pass.
    pub deferred: usize,
    /// Records skipped because the local entry was at least as fresh.
    pub skipped_local_newer: usize,
    /// Records skipped because their type is not in the local schema.
    pub skipped_unknown_type: usize,
    /// Local objects removed by server deletions.
    pub deleted: usize,
    /// Clean entries removed because a full read no longer listed them.
    pub pruned: usize,
    /// Previously dangling references linked by this merge.
    pub relinked: usize,
    /// Entries left with dangling references.
    pub still_unresolved: usize,
}

impl MergeReport {
    /// Number of local objects written.
    pub fn changed_objects(&self) -> usize {
        self.applied + self.created + self.deleted + self.pruned
    }
}

/// Reads the change feed from the stored cursor.
///
/// An expired cursor restarts the read once from the beginning of the feed.
pub(crate) async fn pull<L, R>(ctx: &SessionContext<'_, L, R>) -> SyncResult<PulledChanges>
where
    L: LocalStore,
    R: RemoteStore + ?Sized,
{
    let start = ctx.meta.lock().cursor_store().current();
    let had_cursor = start.is_some();
    match pull_from(ctx, start).await {
        Err(SyncError::Remote(RemoteError::CursorExpired)) if had_cursor => {
            warn!(zone = %ctx.zone, "change cursor expired, reading the feed from the start");
            let mut pulled = pull_from(ctx, None).await?;
            pulled.restarted = true;
            Ok(pulled)
        }
        other => other,
    }
}

async fn pull_from<L, R>(
    ctx: &SessionContext<'_, L, R>,
    mut cursor: Option<ChangeCursor>,
) -> SyncResult<PulledChanges>
where
    L: LocalStore,
    R: RemoteStore + ?Sized,
{
    let mut pulled = PulledChanges {
        full: cursor.is_none(),
        ..PulledChanges::default()
    };
    loop {
        let batch = ctx
            .call(
                "fetch_changes",
                ctx.remote
                    .fetch_changes(ctx.zone, cursor.as_ref(), ctx.config.change_page_size),
            )
            .await?;
        pulled.pages += 1;
        debug!(
            zone = %ctx.zone,
            changed = batch.changed.len(),
            deleted = batch.deleted.len(),
            more_coming = batch.more_coming,
            "read change page"
        );

        for record in batch.changed {
            pulled.add_changed(record);
        }
        for id in batch.deleted {
            pulled.add_deleted(id);
        }
        let advanced = batch.cursor.is_some();
        if let Some(next) = batch.cursor {
            cursor = Some(next.clone());
            pulled.cursor = Some(next);
        }

        if !batch.more_coming {
            break;
        }
        if !advanced {
            warn!(zone = %ctx.zone, "server reported more changes without a cursor");
            break;
        }
    }
    Ok(pulled)
}

struct Deferred {
    record: RemoteRecord,
    local_ref: LocalRef,
    existing: bool,
}

fn apply_record<L: LocalStore + ?Sized>(
    local: &mut L,
    meta: &SyncMeta,
    mapper: &RecordMapper<'_>,
    local_ref: LocalRef,
    record: &RemoteRecord,
) -> ApplyOutcome {
    let Some(object) = local.object_mut(local_ref) else {
        return ApplyOutcome::default();
    };
    mapper.apply_to_local(object, record, |id| live_ref(meta, id))
}

fn live_ref(meta: &SyncMeta, id: &RecordId) -> Option<LocalRef> {
    meta.state()
        .entry_for_remote(id)
        .filter(|e| e.status != EntryStatus::Tombstoned)
        .map(|e| e.local_ref)
}

/// Merges pulled changes into the local store and commits.
///
/// The local store is saved first, then the metadata. If the local save
/// fails both are rolled back and the cursor does not move, so the next
/// session sees the same changes again.
pub(crate) fn merge<L: LocalStore + ?Sized>(
    local: &mut L,
    meta: &mut SyncMeta,
    pulled: PulledChanges,
    now: DateTime<Utc>,
) -> SyncResult<MergeReport> {
    let restarted = pulled.restarted;
    let cursor = pulled.cursor.clone();

    let report = match apply_changes(local, meta, pulled, now) {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "merge failed, rolling back");
            local.rollback();
            meta.rollback();
            return Err(e);
        }
    };

    if let Err(e) = local.save(CommitOrigin::Sync) {
        warn!(error = %e, "local commit failed, rolling back merge");
        local.rollback();
        meta.rollback();
        return Err(e.into());
    }

    if restarted {
        meta.cursor_store().reset();
    }
    meta.cursor_store().advance(cursor);
    if let Err(e) = meta.commit() {
        warn!(error = %e, "sync metadata commit failed after merge");
        return Err(e.into());
    }

    if report.changed_objects() > 0 || report.skipped_unknown_type > 0 {
        info!(
            applied = report.applied,
            created = report.created,
            deleted = report.deleted,
            pruned = report.pruned,
            deferred = report.deferred,
            skipped_local_newer = report.skipped_local_newer,
            skipped_unknown_type = report.skipped_unknown_type,
            still_unresolved = report.still_unresolved,
            "merge complete"
        );
    }
    Ok(report)
}

fn apply_changes<L: LocalStore + ?Sized>(
    local: &mut L,
    meta: &mut SyncMeta,
    pulled: PulledChanges,
    now: DateTime<Utc>,
) -> SyncResult<MergeReport> {
    let schema = local.schema().clone();
    let mapper = RecordMapper::new(&schema);
    let mut report = MergeReport::default();
    let mut deferred = Vec::new();
    let mut touched: HashSet<RecordId> = HashSet::new();
    let listed: HashSet<RecordId> = if pulled.full {
        pulled.changed.keys().cloned().collect()
    } else {
        HashSet::new()
    };

    for record in pulled.changed.into_values() {
        let id = record.record_id.clone();
        let stamp = record.modified_at.unwrap_or(now);

        let (local_ref, existing) = match meta.state().entry_for_remote(&id).cloned() {
            Some(entry) => {
                if Freshness::compare(entry.last_modified_at, record.modified_at).local_wins() {
                    debug!(record_id = %id, status = %entry.status, "local entry is at least as fresh");
                    report.skipped_local_newer += 1;
                    continue;
                }
                if entry.status == EntryStatus::Tombstoned
                    || local.object(entry.local_ref).is_none()
                {
                    if !schema.contains(&entry.entity_type) {
                        warn!(record_id = %id, entity = %entry.entity_type, "no schema for tracked entity");
                        report.skipped_unknown_type += 1;
                        continue;
                    }
                    let revived = local.insert(&entry.entity_type)?;
                    meta.tracker().rebind_local(&id, revived);
                    debug!(record_id = %id, "server copy is newer than local deletion, restoring");
                    report.created += 1;
                    (revived, false)
                } else {
                    report.applied += 1;
                    (entry.local_ref, true)
                }
            }
            None => {
                if !schema.contains(&record.record_type) {
                    warn!(
                        record_id = %id,
                        record_type = %record.record_type,
                        "skipping record of unknown type"
                    );
                    report.skipped_unknown_type += 1;
                    continue;
                }
                let created = local.insert(&record.record_type)?;
                // Bound before applying so later records in this batch can
                // link to it.
                meta.tracker()
                    .bind_remote(created, &record.record_type, id.clone(), stamp);
                report.created += 1;
                (created, false)
            }
        };

        touched.insert(id.clone());
        let outcome = apply_record(local, meta, &mapper, local_ref, &record);
        if outcome.is_complete() {
            let mut tracker = meta.tracker();
            tracker.mark_clean(&id, stamp);
            tracker.set_unresolved(&id, BTreeMap::new());
        } else {
            deferred.push(Deferred {
                record,
                local_ref,
                existing,
            });
        }
    }

    report.deferred = deferred.len();
    for item in deferred {
        let id = &item.record.record_id;
        let stamp = item.record.modified_at.unwrap_or(now);
        let outcome = apply_record(local, meta, &mapper, item.local_ref, &item.record);
        if !outcome.is_complete() {
            warn!(
                record_id = %id,
                existing = item.existing,
                fields = ?outcome.unresolved.keys().collect::<Vec<_>>(),
                "relationship target not found, will retry on a later merge"
            );
        }
        let mut tracker = meta.tracker();
        tracker.mark_clean(id, stamp);
        tracker.set_unresolved(id, outcome.unresolved);
    }

    report.relinked = relink(local, meta, &touched);

    for id in &pulled.deleted {
        let Some(entry) = meta.state().entry_for_remote(id).cloned() else {
            continue;
        };
        if local.object(entry.local_ref).is_some() {
            local.delete(entry.local_ref)?;
        }
        meta.tracker().remove_entries(std::slice::from_ref(id));
        report.deleted += 1;
    }

    if pulled.full {
        report.pruned = prune_unlisted(local, meta, &listed)?;
    }

    report.still_unresolved = meta.tracker().entries_with_unresolved().len();
    Ok(report)
}

/// Removes clean entries missing from a full read, with their local objects.
fn prune_unlisted<L: LocalStore + ?Sized>(
    local: &mut L,
    meta: &mut SyncMeta,
    listed: &HashSet<RecordId>,
) -> SyncResult<usize> {
    let unlisted: Vec<(RecordId, LocalRef)> = meta
        .state()
        .entries()
        .filter(|e| e.status == EntryStatus::Clean && !listed.contains(&e.remote_id))
        .map(|e| (e.remote_id.clone(), e.local_ref))
        .collect();
    if unlisted.is_empty() {
        return Ok(0);
    }

    let mut ids = Vec::with_capacity(unlisted.len());
    for (id, local_ref) in unlisted {
        if local.object(local_ref).is_some() {
            local.delete(local_ref)?;
        }
        debug!(record_id = %id, "record is no longer in the zone, removing local copy");
        ids.push(id);
    }
    meta.tracker().remove_entries(&ids);
    info!(pruned = ids.len(), "removed local objects missing from the zone");
    Ok(ids.len())
}

/// Links dangling references of entries not merged in this batch.
///
/// Entries the user has changed since are cleared instead, since the next
/// push replaces the server copy with the local relations.
fn relink<L: LocalStore + ?Sized>(
    local: &mut L,
    meta: &mut SyncMeta,
    skip: &HashSet<RecordId>,
) -> usize {
    let mut relinked = 0;
    let dangling = meta.tracker().entries_with_unresolved();
    for entry in dangling {
        if skip.contains(&entry.remote_id) {
            continue;
        }
        if entry.status != EntryStatus::Clean {
            meta.tracker().set_unresolved(&entry.remote_id, BTreeMap::new());
            continue;
        }

        let mut remaining = BTreeMap::new();
        let mut linked = Vec::new();
        for (name, target_id) in &entry.unresolved_refs {
            match live_ref(meta, target_id) {
                Some(target) => linked.push((name.clone(), target)),
                None => {
                    remaining.insert(name.clone(), target_id.clone());
                }
            }
        }
        if linked.is_empty() {
            continue;
        }

        let Some(object) = local.object_mut(entry.local_ref) else {
            continue;
        };
        for (name, target) in linked {
            debug!(record_id = %entry.remote_id, field = %name, "linked previously missing target");
            object.link(name, target);
            relinked += 1;
        }
        meta.tracker().set_unresolved(&entry.remote_id, remaining);
    }
    relinked
}
