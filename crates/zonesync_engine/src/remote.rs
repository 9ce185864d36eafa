//! Remote record store collaborator.
//!
//! [`RemoteStore`] is the engine's only view of the server: zone lifecycle,
//! point fetches, batch save/delete with optimistic concurrency, queries and
//! the incremental change feed. The handle is passed to the engine at
//! construction; there is no process-wide default connection.
//!
//! [`MemoryRemoteStore`] implements the full contract in memory. Every zone
//! keeps a change log holding only the latest change per record, so a change
//! feed read always returns the current state of each touched record.

use crate::clock::Clock;
use crate::error::{RemoteError, RemoteResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use zonesync_record::{
    ChangeBatch, ChangeCursor, FailureKind, ModifyOutcome, RecordFailure, RecordId, RemoteRecord,
    SavePolicy, ZoneId,
};

/// A zone-scoped, versioned record store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Creates a zone. Creating an existing zone succeeds.
    async fn create_zone(&self, zone: &ZoneId) -> RemoteResult<()>;

    /// Deletes a zone and every record in it.
    async fn delete_zone(&self, zone: &ZoneId) -> RemoteResult<()>;

    /// Fetches records by id. Ids with no record are omitted.
    async fn fetch_records(&self, zone: &ZoneId, ids: &[RecordId])
        -> RemoteResult<Vec<RemoteRecord>>;

    /// Saves and deletes records in one batch.
    ///
    /// A completed batch reports per-record failures in the outcome.
    async fn modify_records(
        &self,
        zone: &ZoneId,
        save: Vec<RemoteRecord>,
        delete: Vec<RecordId>,
        policy: SavePolicy,
    ) -> RemoteResult<ModifyOutcome>;

    /// Returns up to `limit` records of the given type.
    async fn query(
        &self,
        zone: &ZoneId,
        record_type: &str,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRecord>>;

    /// Returns changes after `cursor`; `None` returns everything.
    async fn fetch_changes(
        &self,
        zone: &ZoneId,
        cursor: Option<&ChangeCursor>,
        limit: u32,
    ) -> RemoteResult<ChangeBatch>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn create_zone(&self, zone: &ZoneId) -> RemoteResult<()> {
        (**self).create_zone(zone).await
    }

    async fn delete_zone(&self, zone: &ZoneId) -> RemoteResult<()> {
        (**self).delete_zone(zone).await
    }

    async fn fetch_records(
        &self,
        zone: &ZoneId,
        ids: &[RecordId],
    ) -> RemoteResult<Vec<RemoteRecord>> {
        (**self).fetch_records(zone, ids).await
    }

    async fn modify_records(
        &self,
        zone: &ZoneId,
        save: Vec<RemoteRecord>,
        delete: Vec<RecordId>,
        policy: SavePolicy,
    ) -> RemoteResult<ModifyOutcome> {
        (**self).modify_records(zone, save, delete, policy).await
    }

    async fn query(
        &self,
        zone: &ZoneId,
        record_type: &str,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRecord>> {
        (**self).query(zone, record_type, limit).await
    }

    async fn fetch_changes(
        &self,
        zone: &ZoneId,
        cursor: Option<&ChangeCursor>,
        limit: u32,
    ) -> RemoteResult<ChangeBatch> {
        (**self).fetch_changes(zone, cursor, limit).await
    }
}

/// Number of calls made against a [`MemoryRemoteStore`], per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `create_zone` calls.
    pub create_zone: u64,
    /// `delete_zone` calls.
    pub delete_zone: u64,
    /// `fetch_records` calls.
    pub fetch_records: u64,
    /// `modify_records` calls.
    pub modify_records: u64,
    /// `query` calls.
    pub query: u64,
    /// `fetch_changes` calls.
    pub fetch_changes: u64,
}

impl CallCounts {
    /// Sum over all operations.
    pub fn total(&self) -> u64 {
        self.create_zone
            + self.delete_zone
            + self.fetch_records
            + self.modify_records
            + self.query
            + self.fetch_changes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    Saved(RecordId),
    Deleted(RecordId),
}

#[derive(Debug)]
struct ZoneState {
    generation: u64,
    records: HashMap<RecordId, RemoteRecord>,
    log: BTreeMap<u64, Change>,
    latest: HashMap<RecordId, u64>,
    next_seq: u64,
}

impl ZoneState {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            records: HashMap::new(),
            log: BTreeMap::new(),
            latest: HashMap::new(),
            next_seq: 1,
        }
    }

    fn log_change(&mut self, change: Change) {
        let id = match &change {
            Change::Saved(id) | Change::Deleted(id) => id.clone(),
        };
        if let Some(old) = self.latest.remove(&id) {
            self.log.remove(&old);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.log.insert(seq, change);
        self.latest.insert(id, seq);
    }
}

#[derive(Debug, Default)]
struct ServerState {
    zones: HashMap<ZoneId, ZoneState>,
    next_generation: u64,
    last_timestamp: Option<DateTime<Utc>>,
    armed_conflicts: HashSet<RecordId>,
}

impl ServerState {
    fn zone(&self, zone: &ZoneId) -> RemoteResult<&ZoneState> {
        self.zones
            .get(zone)
            .ok_or_else(|| RemoteError::ZoneNotFound(zone.to_string()))
    }

    fn next_timestamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + ChronoDuration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }
}

fn encode_cursor(generation: u64, seq: u64) -> ChangeCursor {
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&generation.to_le_bytes());
    bytes.extend_from_slice(&seq.to_le_bytes());
    ChangeCursor::from_bytes(bytes)
}

fn decode_cursor(cursor: &ChangeCursor) -> Option<(u64, u64)> {
    let bytes = cursor.as_bytes();
    if bytes.len() != 16 {
        return None;
    }
    let generation = u64::from_le_bytes(bytes[..8].try_into().ok()?);
    let seq = u64::from_le_bytes(bytes[8..].try_into().ok()?);
    Some((generation, seq))
}

/// An in-memory remote record store.
///
/// Timestamps come from the supplied clock and are forced to increase by at
/// least one millisecond per save, so every stored version is strictly newer
/// than the one it replaced.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    clock: Arc<dyn Clock>,
    state: Mutex<ServerState>,
    calls: Mutex<CallCounts>,
    available: AtomicBool,
    latency: Mutex<Duration>,
}

impl MemoryRemoteStore {
    /// Creates an empty store stamping records with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(ServerState::default()),
            calls: Mutex::new(CallCounts::default()),
            available: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Makes every call fail with [`RemoteError::Unavailable`] while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fails the next optimistic save of `id` as if another writer won.
    pub fn arm_conflict(&self, id: RecordId) {
        self.state.lock().armed_conflicts.insert(id);
    }

    /// Call counters so far.
    pub fn calls(&self) -> CallCounts {
        *self.calls.lock()
    }

    /// Returns true if the zone exists.
    pub fn zone_exists(&self, zone: &ZoneId) -> bool {
        self.state.lock().zones.contains_key(zone)
    }

    /// Reads one stored record.
    pub fn record(&self, zone: &ZoneId, id: &RecordId) -> Option<RemoteRecord> {
        self.state
            .lock()
            .zones
            .get(zone)
            .and_then(|z| z.records.get(id).cloned())
    }

    /// All stored records of a zone, ordered by id.
    pub fn records(&self, zone: &ZoneId) -> Vec<RemoteRecord> {
        let state = self.state.lock();
        let mut records: Vec<_> = state
            .zones
            .get(zone)
            .map(|z| z.records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        records
    }

    /// Stores a record directly, as another client would.
    pub fn put_record(&self, zone: &ZoneId, record: RemoteRecord) -> RemoteResult<RemoteRecord> {
        let outcome = self.apply_modify(zone, vec![record], Vec::new(), SavePolicy::AllKeys);
        outcome.saved.into_iter().next().ok_or_else(|| {
            RemoteError::Rejected(format!("record not stored in zone {zone}"))
        })
    }

    /// Deletes a record directly, as another client would.
    pub fn remove_record(&self, zone: &ZoneId, id: &RecordId) {
        self.apply_modify(zone, Vec::new(), vec![id.clone()], SavePolicy::AllKeys);
    }

    async fn enter(&self, count: impl FnOnce(&mut CallCounts)) -> RemoteResult<()> {
        count(&mut self.calls.lock());
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::unavailable("memory remote store is offline"))
        }
    }

    fn apply_modify(
        &self,
        zone: &ZoneId,
        save: Vec<RemoteRecord>,
        delete: Vec<RecordId>,
        policy: SavePolicy,
    ) -> ModifyOutcome {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut outcome = ModifyOutcome::default();

        if !state.zones.contains_key(zone) {
            outcome.failures = save
                .into_iter()
                .map(|r| r.record_id)
                .chain(delete)
                .map(|id| RecordFailure::new(id, FailureKind::ZoneMissing))
                .collect();
            return outcome;
        }

        for mut record in save {
            let id = record.record_id.clone();
            if policy == SavePolicy::IfServerRecordUnchanged {
                let armed = state.armed_conflicts.remove(&id);
                let stored_tag = state
                    .zones
                    .get(zone)
                    .and_then(|z| z.records.get(&id))
                    .map(|r| r.change_tag.clone());
                let changed = match stored_tag {
                    Some(tag) => tag != record.change_tag,
                    None => record.change_tag.is_some(),
                };
                if armed || changed {
                    debug!(zone = %zone, record_id = %id, "rejecting save of changed record");
                    outcome
                        .failures
                        .push(RecordFailure::new(id, FailureKind::ServerRecordChanged));
                    continue;
                }
            }

            let ts = state.next_timestamp(now);
            let Some(zone_state) = state.zones.get_mut(zone) else {
                continue;
            };
            record.modified_at = Some(ts);
            record.change_tag = Some(format!(
                "{}-{}",
                zone_state.generation, zone_state.next_seq
            ));
            zone_state.records.insert(id.clone(), record.clone());
            zone_state.log_change(Change::Saved(id));
            outcome.saved.push(record);
        }

        if let Some(zone_state) = state.zones.get_mut(zone) {
            for id in delete {
                if zone_state.records.remove(&id).is_some() {
                    zone_state.log_change(Change::Deleted(id.clone()));
                }
                outcome.deleted.push(id);
            }
        }

        outcome
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn create_zone(&self, zone: &ZoneId) -> RemoteResult<()> {
        self.enter(|c| c.create_zone += 1).await?;
        let mut state = self.state.lock();
        if !state.zones.contains_key(zone) {
            state.next_generation += 1;
            let generation = state.next_generation;
            state.zones.insert(zone.clone(), ZoneState::new(generation));
        }
        Ok(())
    }

    async fn delete_zone(&self, zone: &ZoneId) -> RemoteResult<()> {
        self.enter(|c| c.delete_zone += 1).await?;
        match self.state.lock().zones.remove(zone) {
            Some(_) => Ok(()),
            None => Err(RemoteError::ZoneNotFound(zone.to_string())),
        }
    }

    async fn fetch_records(
        &self,
        zone: &ZoneId,
        ids: &[RecordId],
    ) -> RemoteResult<Vec<RemoteRecord>> {
        self.enter(|c| c.fetch_records += 1).await?;
        let state = self.state.lock();
        let zone_state = state.zone(zone)?;
        Ok(ids
            .iter()
            .filter_map(|id| zone_state.records.get(id).cloned())
            .collect())
    }

    async fn modify_records(
        &self,
        zone: &ZoneId,
        save: Vec<RemoteRecord>,
        delete: Vec<RecordId>,
        policy: SavePolicy,
    ) -> RemoteResult<ModifyOutcome> {
        self.enter(|c| c.modify_records += 1).await?;
        Ok(self.apply_modify(zone, save, delete, policy))
    }

    async fn query(
        &self,
        zone: &ZoneId,
        record_type: &str,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRecord>> {
        self.enter(|c| c.query += 1).await?;
        let state = self.state.lock();
        let zone_state = state.zone(zone)?;
        let mut matches: Vec<_> = zone_state
            .records
            .values()
            .filter(|r| r.record_type == record_type)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn fetch_changes(
        &self,
        zone: &ZoneId,
        cursor: Option<&ChangeCursor>,
        limit: u32,
    ) -> RemoteResult<ChangeBatch> {
        self.enter(|c| c.fetch_changes += 1).await?;
        let state = self.state.lock();
        let zone_state = state.zone(zone)?;

        let after = match cursor {
            None => 0,
            Some(cursor) => match decode_cursor(cursor) {
                Some((generation, seq)) if generation == zone_state.generation => seq,
                _ => return Err(RemoteError::CursorExpired),
            },
        };

        let limit = limit.max(1) as usize;
        let mut batch = ChangeBatch::default();
        let mut last_seq = after;
        let mut pending = zone_state.log.range(after + 1..);

        for (seq, change) in pending.by_ref().take(limit) {
            match change {
                Change::Saved(id) => {
                    if let Some(record) = zone_state.records.get(id) {
                        batch.changed.push(record.clone());
                    }
                }
                Change::Deleted(id) => batch.deleted.push(id.clone()),
            }
            last_seq = *seq;
        }

        batch.more_coming = pending.next().is_some();
        batch.cursor = Some(encode_cursor(zone_state.generation, last_seq));
        Ok(batch)
    }
}
