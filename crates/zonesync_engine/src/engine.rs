//! Sync orchestrator.
//!
//! [`SyncEngine`] owns the local store, the remote handle and the sync
//! metadata, and runs sessions of push, pull and merge against one work
//! zone. At most one session runs at a time; requests that arrive while a
//! session is running are folded into one follow-up session.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::local::{ChangedObject, CommitChanges, CommitObserver, CommitOrigin, LocalStore};
use crate::merge::{merge, pull, MergeReport};
use crate::meta::{JournalStats, SyncMeta};
use crate::push::{push, PushReport};
use crate::remote::RemoteStore;
use crate::session::{timed, SessionContext};
use crate::tracker::{EntryStatus, SyncQueueEntry};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zonesync_record::{ChangeCursor, ZoneId};

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 64;

/// Phase of the running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No session is running.
    Idle,
    /// Sending queued local changes.
    Pushing,
    /// Reading the change feed.
    Pulling,
    /// Applying remote changes locally.
    Merging,
}

impl SyncState {
    /// Returns true while a session is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Idle)
    }

    /// Returns true if a new session can start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle)
    }

    fn can_transition_to(self, to: SyncState) -> bool {
        matches!(
            (self, to),
            (SyncState::Idle, SyncState::Pushing)
                | (SyncState::Pushing, SyncState::Pulling)
                | (SyncState::Pulling, SyncState::Merging)
                | (_, SyncState::Idle)
        )
    }
}

/// Running totals over the engine's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sessions that finished without a session-ending error.
    pub sessions_completed: u64,
    /// Sessions aborted by an error.
    pub sessions_failed: u64,
    /// Sync requests folded into a running session.
    pub requests_coalesced: u64,
    /// Records saved remotely.
    pub records_pushed: u64,
    /// Records deleted remotely.
    pub records_deleted_remotely: u64,
    /// Records the remote store did not apply.
    pub push_failures: u64,
    /// Local objects written from remote records.
    pub records_pulled: u64,
    /// Local objects deleted by remote deletions.
    pub records_deleted_locally: u64,
    /// End of the last completed session.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Message of the last session-ending or per-record error.
    pub last_error: Option<String>,
}

/// Result of one completed session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionReport {
    /// Push phase counts.
    pub push: PushReport,
    /// Merge phase counts.
    pub merge: MergeReport,
    /// Change feed pages read.
    pub pages: usize,
    /// Wall time of the session.
    pub duration: Duration,
}

/// Result of a sync request.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// A session ran to completion.
    Completed(SessionReport),
    /// A session was already running; one follow-up session will run after
    /// it.
    Coalesced,
}

impl SessionOutcome {
    /// The session report, if a session ran.
    pub fn report(&self) -> Option<&SessionReport> {
        match self {
            SessionOutcome::Completed(report) => Some(report),
            SessionOutcome::Coalesced => None,
        }
    }
}

/// Session notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A session is starting.
    SessionStarted,
    /// A session ended.
    SessionEnded {
        /// Counts, when the session completed.
        report: Option<SessionReport>,
        /// The session-ending error, or the per-record push failures.
        error: Option<String>,
    },
}

/// How a full resync treats existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullSyncPolicy {
    /// Wipe the zone and push every local object.
    ReplaceRemote,
    /// Delete every local object and pull the whole zone.
    ReplaceLocal,
}

struct Shared<L, R> {
    config: SyncConfig,
    local: Mutex<L>,
    remote: R,
    meta: Mutex<SyncMeta>,
    clock: Arc<dyn Clock>,
    zone: RwLock<Option<ZoneId>>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    gate: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
    observing: AtomicBool,
    stopped: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bidirectional sync engine.
///
/// Cloning yields another handle to the same engine.
pub struct SyncEngine<L, R> {
    shared: Arc<Shared<L, R>>,
}

impl<L, R> Clone for SyncEngine<L, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L, R> fmt::Debug for SyncEngine<L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("zone", &*self.shared.zone.read())
            .field("state", &*self.shared.state.read())
            .field("observing", &self.shared.observing.load(Ordering::SeqCst))
            .finish()
    }
}

impl<L, R> SyncEngine<L, R>
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
{
    /// Creates an engine, opening the metadata journal at
    /// `config.meta_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be opened or replayed.
    pub fn new(config: SyncConfig, local: L, remote: R) -> SyncResult<Self> {
        let meta = SyncMeta::open_path(&config.meta_path)?.with_compact_after(config.compact_after);
        Ok(Self::with_parts(
            config,
            local,
            remote,
            meta,
            Arc::new(SystemClock),
        ))
    }

    /// Creates an engine from an opened metadata store and a clock.
    pub fn with_parts(
        config: SyncConfig,
        local: L,
        remote: R,
        meta: SyncMeta,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                local: Mutex::new(local),
                remote,
                meta: Mutex::new(meta),
                clock,
                zone: RwLock::new(None),
                state: RwLock::new(SyncState::Idle),
                stats: RwLock::new(SyncStats::default()),
                gate: tokio::sync::Mutex::new(()),
                rerun: AtomicBool::new(false),
                observing: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates the work zone and selects it.
    ///
    /// The zone is selected only if creation succeeds. The engine then
    /// installs its commit observer on the local store and starts tracking
    /// local changes.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid zone name or a failed remote call.
    pub async fn setup_work_zone(&self, name: &str) -> SyncResult<()> {
        let zone = ZoneId::new(name)?;
        timed(
            self.shared.config.request_timeout,
            &zone,
            "create_zone",
            self.shared.remote.create_zone(&zone),
        )
        .await?;

        *self.shared.zone.write() = Some(zone.clone());
        self.shared.local.lock().set_observer(Some(self.observer()));
        self.shared.observing.store(true, Ordering::SeqCst);
        info!(zone = %zone, "work zone ready");
        Ok(())
    }

    /// Returns true if the zone holds at least one record of `record_type`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ZoneNotReady`] before a zone is set up, or the
    /// remote error.
    pub async fn discover_entities(&self, record_type: &str) -> SyncResult<bool> {
        let zone = self.zone().ok_or(SyncError::ZoneNotReady)?;
        let found = timed(
            self.shared.config.request_timeout,
            &zone,
            "query",
            self.shared.remote.query(&zone, record_type, 1),
        )
        .await?;
        debug!(zone = %zone, record_type, found = !found.is_empty(), "discovered entities");
        Ok(!found.is_empty())
    }

    /// Runs an incremental session.
    ///
    /// If a session is already running the request is coalesced: this call
    /// returns [`SessionOutcome::Coalesced`] and the running caller starts
    /// one more session when its own finishes.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ZoneNotReady`] before a zone is set up, without
    /// contacting the remote store. Otherwise returns the error that ended
    /// the session.
    pub async fn perform_sync(&self) -> SyncResult<SessionOutcome> {
        let zone = self.ready_zone()?;
        let mut last: Option<SyncResult<SessionReport>> = None;
        loop {
            let guard = match self.shared.gate.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    if let Some(result) = last {
                        return result.map(SessionOutcome::Completed);
                    }
                    self.shared.rerun.store(true, Ordering::SeqCst);
                    // The running session may have checked the flag just
                    // before it was set.
                    match self.shared.gate.try_lock() {
                        Ok(guard) => guard,
                        Err(_) => {
                            self.shared.stats.write().requests_coalesced += 1;
                            debug!(zone = %zone, "session already running, request coalesced");
                            return Ok(SessionOutcome::Coalesced);
                        }
                    }
                }
            };
            self.shared.rerun.store(false, Ordering::SeqCst);
            last = Some(self.run_session(&zone).await);
            drop(guard);

            if !self.shared.rerun.load(Ordering::SeqCst) {
                break;
            }
            debug!(zone = %zone, "running coalesced session");
        }
        match last {
            Some(result) => result.map(SessionOutcome::Completed),
            None => Ok(SessionOutcome::Coalesced),
        }
    }

    /// Rebuilds one side of the sync from the other, then runs a session.
    ///
    /// Waits for a running session to finish first. The rebuild happens
    /// inside the session, after [`SyncEvent::SessionStarted`], and a failed
    /// rebuild ends the session with its error.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ZoneNotReady`] before a zone is set up, or the
    /// first error of the rebuild or the session.
    pub async fn perform_full_sync(&self, policy: FullSyncPolicy) -> SyncResult<SessionReport> {
        let zone = self.ready_zone()?;
        let _guard = self.shared.gate.lock().await;
        info!(zone = %zone, ?policy, "starting full sync");

        self.shared.rerun.store(false, Ordering::SeqCst);
        let started = self.begin_session(&zone);
        let result = match self.rebuild(&zone, policy).await {
            Ok(()) => self.session_steps(&zone, started).await,
            Err(e) => Err(e),
        };
        let mut result = self.end_session(&zone, result);
        while self.shared.rerun.swap(false, Ordering::SeqCst) {
            debug!(zone = %zone, "running coalesced session");
            result = self.run_session(&zone).await;
        }
        result
    }

    /// Deletes and recreates the work zone, then clears the queue and the
    /// cursor. Local objects are kept.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ZoneNotReady`] before a zone is set up, or the
    /// remote or metadata error.
    pub async fn wipe_remote_and_queue(&self) -> SyncResult<()> {
        let zone = self.ready_zone()?;
        let _guard = self.shared.gate.lock().await;
        self.reset_zone(&zone).await
    }

    /// Stops tracking local commits. A running session finishes normally.
    pub fn stop_sync(&self) {
        if self.shared.observing.swap(false, Ordering::SeqCst) {
            info!("stopped observing local commits");
        }
    }

    /// Stops the engine and waits for automatically started sessions.
    ///
    /// Later sync requests fail with [`SyncError::Stopped`].
    pub async fn shutdown(&self) {
        self.stop_sync();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
        self.shared.stopped.store(true, Ordering::SeqCst);
    }

    /// The commit observer that feeds local changes into the queue.
    pub fn observer(&self) -> Arc<dyn CommitObserver> {
        Arc::new(EngineObserver {
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Runs `f` with exclusive access to the local store.
    ///
    /// Changes must be saved with [`CommitOrigin::Application`] before `f`
    /// returns to be tracked.
    pub fn with_local<T>(&self, f: impl FnOnce(&mut L) -> T) -> T {
        f(&mut self.shared.local.lock())
    }

    /// Subscribes to session notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Phase of the running session.
    pub fn state(&self) -> SyncState {
        *self.shared.state.read()
    }

    /// Running totals.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    /// Entries still waiting to be pushed.
    pub fn pending_count(&self) -> usize {
        self.shared.meta.lock().state().pending_count()
    }

    /// Stored change cursor.
    pub fn cursor(&self) -> Option<ChangeCursor> {
        self.shared.meta.lock().cursor_store().current()
    }

    /// The selected work zone.
    pub fn zone(&self) -> Option<ZoneId> {
        self.shared.zone.read().clone()
    }

    /// All queue entries.
    pub fn queue_entries(&self) -> Vec<SyncQueueEntry> {
        self.shared.meta.lock().state().entries().cloned().collect()
    }

    /// Size and shape of the metadata journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal size cannot be read.
    pub fn journal_stats(&self) -> SyncResult<JournalStats> {
        Ok(self.shared.meta.lock().stats()?)
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    fn ready_zone(&self) -> SyncResult<ZoneId> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        self.zone().ok_or(SyncError::ZoneNotReady)
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    fn transition(&self, to: SyncState) -> SyncResult<()> {
        let mut state = self.shared.state.write();
        if !state.can_transition_to(to) {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: format!("{to:?}"),
            });
        }
        *state = to;
        Ok(())
    }

    async fn reset_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        let timeout = self.shared.config.request_timeout;
        match timed(timeout, zone, "delete_zone", self.shared.remote.delete_zone(zone)).await {
            Ok(()) | Err(SyncError::Remote(RemoteError::ZoneNotFound(_))) => {}
            Err(e) => return Err(e),
        }
        timed(timeout, zone, "create_zone", self.shared.remote.create_zone(zone)).await?;

        let mut meta = self.shared.meta.lock();
        meta.tracker().clear();
        meta.cursor_store().reset();
        meta.commit()?;
        info!(zone = %zone, "wiped remote zone and sync queue");
        Ok(())
    }

    async fn rebuild(&self, zone: &ZoneId, policy: FullSyncPolicy) -> SyncResult<()> {
        match policy {
            FullSyncPolicy::ReplaceRemote => {
                self.reset_zone(zone).await?;
                let local = self.shared.local.lock();
                let mut meta = self.shared.meta.lock();
                let objects: Vec<ChangedObject> = local
                    .schema()
                    .entity_names()
                    .flat_map(|entity| {
                        local
                            .refs_of(entity)
                            .into_iter()
                            .map(move |r| ChangedObject::new(r, entity))
                    })
                    .collect();
                let queued =
                    meta.tracker()
                        .record_local_change(&objects, EntryStatus::Dirty, self.shared.clock.now());
                meta.commit()?;
                debug!(zone = %zone, queued, "queued every local object");
            }
            FullSyncPolicy::ReplaceLocal => {
                let mut local = self.shared.local.lock();
                let mut meta = self.shared.meta.lock();
                let refs: Vec<_> = local
                    .schema()
                    .entity_names()
                    .flat_map(|entity| local.refs_of(entity))
                    .collect();
                let removed = refs.len();
                let cleared = refs
                    .into_iter()
                    .try_for_each(|local_ref| local.delete(local_ref))
                    .and_then(|()| local.save(CommitOrigin::Sync));
                if let Err(e) = cleared {
                    warn!(error = %e, "could not clear local store");
                    local.rollback();
                    return Err(e.into());
                }
                meta.tracker().clear();
                meta.cursor_store().reset();
                meta.commit()?;
                debug!(zone = %zone, removed, "cleared local store and queue");
            }
        }
        Ok(())
    }

    async fn run_session(&self, zone: &ZoneId) -> SyncResult<SessionReport> {
        let started = self.begin_session(zone);
        let result = self.session_steps(zone, started).await;
        self.end_session(zone, result)
    }

    fn begin_session(&self, zone: &ZoneId) -> Instant {
        self.emit(SyncEvent::SessionStarted);
        debug!(zone = %zone, "sync session starting");
        Instant::now()
    }

    fn end_session(
        &self,
        zone: &ZoneId,
        result: SyncResult<SessionReport>,
    ) -> SyncResult<SessionReport> {
        *self.shared.state.write() = SyncState::Idle;

        let error = match &result {
            Ok(report) if !report.push.is_complete() => Some(
                SyncError::RecordsRejected {
                    count: report.push.failures.len(),
                }
                .to_string(),
            ),
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };

        {
            let mut stats = self.shared.stats.write();
            match &result {
                Ok(report) => {
                    stats.sessions_completed += 1;
                    stats.records_pushed += report.push.saved as u64;
                    stats.records_deleted_remotely += report.push.deleted as u64;
                    stats.push_failures += report.push.failures.len() as u64;
                    stats.records_pulled += (report.merge.applied + report.merge.created) as u64;
                    stats.records_deleted_locally +=
                        (report.merge.deleted + report.merge.pruned) as u64;
                    stats.last_sync_time = Some(self.shared.clock.now());
                }
                Err(_) => stats.sessions_failed += 1,
            }
            stats.last_error = error.clone();
        }

        match &result {
            Ok(report) => info!(
                zone = %zone,
                pushed = report.push.saved,
                push_failures = report.push.failures.len(),
                pulled = report.merge.applied + report.merge.created,
                deleted_locally = report.merge.deleted + report.merge.pruned,
                duration_ms = report.duration.as_millis() as u64,
                "sync session ended"
            ),
            Err(e) => warn!(zone = %zone, error = %e, "sync session failed"),
        }

        self.emit(SyncEvent::SessionEnded {
            report: result.as_ref().ok().cloned(),
            error,
        });
        result
    }

    async fn session_steps(&self, zone: &ZoneId, started: Instant) -> SyncResult<SessionReport> {
        let shared = &*self.shared;
        let ctx = SessionContext {
            local: &shared.local,
            meta: &shared.meta,
            remote: &shared.remote,
            zone,
            config: &shared.config,
            clock: &*shared.clock,
        };

        self.transition(SyncState::Pushing)?;
        let pushed = push(&ctx).await?;

        self.transition(SyncState::Pulling)?;
        let mut pulled = pull(&ctx).await?;
        let pages = pulled.pages;
        pulled.absorb_stale(pushed.stale_remote);

        self.transition(SyncState::Merging)?;
        let merged = {
            let mut local = shared.local.lock();
            let mut meta = shared.meta.lock();
            merge(&mut *local, &mut meta, pulled, shared.clock.now())?
        };

        Ok(SessionReport {
            push: pushed.report,
            merge: merged,
            pages,
            duration: started.elapsed(),
        })
    }
}

/// Records application commits in the sync queue.
struct EngineObserver<L, R> {
    shared: Weak<Shared<L, R>>,
}

impl<L, R> CommitObserver for EngineObserver<L, R>
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
{
    fn did_commit(&self, changes: &CommitChanges) {
        if changes.origin == CommitOrigin::Sync {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if !shared.observing.load(Ordering::SeqCst) {
            return;
        }

        {
            let now = shared.clock.now();
            let mut meta = shared.meta.lock();
            let mut tracker = meta.tracker();
            let dirty = tracker.record_local_change(&changes.upserted(), EntryStatus::Dirty, now);
            let tombstoned =
                tracker.record_local_change(&changes.deleted, EntryStatus::Tombstoned, now);
            debug!(dirty, tombstoned, "queued local commit");
            if let Err(e) = meta.commit() {
                warn!(error = %e, "could not persist queued changes, will retry on next commit");
            }
        }

        if !shared.config.auto_sync_on_save {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime, skipping automatic sync");
            return;
        };
        let engine = SyncEngine { shared };
        let task_engine = engine.clone();
        let task = handle.spawn(async move {
            match task_engine.perform_sync().await {
                Ok(_) => {}
                Err(e) => debug!(error = %e, "automatic sync did not complete"),
            }
        });
        let mut tasks = engine.shared.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::local::MemoryLocalStore;
    use crate::remote::MemoryRemoteStore;
    use crate::test_support::schema;
    use zonesync_record::{FieldValue, RecordId, RemoteRecord};

    type Engine = SyncEngine<MemoryLocalStore, Arc<MemoryRemoteStore>>;

    struct Harness {
        engine: Engine,
        remote: Arc<MemoryRemoteStore>,
        clock: Arc<ManualClock>,
    }

    fn harness(auto_sync: bool) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let remote = Arc::new(MemoryRemoteStore::new(clock.clone()));
        let engine = SyncEngine::with_parts(
            SyncConfig::new().with_auto_sync_on_save(auto_sync),
            MemoryLocalStore::new(schema()),
            remote.clone(),
            SyncMeta::in_memory(),
            clock.clone(),
        );
        Harness {
            engine,
            remote,
            clock,
        }
    }

    fn zone() -> ZoneId {
        ZoneId::new("Library").unwrap()
    }

    fn add_group(engine: &Engine, name: &str) -> crate::local::LocalRef {
        engine.with_local(|local| {
            let group = local.insert("Group").unwrap();
            local.object_mut(group).unwrap().set("name", name);
            local.save(CommitOrigin::Application).unwrap();
            group
        })
    }

    #[test]
    fn state_transitions() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(!SyncState::Pushing.can_start_sync());
        assert!(SyncState::Merging.is_active());
        assert!(SyncState::Idle.can_transition_to(SyncState::Pushing));
        assert!(!SyncState::Idle.can_transition_to(SyncState::Merging));
        assert!(SyncState::Pulling.can_transition_to(SyncState::Idle));
    }

    #[tokio::test]
    async fn sync_without_zone_makes_no_remote_calls() {
        let h = harness(false);
        assert!(matches!(
            h.engine.perform_sync().await,
            Err(SyncError::ZoneNotReady)
        ));
        assert!(matches!(
            h.engine.discover_entities("Group").await,
            Err(SyncError::ZoneNotReady)
        ));
        assert!(matches!(
            h.engine.perform_full_sync(FullSyncPolicy::ReplaceLocal).await,
            Err(SyncError::ZoneNotReady)
        ));
        assert_eq!(h.remote.calls().total(), 0);
    }

    #[tokio::test]
    async fn failed_zone_setup_selects_nothing() {
        let h = harness(false);
        h.remote.set_available(false);
        assert!(h.engine.setup_work_zone("Library").await.is_err());
        assert!(h.engine.zone().is_none());

        h.remote.set_available(true);
        h.engine.setup_work_zone("Library").await.unwrap();
        assert_eq!(h.engine.zone(), Some(zone()));
    }

    #[tokio::test]
    async fn local_commits_are_queued_and_pushed() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        add_group(&h.engine, "Inbox");
        assert_eq!(h.engine.pending_count(), 1);

        let outcome = h.engine.perform_sync().await.unwrap();
        assert_eq!(outcome.report().unwrap().push.saved, 1);
        assert_eq!(h.engine.pending_count(), 0);
        assert_eq!(h.remote.records(&zone()).len(), 1);
        assert!(h.engine.cursor().is_some());
    }

    #[tokio::test]
    async fn commits_before_zone_setup_are_not_tracked() {
        let h = harness(false);
        h.engine.with_local(|l| l.set_observer(Some(h.engine.observer())));
        add_group(&h.engine, "early");
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn second_sync_is_idempotent() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        add_group(&h.engine, "Inbox");
        h.engine.perform_sync().await.unwrap();

        let cursor = h.engine.cursor();
        let entries = h.engine.queue_entries();
        let outcome = h.engine.perform_sync().await.unwrap();
        let report = outcome.report().unwrap();
        assert!(report.push.is_empty());
        assert_eq!(report.merge.changed_objects(), 0);
        assert_eq!(h.engine.cursor(), cursor);
        assert_eq!(h.engine.queue_entries(), entries);
    }

    #[tokio::test]
    async fn events_bracket_each_session() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        let mut events = h.engine.subscribe();

        h.remote.set_available(false);
        assert!(h.engine.perform_sync().await.is_err());

        assert_eq!(events.recv().await.unwrap(), SyncEvent::SessionStarted);
        match events.recv().await.unwrap() {
            SyncEvent::SessionEnded { report, error } => {
                assert!(report.is_none());
                assert!(error.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.engine.state(), SyncState::Idle);
        assert_eq!(h.engine.stats().sessions_failed, 1);
    }

    #[tokio::test]
    async fn rejected_records_are_reported_in_end_event() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        let group = add_group(&h.engine, "Inbox");
        let id = h
            .engine
            .queue_entries()
            .into_iter()
            .find(|e| e.local_ref == group)
            .unwrap()
            .remote_id;
        h.remote.arm_conflict(id);
        let mut events = h.engine.subscribe();

        let outcome = h.engine.perform_sync().await.unwrap();
        assert_eq!(outcome.report().unwrap().push.failures.len(), 1);
        assert_eq!(h.engine.pending_count(), 1);

        events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            SyncEvent::SessionEnded { error, .. } => assert!(error.is_some()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn discover_entities_queries_one_record() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        assert!(!h.engine.discover_entities("Group").await.unwrap());

        h.remote
            .put_record(
                &zone(),
                RemoteRecord::new("Group", RecordId::new("g1").unwrap()).with_field("name", "G"),
            )
            .unwrap();
        assert!(h.engine.discover_entities("Group").await.unwrap());
    }

    #[tokio::test]
    async fn overlapping_requests_coalesce_into_one_follow_up() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        h.remote.set_latency(Duration::from_millis(20));

        let first = h.engine.clone();
        let running = tokio::spawn(async move { first.perform_sync().await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let a = h.engine.perform_sync().await.unwrap();
        let b = h.engine.perform_sync().await.unwrap();
        assert_eq!(a, SessionOutcome::Coalesced);
        assert_eq!(b, SessionOutcome::Coalesced);

        running.await.unwrap().unwrap();
        let stats = h.engine.stats();
        assert_eq!(stats.requests_coalesced, 2);
        assert_eq!(stats.sessions_completed, 2);
    }

    #[tokio::test]
    async fn auto_sync_runs_after_commit() {
        let h = harness(true);
        h.engine.setup_work_zone("Library").await.unwrap();
        add_group(&h.engine, "Auto");
        h.engine.shutdown().await;

        assert_eq!(h.remote.records(&zone()).len(), 1);
        assert_eq!(h.engine.pending_count(), 0);
        assert!(matches!(
            h.engine.perform_sync().await,
            Err(SyncError::Stopped)
        ));
    }

    #[tokio::test]
    async fn stop_sync_stops_tracking() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        h.engine.stop_sync();
        add_group(&h.engine, "untracked");
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn full_sync_replace_remote_pushes_everything() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        add_group(&h.engine, "mine");
        h.engine.perform_sync().await.unwrap();
        h.remote
            .put_record(
                &zone(),
                RemoteRecord::new("Group", RecordId::new("theirs").unwrap())
                    .with_field("name", "theirs"),
            )
            .unwrap();

        h.clock.advance_secs(1);
        let report = h
            .engine
            .perform_full_sync(FullSyncPolicy::ReplaceRemote)
            .await
            .unwrap();
        assert_eq!(report.push.saved, 1);

        let records = h.remote.records(&zone());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("name"), Some(&FieldValue::from("mine")));
        assert_eq!(h.engine.with_local(|l| l.len()), 1);
    }

    #[tokio::test]
    async fn full_sync_replace_local_mirrors_remote() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        add_group(&h.engine, "local only");
        for name in ["a", "b"] {
            h.remote
                .put_record(
                    &zone(),
                    RemoteRecord::new("Group", RecordId::new(name).unwrap()).with_field("name", name),
                )
                .unwrap();
        }

        let report = h
            .engine
            .perform_full_sync(FullSyncPolicy::ReplaceLocal)
            .await
            .unwrap();
        assert!(report.push.is_empty());
        assert_eq!(report.merge.created, 2);

        let mut names: Vec<String> = h.engine.with_local(|l| {
            l.objects()
                .filter_map(|o| o.get("name").and_then(|v| v.as_text()).map(str::to_string))
                .collect()
        });
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(h.engine.queue_entries().len(), 2);
    }

    #[tokio::test]
    async fn failed_rebuild_is_bracketed_by_session_events() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        add_group(&h.engine, "kept");
        let mut events = h.engine.subscribe();

        h.remote.set_available(false);
        assert!(h
            .engine
            .perform_full_sync(FullSyncPolicy::ReplaceRemote)
            .await
            .is_err());

        assert_eq!(events.recv().await.unwrap(), SyncEvent::SessionStarted);
        match events.recv().await.unwrap() {
            SyncEvent::SessionEnded { report, error } => {
                assert!(report.is_none());
                assert!(error.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
        assert_eq!(h.engine.stats().sessions_failed, 1);
        assert_eq!(h.engine.state(), SyncState::Idle);
        assert_eq!(h.engine.pending_count(), 1);
    }

    #[tokio::test]
    async fn full_sync_emits_one_session() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        add_group(&h.engine, "mine");
        let mut events = h.engine.subscribe();

        h.engine
            .perform_full_sync(FullSyncPolicy::ReplaceLocal)
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap(), SyncEvent::SessionStarted);
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::SessionEnded { error: None, .. }
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(h.engine.stats().sessions_completed, 1);
    }

    #[tokio::test]
    async fn wipe_clears_zone_queue_and_cursor() {
        let h = harness(false);
        h.engine.setup_work_zone("Library").await.unwrap();
        add_group(&h.engine, "x");
        h.engine.perform_sync().await.unwrap();

        h.engine.wipe_remote_and_queue().await.unwrap();
        assert!(h.remote.records(&zone()).is_empty());
        assert!(h.remote.zone_exists(&zone()));
        assert!(h.engine.queue_entries().is_empty());
        assert!(h.engine.cursor().is_none());
        assert_eq!(h.engine.with_local(|l| l.len()), 1);
    }
}
