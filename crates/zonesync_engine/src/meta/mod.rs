//! Sync metadata store.
//!
//! Queue entries and the change cursor live in a private journal that is
//! never shared with the application's object store. Mutations accumulate
//! in memory and reach the journal as one frame per [`SyncMeta::commit`].
//!
//! ## Recovery
//!
//! Opening a journal replays its frames in order. A torn trailing frame
//! (a crash during append) is dropped and the file is rewritten without it.
//! A read-only open drops the frame from the replay but leaves the file as
//! it is.
//!
//! A file journal has one writer at a time. [`SyncMeta::open_path`] fails
//! with [`MetaError::Locked`](crate::MetaError::Locked) while another store
//! holds the same path.

mod backend;
mod journal;
mod state;

pub use backend::{FileMetaBackend, MemoryMetaBackend, MetaBackend};
pub use journal::{JOURNAL_MAGIC, JOURNAL_VERSION};
pub use state::{MetaOp, MetaState};

use crate::cursor::ChangeCursorStore;
use crate::error::MetaResult;
use crate::tracker::SyncQueueTracker;
use journal::{decode_frames, encode_frame, Frame};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// Default number of frames between compactions.
const DEFAULT_COMPACT_AFTER: usize = 512;

/// Size and shape of the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStats {
    /// Journal size in bytes.
    pub bytes: u64,
    /// Frames in the journal.
    pub frames: usize,
    /// Uncommitted operations.
    pub pending_ops: usize,
}

/// The journal-backed owner of all sync bookkeeping.
pub struct SyncMeta {
    backend: Box<dyn MetaBackend>,
    durable: MetaState,
    state: MetaState,
    pending: Vec<MetaOp>,
    frames: usize,
    compact_after: usize,
}

impl SyncMeta {
    /// Opens a journal and replays it.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read, or if a frame other
    /// than the last one is damaged.
    pub fn open(backend: impl MetaBackend + 'static) -> MetaResult<Self> {
        let mut backend: Box<dyn MetaBackend> = Box::new(backend);
        let data = backend.read_all()?;
        let replay = decode_frames(&data)?;

        let mut state = MetaState::default();
        for frame in &replay.frames {
            match frame {
                Frame::Batch(ops) => ops.iter().for_each(|op| state.apply(op)),
                Frame::Snapshot(snapshot) => state = MetaState::from_snapshot(snapshot.clone()),
            }
        }

        if replay.torn_tail {
            warn!(
                dropped_bytes = data.len() - replay.valid_len,
                "dropping torn frame at end of sync journal"
            );
            if backend.is_writable() {
                backend.replace(&data[..replay.valid_len])?;
            }
        }

        debug!(
            frames = replay.frames.len(),
            entries = state.len(),
            "opened sync journal"
        );

        Ok(Self {
            backend,
            durable: state.clone(),
            state,
            pending: Vec::new(),
            frames: replay.frames.len(),
            compact_after: DEFAULT_COMPACT_AFTER,
        })
    }

    /// Opens the journal file at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or replayed.
    pub fn open_path(path: &Path) -> MetaResult<Self> {
        Self::open(FileMetaBackend::open_with_create_dirs(path)?)
    }

    /// Opens an existing journal file for inspection.
    ///
    /// The file is never written. [`commit`](Self::commit) and
    /// [`compact`](Self::compact) fail on the returned store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be replayed.
    pub fn open_path_read_only(path: &Path) -> MetaResult<Self> {
        Self::open(FileMetaBackend::open_read_only(path)?)
    }

    /// Creates an empty store over a fresh in-memory journal.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryMetaBackend::new()),
            durable: MetaState::default(),
            state: MetaState::default(),
            pending: Vec::new(),
            frames: 0,
            compact_after: DEFAULT_COMPACT_AFTER,
        }
    }

    /// Sets how many frames trigger an automatic compaction.
    pub fn with_compact_after(mut self, frames: usize) -> Self {
        self.compact_after = frames.max(1);
        self
    }

    /// Current state, including uncommitted mutations.
    pub fn state(&self) -> &MetaState {
        &self.state
    }

    /// Queue tracker view over this store.
    pub fn tracker(&mut self) -> SyncQueueTracker<'_> {
        SyncQueueTracker::new(self)
    }

    /// Cursor view over this store.
    pub fn cursor_store(&mut self) -> ChangeCursorStore<'_> {
        ChangeCursorStore::new(self)
    }

    /// Returns true if there are uncommitted mutations.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn apply(&mut self, op: MetaOp) {
        self.state.apply(&op);
        self.pending.push(op);
    }

    /// Writes all pending mutations as one frame and syncs it.
    ///
    /// On failure the mutations stay pending, so a later commit retries
    /// them.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded, written or synced.
    pub fn commit(&mut self) -> MetaResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let frame = encode_frame(&Frame::Batch(self.pending.clone()))?;
        self.backend.append(&frame)?;
        self.backend.sync()?;

        self.durable = self.state.clone();
        self.pending.clear();
        self.frames += 1;

        if self.frames > self.compact_after {
            if let Err(e) = self.compact() {
                warn!(error = %e, "sync journal compaction failed");
            }
        }
        Ok(())
    }

    /// Discards uncommitted mutations, restoring the last durable state.
    pub fn rollback(&mut self) {
        if !self.pending.is_empty() {
            debug!(ops = self.pending.len(), "rolling back sync metadata");
        }
        self.state = self.durable.clone();
        self.pending.clear();
    }

    /// Rewrites the journal as a single snapshot of the durable state.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be encoded or written.
    pub fn compact(&mut self) -> MetaResult<()> {
        let frame = encode_frame(&Frame::Snapshot(self.durable.snapshot()))?;
        self.backend.replace(&frame)?;
        debug!(
            previous_frames = self.frames,
            bytes = frame.len(),
            "compacted sync journal"
        );
        self.frames = 1;
        Ok(())
    }

    /// Size and shape of the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn stats(&self) -> MetaResult<JournalStats> {
        Ok(JournalStats {
            bytes: self.backend.size()?,
            frames: self.frames,
            pending_ops: self.pending.len(),
        })
    }
}

impl fmt::Debug for SyncMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncMeta")
            .field("entries", &self.state.len())
            .field("pending_ops", &self.pending.len())
            .field("frames", &self.frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{ChangedObject, LocalRef};
    use crate::tracker::EntryStatus;
    use chrono::Utc;
    use tempfile::tempdir;
    use zonesync_record::ChangeCursor;

    fn dirty(meta: &mut SyncMeta) -> LocalRef {
        let local_ref = LocalRef::new();
        meta.tracker().record_local_change(
            &[ChangedObject::new(local_ref, "Item")],
            EntryStatus::Dirty,
            Utc::now(),
        );
        local_ref
    }

    #[test]
    fn committed_state_survives_reopen() {
        let backend = MemoryMetaBackend::new();
        let mut meta = SyncMeta::open(backend.clone()).unwrap();
        let local_ref = dirty(&mut meta);
        meta.cursor_store()
            .advance(Some(ChangeCursor::from_bytes(vec![1, 2])));
        meta.commit().unwrap();

        let reopened = SyncMeta::open(backend).unwrap();
        assert!(reopened.state().entry_for_local(local_ref).is_some());
        assert_eq!(
            reopened.state().cursor(),
            Some(&ChangeCursor::from_bytes(vec![1, 2]))
        );
    }

    #[test]
    fn uncommitted_state_is_lost_on_reopen() {
        let backend = MemoryMetaBackend::new();
        let mut meta = SyncMeta::open(backend.clone()).unwrap();
        dirty(&mut meta);
        assert!(meta.has_pending());
        drop(meta);

        let reopened = SyncMeta::open(backend).unwrap();
        assert!(reopened.state().is_empty());
    }

    #[test]
    fn rollback_restores_durable_state() {
        let mut meta = SyncMeta::in_memory();
        let kept = dirty(&mut meta);
        meta.commit().unwrap();

        let dropped = dirty(&mut meta);
        meta.rollback();

        assert!(meta.state().entry_for_local(kept).is_some());
        assert!(meta.state().entry_for_local(dropped).is_none());
        assert!(!meta.has_pending());
    }

    #[test]
    fn failed_commit_keeps_pending_ops() {
        let backend = MemoryMetaBackend::new();
        let mut meta = SyncMeta::open(backend.clone()).unwrap();
        let local_ref = dirty(&mut meta);

        backend.set_fail_writes(true);
        assert!(meta.commit().is_err());
        assert!(meta.has_pending());
        assert!(meta.state().entry_for_local(local_ref).is_some());

        backend.set_fail_writes(false);
        meta.commit().unwrap();
        let reopened = SyncMeta::open(backend).unwrap();
        assert!(reopened.state().entry_for_local(local_ref).is_some());
    }

    #[test]
    fn torn_tail_is_dropped_and_truncated() {
        let backend = MemoryMetaBackend::new();
        let mut meta = SyncMeta::open(backend.clone()).unwrap();
        let local_ref = dirty(&mut meta);
        meta.commit().unwrap();
        let good_len = backend.data().len();

        let mut data = backend.data();
        data.extend_from_slice(&JOURNAL_MAGIC);
        data.extend_from_slice(&[1, 0]);
        let torn = MemoryMetaBackend::with_data(data);

        let reopened = SyncMeta::open(torn.clone()).unwrap();
        assert!(reopened.state().entry_for_local(local_ref).is_some());
        assert_eq!(torn.data().len(), good_len);
    }

    #[test]
    fn compaction_keeps_state_and_shrinks_frames() {
        let backend = MemoryMetaBackend::new();
        let mut meta = SyncMeta::open(backend.clone()).unwrap().with_compact_after(3);
        let mut refs = Vec::new();
        for _ in 0..5 {
            refs.push(dirty(&mut meta));
            meta.commit().unwrap();
        }
        assert!(meta.stats().unwrap().frames <= 3);

        let reopened = SyncMeta::open(backend).unwrap();
        assert_eq!(reopened.state().len(), 5);
        for r in refs {
            assert!(reopened.state().entry_for_local(r).is_some());
        }
    }

    #[test]
    fn file_journal_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zonesync").join("sync-meta.journal");

        let mut meta = SyncMeta::open_path(&path).unwrap();
        let local_ref = dirty(&mut meta);
        meta.commit().unwrap();
        meta.compact().unwrap();
        drop(meta);

        let reopened = SyncMeta::open_path(&path).unwrap();
        assert!(reopened.state().entry_for_local(local_ref).is_some());
        assert_eq!(reopened.stats().unwrap().frames, 1);
    }

    #[test]
    fn second_open_of_a_file_journal_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync-meta.journal");

        let mut owner = SyncMeta::open_path(&path).unwrap();
        let err = SyncMeta::open_path(&path).unwrap_err();
        assert!(matches!(err, crate::MetaError::Locked { .. }));

        // The owner's commits still land in the journal it holds.
        let local_ref = dirty(&mut owner);
        owner.commit().unwrap();
        drop(owner);

        let reopened = SyncMeta::open_path(&path).unwrap();
        assert!(reopened.state().entry_for_local(local_ref).is_some());
    }

    #[test]
    fn read_only_open_keeps_a_torn_tail_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync-meta.journal");

        let mut meta = SyncMeta::open_path(&path).unwrap();
        let local_ref = dirty(&mut meta);
        meta.commit().unwrap();
        drop(meta);

        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&JOURNAL_MAGIC);
        std::fs::write(&path, &data).unwrap();

        let mut inspected = SyncMeta::open_path_read_only(&path).unwrap();
        assert!(inspected.state().entry_for_local(local_ref).is_some());
        assert_eq!(std::fs::read(&path).unwrap(), data);

        dirty(&mut inspected);
        assert!(matches!(
            inspected.commit(),
            Err(crate::MetaError::ReadOnly)
        ));
        assert!(inspected.compact().is_err());
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }
}
