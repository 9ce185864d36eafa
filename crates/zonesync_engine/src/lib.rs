//! # zonesync engine
//!
//! Bidirectional sync between a local object store and a remote, versioned
//! record zone.
//!
//! This crate provides:
//! - Sync queue tracking of local inserts, updates and deletes
//! - Schema-driven mapping between local objects and remote records
//! - Push with optimistic concurrency and last-writer-wins
//! - Paged pull and a two-pass merge that links forward references
//! - A single-flight session orchestrator with full-resync policies
//! - A crash-safe journal for queue entries and the change cursor
//! - In-memory local and remote stores for tests and demos
//!
//! ## Architecture
//!
//! A session runs **push, then pull, then merge**:
//! 1. Queued local changes are saved to the zone in one batch
//! 2. The change feed is read from the stored cursor
//! 3. Remote changes are merged locally and both stores are committed
//!
//! The application's store and the sync bookkeeping never share a
//! transaction. Bookkeeping lives in its own journal at a fixed path.
//!
//! ## Key Invariants
//!
//! - One queue entry per local object and per remote id
//! - A remote id never changes once assigned
//! - Entries are never dropped because a session failed
//! - The cursor only moves after a merge has been committed
//! - At most one session runs at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod cursor;
mod engine;
mod error;
mod local;
mod mapper;
mod merge;
pub mod meta;
mod push;
mod remote;
mod schema;
mod session;
mod tracker;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{default_meta_path, SyncConfig, META_FILE_NAME};
pub use cursor::ChangeCursorStore;
pub use engine::{
    FullSyncPolicy, SessionOutcome, SessionReport, SyncEngine, SyncEvent, SyncState, SyncStats,
};
pub use error::{
    LocalStoreError, LocalStoreResult, MetaError, MetaResult, RemoteError, RemoteResult,
    SyncError, SyncResult,
};
pub use local::{
    ChangedObject, CommitChanges, CommitObserver, CommitOrigin, LocalObject, LocalRef, LocalStore,
    MemoryLocalStore,
};
pub use mapper::{ApplyOutcome, MappedRecord, RecordMapper};
pub use merge::{MergeReport, PulledChanges};
pub use meta::{JournalStats, SyncMeta};
pub use push::PushReport;
pub use remote::{CallCounts, MemoryRemoteStore, RemoteStore};
pub use schema::{AttributeDescriptor, Cardinality, EntitySchema, RelationshipDescriptor, SchemaRegistry};
pub use tracker::{EntryStatus, PendingEntries, SyncQueueEntry, SyncQueueTracker};
