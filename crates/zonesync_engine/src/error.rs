//! Error types for the sync engine and its collaborators.

use crate::local::LocalRef;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use zonesync_record::RecordError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for remote store calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Result type for metadata journal operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Result type for local store operations.
pub type LocalStoreResult<T> = Result<T, LocalStoreError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No work zone has been set up yet.
    #[error("work zone is not set up")]
    ZoneNotReady,

    /// A remote call failed as a whole.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The sync metadata journal could not be read or written.
    #[error("metadata error: {0}")]
    Metadata(#[from] MetaError),

    /// The local object store rejected an operation.
    #[error("local store error: {0}")]
    LocalStore(#[from] LocalStoreError),

    /// Invalid zone name or record id.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// Some records in a batch were not applied by the remote store.
    #[error("{count} record(s) were not accepted by the remote store")]
    RecordsRejected {
        /// Number of failed records.
        count: usize,
    },

    /// A remote call did not complete within the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The engine has been stopped.
    #[error("sync engine stopped")]
    Stopped,

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl SyncError {
    /// Returns true if running another session may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Timeout => true,
            SyncError::RecordsRejected { .. } => true,
            SyncError::LocalStore(LocalStoreError::CommitFailed(_)) => true,
            _ => false,
        }
    }
}

/// Errors reported by a remote record store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The service could not be reached.
    #[error("remote store unavailable: {message}")]
    Unavailable {
        /// Error message.
        message: String,
    },

    /// The zone does not exist.
    #[error("zone not found: {0}")]
    ZoneNotFound(String),

    /// The change cursor is no longer valid for this zone.
    #[error("change cursor expired")]
    CursorExpired,

    /// The service did not answer in time.
    #[error("remote call timed out")]
    Timeout,

    /// The request was refused.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Creates an availability error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Unavailable { .. } | RemoteError::Timeout | RemoteError::CursorExpired
        )
    }
}

/// Errors raised by the sync metadata journal.
#[derive(Error, Debug)]
pub enum MetaError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame failed validation before the end of the journal.
    #[error("journal corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Byte offset of the bad frame.
        offset: u64,
        /// What was wrong.
        reason: String,
    },

    /// The journal was written by an unknown format version.
    #[error("unsupported journal version {0}")]
    UnsupportedVersion(u16),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Another process holds the journal's lock file.
    #[error("sync journal {} is locked by another process", path.display())]
    Locked {
        /// Journal path.
        path: PathBuf,
    },

    /// The journal was opened for reading only.
    #[error("sync journal is open read-only")]
    ReadOnly,
}

impl MetaError {
    pub(crate) fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            reason: reason.into(),
        }
    }
}

/// Errors raised by a local object store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocalStoreError {
    /// The entity type is not part of the schema.
    #[error("unknown entity type: {0}")]
    UnknownEntity(String),

    /// No live object has this reference.
    #[error("unknown object: {0}")]
    UnknownObject(LocalRef),

    /// The saved transaction could not be committed.
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::from(RemoteError::unavailable("offline")).is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::RecordsRejected { count: 2 }.is_retryable());
        assert!(!SyncError::ZoneNotReady.is_retryable());
        assert!(!SyncError::from(RemoteError::Rejected("quota".into())).is_retryable());
        assert!(!SyncError::Stopped.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::ZoneNotReady;
        assert_eq!(err.to_string(), "work zone is not set up");

        let err = SyncError::from(MetaError::corrupted(42, "bad magic"));
        assert!(err.to_string().contains("42"));
        assert!(err.to_string().contains("bad magic"));

        let err = SyncError::InvalidStateTransition {
            from: "Idle".into(),
            to: "Merging".into(),
        };
        assert!(err.to_string().contains("Merging"));
    }
}
