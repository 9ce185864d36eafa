//! Change feed types.

use crate::record::{RecordId, RemoteRecord};
use serde::{Deserialize, Serialize};

/// Opaque position in a zone's change feed.
///
/// The bytes are produced by the remote store and stored verbatim; nothing
/// outside the remote store interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeCursor(Vec<u8>);

impl ChangeCursor {
    /// Wraps raw cursor bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw cursor bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the cursor, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// One page of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Records created or modified since the requested cursor.
    pub changed: Vec<RemoteRecord>,
    /// Ids of records deleted since the requested cursor.
    pub deleted: Vec<RecordId>,
    /// Position after this page. `None` when the server did not supply one.
    pub cursor: Option<ChangeCursor>,
    /// True when another page follows.
    pub more_coming: bool,
}

impl ChangeBatch {
    /// Returns true if the page carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Number of changed plus deleted records.
    pub fn len(&self) -> usize {
        self.changed.len() + self.deleted.len()
    }
}
