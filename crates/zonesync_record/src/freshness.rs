//! Last-writer-wins comparison.

use chrono::{DateTime, Utc};

/// Which side of a local/remote pair holds the winning copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The local copy is strictly newer.
    LocalNewer,
    /// The remote copy is strictly newer.
    RemoteNewer,
    /// Both copies carry the same timestamp.
    Same,
}

impl Freshness {
    /// Compares a local modification time with a remote one.
    ///
    /// A remote record without a server timestamp has never been stored and
    /// always loses.
    pub fn compare(local: DateTime<Utc>, remote: Option<DateTime<Utc>>) -> Self {
        match remote {
            None => Freshness::LocalNewer,
            Some(remote) if local > remote => Freshness::LocalNewer,
            Some(remote) if local < remote => Freshness::RemoteNewer,
            Some(_) => Freshness::Same,
        }
    }

    /// Returns true when the local copy wins. Ties go to the local side.
    pub fn local_wins(self) -> bool {
        !matches!(self, Freshness::RemoteNewer)
    }

    /// Returns true when the remote copy wins.
    pub fn remote_wins(self) -> bool {
        matches!(self, Freshness::RemoteNewer)
    }
}
