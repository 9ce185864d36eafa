//! Batch save/delete outcomes.

use crate::record::{RecordId, RemoteRecord};
use serde::{Deserialize, Serialize};

/// How a batch save treats records that changed on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SavePolicy {
    /// Fail a record whose change tag no longer matches the server copy.
    #[default]
    IfServerRecordUnchanged,
    /// Overwrite regardless of the server copy.
    AllKeys,
}

/// Why a single record in a batch was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The server copy changed since it was read.
    ServerRecordChanged,
    /// The zone does not exist.
    ZoneMissing,
    /// The server refused the record.
    Rejected(String),
}

/// A per-record failure inside an otherwise completed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// The record that failed.
    pub record_id: RecordId,
    /// Failure reason.
    pub kind: FailureKind,
}

impl RecordFailure {
    /// Creates a failure record.
    pub fn new(record_id: RecordId, kind: FailureKind) -> Self {
        Self { record_id, kind }
    }

    /// Returns true for optimistic-concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        self.kind == FailureKind::ServerRecordChanged
    }
}

/// Result of a batch save/delete.
///
/// A completed batch may still carry per-record failures; records listed in
/// `saved` are returned as stored, with the server timestamp and new change
/// tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModifyOutcome {
    /// Records stored by the server.
    pub saved: Vec<RemoteRecord>,
    /// Ids removed by the server.
    pub deleted: Vec<RecordId>,
    /// Records that were not applied.
    pub failures: Vec<RecordFailure>,
}

impl ModifyOutcome {
    /// Returns true when no record failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of optimistic-concurrency conflicts.
    pub fn conflict_count(&self) -> usize {
        self.failures.iter().filter(|f| f.is_conflict()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_optimistic() {
        assert_eq!(SavePolicy::default(), SavePolicy::IfServerRecordUnchanged);
    }

    #[test]
    fn outcome_counts() {
        let mut outcome = ModifyOutcome::default();
        assert!(outcome.is_complete());

        outcome.failures.push(RecordFailure::new(
            RecordId::new("a").unwrap(),
            FailureKind::ServerRecordChanged,
        ));
        outcome.failures.push(RecordFailure::new(
            RecordId::new("b").unwrap(),
            FailureKind::Rejected("too large".into()),
        ));

        assert!(!outcome.is_complete());
        assert_eq!(outcome.conflict_count(), 1);
    }
}
