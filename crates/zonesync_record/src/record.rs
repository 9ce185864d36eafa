//! Remote records and the identifiers that scope them.

use crate::error::{RecordError, RecordResult};
use crate::value::FieldValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of a zone on the remote store.
///
/// Every record, query and change-feed operation is scoped to one zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneId(String);

impl ZoneId {
    /// Creates a zone id, rejecting empty names and control characters.
    pub fn new(name: impl Into<String>) -> RecordResult<Self> {
        let name = name.into();
        if name.trim().is_empty() || name.chars().any(char::is_control) {
            return Err(RecordError::InvalidZone(name));
        }
        Ok(Self(name))
    }

    /// Returns the zone name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Zone-scoped identifier of a remote record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps an existing record name.
    pub fn new(name: impl Into<String>) -> RecordResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(RecordError::InvalidRecordId(name));
        }
        Ok(Self(name))
    }

    /// Generates a fresh random record id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the record name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record as stored by the remote service.
///
/// `modified_at` and `change_tag` are assigned by the server on every
/// successful save. A record that has never been saved carries neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Entity type name.
    pub record_type: String,
    /// Record id.
    pub record_id: RecordId,
    /// Server-assigned modification time.
    pub modified_at: Option<DateTime<Utc>>,
    /// Server-assigned optimistic-concurrency token.
    pub change_tag: Option<String>,
    /// Scalar fields by attribute name.
    pub fields: BTreeMap<String, FieldValue>,
    /// Single-valued references by relationship name.
    pub references: BTreeMap<String, RecordId>,
}

impl RemoteRecord {
    /// Creates an empty, never-saved record.
    pub fn new(record_type: impl Into<String>, record_id: RecordId) -> Self {
        Self {
            record_type: record_type.into(),
            record_id,
            modified_at: None,
            change_tag: None,
            fields: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }

    /// Sets a scalar field, returning the record for chaining.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets a reference field, returning the record for chaining.
    pub fn with_reference(mut self, name: impl Into<String>, target: RecordId) -> Self {
        self.references.insert(name.into(), target);
        self
    }

    /// Returns a scalar field.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Returns a reference field.
    pub fn reference(&self, name: &str) -> Option<&RecordId> {
        self.references.get(name)
    }

    /// Returns true if the server has stored this record at least once.
    pub fn is_saved(&self) -> bool {
        self.modified_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_validation() {
        assert!(ZoneId::new("Library").is_ok());
        assert!(ZoneId::new("").is_err());
        assert!(ZoneId::new("   ").is_err());
        assert!(ZoneId::new("bad\nzone").is_err());
        assert_eq!(ZoneId::new("Library").unwrap().to_string(), "Library");
    }

    #[test]
    fn record_ids_are_unique() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
        assert!(RecordId::new("").is_err());
    }

    #[test]
    fn builder_sets_fields_and_references() {
        let parent = RecordId::new("group-1").unwrap();
        let record = RemoteRecord::new("Item", RecordId::new("item-1").unwrap())
            .with_field("name", "Item 1")
            .with_reference("group", parent.clone());

        assert_eq!(record.field("name"), Some(&FieldValue::from("Item 1")));
        assert_eq!(record.reference("group"), Some(&parent));
        assert!(!record.is_saved());
    }
}
