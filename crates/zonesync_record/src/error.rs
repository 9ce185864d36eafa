//! Error types for record construction.

use thiserror::Error;

/// Result type for record operations.
pub type RecordResult<T> = Result<T, RecordError>;

/// Errors raised when building identifiers or records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Zone names must be non-empty and free of control characters.
    #[error("invalid zone name: {0:?}")]
    InvalidZone(String),

    /// Record ids must be non-empty.
    #[error("invalid record id: {0:?}")]
    InvalidRecordId(String),

    /// A field value did not match the declared attribute kind.
    #[error("field {field} expects {expected:?}, got {actual:?}")]
    KindMismatch {
        /// Field name.
        field: String,
        /// Declared kind.
        expected: crate::FieldKind,
        /// Kind of the supplied value.
        actual: crate::FieldKind,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldKind;

    #[test]
    fn error_display() {
        let err = RecordError::InvalidZone(String::new());
        assert!(err.to_string().contains("invalid zone"));

        let err = RecordError::KindMismatch {
            field: "name".into(),
            expected: FieldKind::Text,
            actual: FieldKind::Integer,
        };
        let msg = err.to_string();
        assert!(msg.contains("name"));
        assert!(msg.contains("Text"));
    }
}
