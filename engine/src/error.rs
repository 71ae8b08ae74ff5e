//! Error types for the tillsync engine.

use crate::{EntityId, IdempotencyKey, TableName, Timestamp};
use thiserror::Error;

/// All possible errors from the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown table: {0}")]
    UnknownTable(TableName),

    #[error("entity in table '{table}' has no usable '{field}' id")]
    MissingEntityId { table: TableName, field: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Ordering and derivation outcomes
    #[error("stale event for {table}/{id}: occurred at {incoming}, stored record is from {stored}")]
    OrderingConflict {
        table: TableName,
        id: EntityId,
        incoming: Timestamp,
        stored: Timestamp,
    },

    #[error("derivation already processed: {0}")]
    DerivationConflict(IdempotencyKey),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("unsupported format version {found} (max supported: {supported})")]
    UnsupportedFormat { found: u32, supported: u32 },
}

impl Error {
    /// Whether this error describes a malformed notification or mutation,
    /// which is dropped rather than retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::UnknownTable(_)
                | Error::MissingEntityId { .. }
                | Error::InvalidPayload(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownTable("orders".into());
        assert_eq!(err.to_string(), "unknown table: orders");

        let err = Error::OrderingConflict {
            table: "stock".into(),
            id: "flour".into(),
            incoming: 1,
            stored: 2,
        };
        assert_eq!(
            err.to_string(),
            "stale event for stock/flour: occurred at 1, stored record is from 2"
        );

        let err = Error::TypeMismatch {
            field: "total".into(),
            expected: "Float".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'total': expected Float, got String"
        );
    }

    #[test]
    fn validation_classification() {
        assert!(Error::InvalidPayload("x".into()).is_validation());
        assert!(Error::MissingRequiredField("id".into()).is_validation());
        assert!(!Error::DerivationConflict("k".into()).is_validation());
        assert!(!Error::OrderingConflict {
            table: "t".into(),
            id: "1".into(),
            incoming: 1,
            stored: 2,
        }
        .is_validation());
    }
}
