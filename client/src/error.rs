//! Unified error handling for the client runtime.

use crate::{config::ConfigError, store::StoreError, transport::TransportError};

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Engine error: {0}")]
    Engine(#[from] tillsync_engine::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A durable write failed. Work may have been lost if this is ignored.
    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Engine is shut down")]
    Shutdown,
}

impl SyncError {
    /// Whether the error is the queue/key persistence class that callers
    /// must not swallow.
    pub fn is_persistence(&self) -> bool {
        matches!(self, SyncError::Persistence(_))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_convert() {
        let err: SyncError = tillsync_engine::Error::UnknownTable("x".into()).into();
        assert!(matches!(err, SyncError::Engine(_)));
        assert!(!err.is_persistence());
        assert_eq!(err.to_string(), "Engine error: unknown table: x");
    }

    #[test]
    fn store_errors_are_persistence() {
        let err: SyncError = StoreError::Unavailable("disk full".into()).into();
        assert!(err.is_persistence());
    }
}
