//! Error types for the key-value store.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Value not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Log changed on disk since it was loaded (loaded {loaded}, current {current})")]
    StaleLog { loaded: String, current: String },

    #[error("Invalid value extension: {0:?}")]
    InvalidExtension(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl StoreError {
    /// Whether this error means the log file could not be trusted.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            StoreError::Deserialization(_)
                | StoreError::Corruption(_)
                | StoreError::InvalidFormat(_)
                | StoreError::ChecksumMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
