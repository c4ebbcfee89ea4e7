//! Error types for the Kiln metadata store.

use kiln_core::KilnError;
use thiserror::Error;

/// Result type alias for metadata store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("invalid {kind}: {reason}")]
    Invalid { kind: &'static str, reason: String },

    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    NameExists { kind: &'static str, key: String },
}

impl From<StoreError> for KilnError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invalid { .. } => KilnError::Validation(err.to_string()),
            StoreError::NotFound { .. } => KilnError::NotFound(err.to_string()),
            StoreError::NameExists { .. } => KilnError::NameExists(err.to_string()),
            other => KilnError::Internal(other.to_string()),
        }
    }
}
