//! Error types for the kinvey-store crate

use thiserror::Error;

/// Result type alias using `StoreError`
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Value could not be encoded to the persisted representation
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persisted state could not be decoded
    #[error("corrupt store data: {0}")]
    Corrupt(String),

    /// IO error from a file-backed store
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
