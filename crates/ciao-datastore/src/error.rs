//! Error types for the Ciao datastore.

use thiserror::Error;

/// Result type alias for datastore operations.
pub type DatastoreResult<T> = Result<T, DatastoreError>;

/// Errors that can occur during datastore operations.
#[derive(Debug, Error)]
pub enum DatastoreError {
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

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no free address: {0}")]
    AddressExhausted(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl DatastoreError {
    /// Whether the failure came from the durable tier itself rather than
    /// from the request.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            DatastoreError::Open(_)
                | DatastoreError::Transaction(_)
                | DatastoreError::Table(_)
                | DatastoreError::Read(_)
                | DatastoreError::Write(_)
                | DatastoreError::Serialize(_)
                | DatastoreError::Deserialize(_)
        )
    }
}
