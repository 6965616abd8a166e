//! Error types for the resource ledger.

use thiserror::Error;

/// Result type alias for ledger operations.
pub type QuotaResult<T> = Result<T, QuotaError>;

/// Errors that can occur while talking to the ledger.
///
/// A capacity denial is not an error; it is reported as
/// [`Decision::Denied`](crate::Decision::Denied).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("resource ledger has shut down")]
    LedgerClosed,
}
