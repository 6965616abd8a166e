//! Controller error types.

use ciao_datastore::DatastoreError;
use ciao_quotas::{QuotaError, ResourceType};
use thiserror::Error;

/// Coarse error taxonomy callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A referenced tenant, workload, volume, pool or instance does not exist.
    NotFound,
    /// Duplicate name, address already mapped, or similar.
    Conflict,
    /// Admission denied. The caller may resubmit later.
    QuotaExceeded,
    /// Durable store or volume service failure.
    DependencyFailure,
    /// Internal inconsistency.
    Invariant,
}

/// Errors returned by the instance lifecycle controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("instance name already in use: {0}")]
    NameInUse(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no concentrator for subnet {subnet} of tenant {tenant_id}")]
    NoConcentrator { tenant_id: String, subnet: String },

    #[error("quota exceeded for {resource}: requested {requested}, used {used}, limit {limit}")]
    QuotaExceeded {
        resource: ResourceType,
        requested: u64,
        used: u64,
        limit: u64,
    },

    #[error("volume service error: {0}")]
    Volume(anyhow::Error),

    #[error("failed to encode start document: {0}")]
    Encode(String),

    #[error("datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("quota ledger error: {0}")]
    Quota(#[from] QuotaError),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl ControllerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ControllerError::NotFound(_) => ErrorClass::NotFound,
            ControllerError::NameInUse(_) | ControllerError::Conflict(_) => ErrorClass::Conflict,
            // The concentrator is provisioned elsewhere; until then the
            // request cannot proceed.
            ControllerError::NoConcentrator { .. } => ErrorClass::DependencyFailure,
            ControllerError::QuotaExceeded { .. } => ErrorClass::QuotaExceeded,
            ControllerError::Volume(_) => ErrorClass::DependencyFailure,
            ControllerError::Encode(_) | ControllerError::Invariant(_) => ErrorClass::Invariant,
            ControllerError::Datastore(e) => match e {
                DatastoreError::NotFound(_) => ErrorClass::NotFound,
                DatastoreError::Conflict(_) | DatastoreError::Invalid(_) => ErrorClass::Conflict,
                DatastoreError::Invariant(_) => ErrorClass::Invariant,
                _ => ErrorClass::DependencyFailure,
            },
            ControllerError::Quota(e) => match e {
                QuotaError::UnknownTenant(_) => ErrorClass::NotFound,
                QuotaError::LedgerClosed => ErrorClass::DependencyFailure,
            },
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
