//! ciao-quotas — the per-tenant resource ledger.
//!
//! The ledger owns running totals (used vs. limit) for every registered
//! tenant and resource type. All mutation happens on a single background
//! task; callers talk to it through the cloneable [`Quotas`] handle.
//!
//! # Architecture
//!
//! ```text
//! Quotas (handle, Clone)
//!   └── mpsc ──► ledger task
//!                  └── tenant_id → TenantLedger { used, limits }
//! ```
//!
//! [`Quotas::consume`] never blocks: it enqueues the request and returns an
//! [`Admission`] future that resolves exactly once, after the ledger task
//! has either incremented the counters (admitted) or left them untouched
//! (denied). Requests for the same tenant are therefore strictly
//! linearized.

pub mod error;
pub mod ledger;
pub mod types;

pub use error::{QuotaError, QuotaResult};
pub use ledger::{Admission, Quotas};
pub use types::*;
