//! The ledger task and its handle.
//!
//! A single task owns every tenant's counters. [`Quotas`] is a cheap,
//! cloneable handle that sends messages to that task; replies come back
//! over a `oneshot` channel so each request resolves exactly once.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{QuotaError, QuotaResult};
use crate::types::*;

/// A message sent from [`Quotas`] to the ledger task.
enum LedgerMsg {
    AddTenant {
        tenant_id: String,
    },
    SetLimits {
        tenant_id: String,
        limits: Vec<QuotaLimit>,
    },
    Consume {
        tenant_id: String,
        resources: Vec<RequestedResource>,
        reply_tx: oneshot::Sender<QuotaResult<Decision>>,
    },
    Release {
        tenant_id: String,
        resources: Vec<RequestedResource>,
    },
    Usage {
        tenant_id: String,
        reply_tx: oneshot::Sender<QuotaResult<UsageSnapshot>>,
    },
    Shutdown,
}

/// Pending admission decision returned by [`Quotas::consume`].
///
/// Resolves to `Ok(Decision::Admitted)` once the counters have been
/// incremented, `Ok(Decision::Denied { .. })` when the request did not fit,
/// or an error if the tenant is unknown or the ledger has stopped.
#[must_use = "an admission does nothing unless awaited"]
pub struct Admission {
    reply_rx: oneshot::Receiver<QuotaResult<Decision>>,
}

impl Future for Admission {
    type Output = QuotaResult<Decision>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply_rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(QuotaError::LedgerClosed)))
    }
}

/// Handle to the resource ledger.
#[derive(Clone)]
pub struct Quotas {
    tx: mpsc::UnboundedSender<LedgerMsg>,
}

impl Quotas {
    /// Start the ledger task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_ledger(rx));
        debug!("resource ledger started");
        Self { tx }
    }

    /// Register a tenant with no limits. Registering twice is a no-op.
    pub fn add_tenant(&self, tenant_id: &str) {
        self.send(LedgerMsg::AddTenant {
            tenant_id: tenant_id.to_string(),
        });
    }

    /// Install limits for a tenant, registering it if needed.
    ///
    /// Types not named in `limits` keep their current limit.
    pub fn set_limits(&self, tenant_id: &str, limits: Vec<QuotaLimit>) {
        self.send(LedgerMsg::SetLimits {
            tenant_id: tenant_id.to_string(),
            limits,
        });
    }

    /// Ask to consume `resources` on behalf of `tenant_id`.
    ///
    /// Returns immediately; await the [`Admission`] for the decision.
    pub fn consume(&self, tenant_id: &str, resources: &[RequestedResource]) -> Admission {
        let (reply_tx, reply_rx) = oneshot::channel();
        // If the ledger is gone the sender is dropped with the message and
        // the admission resolves to `LedgerClosed`.
        self.send(LedgerMsg::Consume {
            tenant_id: tenant_id.to_string(),
            resources: resources.to_vec(),
            reply_tx,
        });
        Admission { reply_rx }
    }

    /// Return `resources` to a tenant. Never fails.
    ///
    /// Call exactly once per admitted [`consume`](Self::consume).
    pub fn release(&self, tenant_id: &str, resources: &[RequestedResource]) {
        self.send(LedgerMsg::Release {
            tenant_id: tenant_id.to_string(),
            resources: resources.to_vec(),
        });
    }

    /// Snapshot a tenant's counters.
    pub async fn usage(&self, tenant_id: &str) -> QuotaResult<UsageSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(LedgerMsg::Usage {
            tenant_id: tenant_id.to_string(),
            reply_tx,
        });
        reply_rx.await.unwrap_or(Err(QuotaError::LedgerClosed))
    }

    /// Stop the ledger task. Requests queued behind this one resolve to
    /// [`QuotaError::LedgerClosed`].
    pub fn shutdown(&self) {
        self.send(LedgerMsg::Shutdown);
    }

    fn send(&self, msg: LedgerMsg) {
        if self.tx.send(msg).is_err() {
            debug!("resource ledger is closed, message dropped");
        }
    }
}

/// Counters for a single tenant.
#[derive(Debug, Default)]
struct TenantLedger {
    entries: BTreeMap<ResourceType, Usage>,
}

impl TenantLedger {
    fn set_limits(&mut self, limits: &[QuotaLimit]) {
        for l in limits {
            self.entries.entry(l.kind).or_default().limit = l.limit;
        }
    }

    /// Admit all of `resources` or none of them.
    fn consume(&mut self, resources: &[RequestedResource]) -> Decision {
        let totals = sum_by_type(resources);

        for (&kind, &requested) in &totals {
            let usage = self.entries.get(&kind).copied().unwrap_or_default();
            if !usage.admits(requested) {
                return Decision::Denied {
                    resource: kind,
                    requested,
                    used: usage.used,
                    limit: usage.limit.unwrap_or(u64::MAX),
                };
            }
        }

        // Unlimited entries pin at the ceiling instead of wrapping.
        for (kind, requested) in totals {
            let usage = self.entries.entry(kind).or_default();
            usage.used = usage.used.saturating_add(requested);
        }
        Decision::Admitted
    }

    fn release(&mut self, tenant_id: &str, resources: &[RequestedResource]) {
        for (kind, amount) in sum_by_type(resources) {
            let usage = self.entries.entry(kind).or_default();
            if amount > usage.used {
                warn!(
                    %tenant_id,
                    resource = %kind,
                    amount,
                    used = usage.used,
                    "release exceeds usage, clamping to zero"
                );
            }
            usage.used = usage.used.saturating_sub(amount);
        }
    }
}

fn sum_by_type(resources: &[RequestedResource]) -> BTreeMap<ResourceType, u64> {
    let mut totals = BTreeMap::new();
    for r in resources {
        let total: &mut u64 = totals.entry(r.kind).or_default();
        *total = total.saturating_add(r.value);
    }
    totals
}

/// The ledger loop. Exits on `Shutdown` or when every handle is dropped.
async fn run_ledger(mut rx: mpsc::UnboundedReceiver<LedgerMsg>) {
    let mut tenants: HashMap<String, TenantLedger> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            LedgerMsg::AddTenant { tenant_id } => {
                tenants.entry(tenant_id).or_default();
            }
            LedgerMsg::SetLimits { tenant_id, limits } => {
                debug!(%tenant_id, count = limits.len(), "quota limits updated");
                tenants.entry(tenant_id).or_default().set_limits(&limits);
            }
            LedgerMsg::Consume {
                tenant_id,
                resources,
                reply_tx,
            } => {
                let result = match tenants.get_mut(&tenant_id) {
                    Some(ledger) => {
                        let decision = ledger.consume(&resources);
                        match &decision {
                            Decision::Admitted => debug!(%tenant_id, "resources admitted"),
                            Decision::Denied {
                                resource,
                                requested,
                                used,
                                limit,
                            } => info!(
                                %tenant_id,
                                %resource,
                                requested,
                                used,
                                limit,
                                "resources denied"
                            ),
                        }
                        Ok(decision)
                    }
                    None => Err(QuotaError::UnknownTenant(tenant_id)),
                };
                // The caller may have given up waiting; nothing to undo then
                // because a dropped admission is the caller's leak to release.
                let _ = reply_tx.send(result);
            }
            LedgerMsg::Release {
                tenant_id,
                resources,
            } => match tenants.get_mut(&tenant_id) {
                Some(ledger) => ledger.release(&tenant_id, &resources),
                None => warn!(%tenant_id, "release for unknown tenant ignored"),
            },
            LedgerMsg::Usage {
                tenant_id,
                reply_tx,
            } => {
                let result = tenants
                    .get(&tenant_id)
                    .map(|ledger| ledger.entries.clone())
                    .ok_or(QuotaError::UnknownTenant(tenant_id));
                let _ = reply_tx.send(result);
            }
            LedgerMsg::Shutdown => break,
        }
    }

    info!("resource ledger stopped");
}
