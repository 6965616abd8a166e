//! Subcommand implementations.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use ciao_controller::ControllerConfig;
use ciao_controller::network::random_mac;
use ciao_controller::quotas::populate;
use ciao_datastore::{Datastore, DatastoreError, Workload, WorkloadId};
use ciao_quotas::{QuotaLimit, Quotas, ResourceType, UsageSnapshot};
use tracing::{info, warn};

fn open(config: &ControllerConfig) -> anyhow::Result<Datastore> {
    let path = &config.datastore.path;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let ds = Datastore::open(path).with_context(|| format!("opening datastore {}", path.display()))?;
    info!(path = %path.display(), "datastore opened");
    Ok(ds)
}

pub async fn init(config: &ControllerConfig) -> anyhow::Result<()> {
    let ds = open(config)?;
    let id = ensure_cnci_workload(&ds, config).await?;
    println!("{id}");
    Ok(())
}

pub async fn seed_workloads(config: &ControllerConfig, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let workloads: Vec<Workload> =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;
    let ds = open(config)?;
    let added = seed(&ds, workloads).await?;
    println!("{added} workloads added");
    Ok(())
}

pub async fn set_quotas(config: &ControllerConfig, tenant_id: &str, limits: Vec<QuotaLimit>) -> anyhow::Result<()> {
    let ds = open(config)?;
    let stored = store_quotas(&ds, config, tenant_id, limits).await?;
    println!("{}", serde_json::to_string_pretty(&stored)?);
    Ok(())
}

pub async fn check(config: &ControllerConfig) -> anyhow::Result<()> {
    let ds = open(config)?;
    let usage = verify(&ds).await?;
    println!("{}", serde_json::to_string_pretty(&usage)?);
    Ok(())
}

/// The stored concentrator workload, generated from the config if there is
/// none yet.
async fn ensure_cnci_workload(ds: &Datastore, config: &ControllerConfig) -> anyhow::Result<WorkloadId> {
    if let Some(existing) = ds
        .workloads()
        .list()
        .await
        .into_iter()
        .find(|w| w.requirements.network_node)
    {
        info!(workload_id = %existing.id, "concentrator workload already present");
        return Ok(existing.id);
    }
    Ok(ds.generate_cnci_workload(&config.cnci.workload_spec()).await?)
}

/// Add workloads, skipping IDs that are already stored. Returns how many were
/// added.
async fn seed(ds: &Datastore, workloads: Vec<Workload>) -> anyhow::Result<usize> {
    let mut added = 0;
    for workload in workloads {
        let id = workload.id.clone();
        match ds.add_workload(workload).await {
            Ok(()) => added += 1,
            Err(DatastoreError::Conflict(_)) => warn!(workload_id = %id, "workload exists, skipped"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(added)
}

/// Merge `limits` into the tenant's stored quotas, creating the tenant if
/// needed. Returns the stored set.
async fn store_quotas(
    ds: &Datastore,
    config: &ControllerConfig,
    tenant_id: &str,
    limits: Vec<QuotaLimit>,
) -> anyhow::Result<Vec<QuotaLimit>> {
    if ds.tenants().get(tenant_id).await.is_none() {
        let mut tenant = ds
            .add_tenant(tenant_id, &random_mac(), config.network.tenant_subnet_bits)
            .await?;
        tenant.quotas = config.quotas.default.limits();
        ds.tenants().update(&tenant).await?;
    }

    let stored = ds
        .tenants()
        .modify(tenant_id, |t| {
            for limit in &limits {
                match t.quotas.iter_mut().find(|q| q.kind == limit.kind) {
                    Some(existing) => existing.limit = limit.limit,
                    None => t.quotas.push(*limit),
                }
            }
            Ok(t.quotas.clone())
        })
        .await?;
    info!(%tenant_id, limits = stored.len(), "tenant quotas stored");
    Ok(stored)
}

/// Rebuild the ledger from storage and compare both datastore tiers.
async fn verify(ds: &Datastore) -> anyhow::Result<BTreeMap<String, UsageSnapshot>> {
    ds.check_consistency().await?;

    let quotas = Quotas::spawn();
    populate(&quotas, ds).await?;
    let mut usage = BTreeMap::new();
    for tenant in ds.tenants().list().await {
        usage.insert(tenant.id.clone(), quotas.usage(&tenant.id).await?);
    }
    quotas.shutdown();
    Ok(usage)
}

/// Parse `type=limit` arguments. `unlimited` clears a limit.
pub fn parse_limits(args: &[String]) -> anyhow::Result<Vec<QuotaLimit>> {
    args.iter()
        .map(|arg| {
            let (name, value) = arg
                .split_once('=')
                .with_context(|| format!("expected type=limit, got {arg:?}"))?;
            let kind = ResourceType::ALL
                .into_iter()
                .find(|k| k.as_str() == name)
                .with_context(|| format!("unknown resource type {name:?}"))?;
            let limit = match value {
                "unlimited" => None,
                v => Some(v.parse::<u64>().with_context(|| format!("bad limit for {name}: {v:?}"))?),
            };
            Ok(QuotaLimit { kind, limit })
        })
        .collect()
}
