//! Domain types for the Ciao datastore.
//!
//! These types represent the persisted state of tenants, instances,
//! workloads, external address pools, mapped IPs, block devices and
//! storage attachments. All types are serializable to/from JSON for
//! storage in redb tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ciao_quotas::QuotaLimit;
use serde::{Deserialize, Serialize};

/// Unique identifier for a tenant.
pub type TenantId = String;

/// Unique identifier for an instance.
pub type InstanceId = String;

/// Unique identifier for a workload template.
pub type WorkloadId = String;

// ── Tenant ────────────────────────────────────────────────────────

/// A tenant and its network and storage allocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: TenantId,
    /// Prefix length of each tenant subnet (e.g. 24).
    pub subnet_bits: u8,
    /// MAC address reserved for the tenant's concentrator. Stable before
    /// the concentrator instance exists.
    pub cnci_mac: String,
    /// Concentrator instance, once launched.
    pub cnci_id: Option<InstanceId>,
    /// Concentrator address, once known.
    pub cnci_ip: Option<Ipv4Addr>,
    /// Subnet (CIDR) → concentrator instance serving it.
    #[serde(default)]
    pub subnet_cncis: BTreeMap<String, InstanceId>,
    /// Internal addresses currently handed out to this tenant's instances.
    #[serde(default)]
    pub allocated_ips: BTreeSet<Ipv4Addr>,
    /// Stored quota limits, loaded into the ledger at start-up.
    #[serde(default)]
    pub quotas: Vec<QuotaLimit>,
    /// Block devices owned by the tenant. Derived from the block-device
    /// table, never persisted with the tenant record.
    #[serde(skip)]
    pub devices: BTreeMap<String, BlockData>,
}

impl Tenant {
    /// A fresh tenant with no allocations.
    pub fn new(id: impl Into<TenantId>, cnci_mac: impl Into<String>, subnet_bits: u8) -> Self {
        Self {
            id: id.into(),
            subnet_bits,
            cnci_mac: cnci_mac.into(),
            cnci_id: None,
            cnci_ip: None,
            subnet_cncis: BTreeMap::new(),
            allocated_ips: BTreeSet::new(),
            quotas: Vec::new(),
            devices: BTreeMap::new(),
        }
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Exited,
    Deleted,
    Error,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Exited => "exited",
            InstanceState::Deleted => "deleted",
            InstanceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// A compute instance record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub tenant_id: TenantId,
    pub workload_id: WorkloadId,
    /// Optional human-readable name, unique within the tenant.
    pub name: Option<String>,
    pub state: InstanceState,
    /// Tenant-internal address. A concentrator gets one when it registers.
    pub ip_address: Option<Ipv4Addr>,
    pub mac_address: String,
    pub vnic_id: String,
    /// Tenant subnet in CIDR notation.
    pub subnet: Option<String>,
    /// Whether this is a network concentrator instance.
    pub cnci: bool,
    pub create_time: DateTime<Utc>,
}

// ── Workload ──────────────────────────────────────────────────────

/// Virtualization flavour of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmType {
    Qemu,
    Docker,
}

/// Firmware used to boot a VM workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareType {
    Legacy,
    Efi,
}

/// Where a workload volume comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageSource {
    /// A volume that already exists; used as-is.
    Existing { id: String },
    /// A new volume cloned from an image.
    Image { image_ref: String },
    /// A new volume cloned from another volume.
    Volume { source_volume_id: String },
    /// A new blank volume.
    Empty,
    /// Scratch space the launcher creates on the node. Never tracked here.
    Local,
}

/// A storage requirement declared by a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStorage {
    pub source: StorageSource,
    pub size_gib: u64,
    #[serde(default)]
    pub bootable: bool,
    /// Deleted together with the instance.
    #[serde(default)]
    pub ephemeral: bool,
    /// Hidden from the tenant's volume listings.
    #[serde(default)]
    pub internal: bool,
}

/// Resources one instance of a workload needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRequirements {
    pub mem_mb: u64,
    pub vcpus: u64,
    /// Launch as a network concentrator.
    #[serde(default)]
    pub network_node: bool,
}

/// An immutable instance template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub description: String,
    pub vm_type: VmType,
    pub fw_type: FirmwareType,
    /// Container image for `docker` workloads.
    #[serde(default)]
    pub image_name: Option<String>,
    /// Base configuration text appended to the start document.
    pub config: String,
    #[serde(default)]
    pub storage: Vec<WorkloadStorage>,
    pub requirements: WorkloadRequirements,
}

// ── Pools ─────────────────────────────────────────────────────────

/// An external subnet owned by a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSubnet {
    pub id: String,
    pub cidr: String,
}

/// A single external address owned by a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIP {
    pub id: String,
    pub address: Ipv4Addr,
}

/// A named group of external subnets and addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub name: String,
    pub free: u64,
    pub total_ips: u64,
    #[serde(default)]
    pub subnets: Vec<ExternalSubnet>,
    #[serde(default)]
    pub ips: Vec<ExternalIP>,
    /// Member addresses currently bound by a `MappedIP`.
    #[serde(default)]
    pub mapped: BTreeSet<Ipv4Addr>,
}

impl Pool {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            free: 0,
            total_ips: 0,
            subnets: Vec::new(),
            ips: Vec::new(),
            mapped: BTreeSet::new(),
        }
    }

    /// Order members by ID so cached and durable reads compare equal.
    pub(crate) fn normalize(&mut self) {
        self.subnets.sort_by(|a, b| a.id.cmp(&b.id));
        self.ips.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

/// Pool header as stored in the `pools` table; members live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PoolRecord {
    pub id: String,
    pub name: String,
    pub free: u64,
    pub total_ips: u64,
    #[serde(default)]
    pub mapped: BTreeSet<Ipv4Addr>,
}

impl From<&Pool> for PoolRecord {
    fn from(pool: &Pool) -> Self {
        Self {
            id: pool.id.clone(),
            name: pool.name.clone(),
            free: pool.free,
            total_ips: pool.total_ips,
            mapped: pool.mapped.clone(),
        }
    }
}

/// An external address bound to an instance's internal address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedIP {
    pub id: String,
    pub external_ip: Ipv4Addr,
    pub internal_ip: Ipv4Addr,
    pub instance_id: InstanceId,
    pub tenant_id: TenantId,
    pub pool_id: String,
    pub pool_name: String,
}

// ── Storage ───────────────────────────────────────────────────────

/// Availability of a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Available,
    InUse,
}

/// A tenant-visible block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub id: String,
    pub tenant_id: TenantId,
    pub size_gib: u64,
    pub state: BlockState,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub internal: bool,
    pub create_time: DateTime<Utc>,
}

/// Binds a block device to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAttachment {
    pub id: String,
    pub instance_id: InstanceId,
    pub block_id: String,
    /// Created for this instance only and deleted with it.
    pub ephemeral: bool,
}
