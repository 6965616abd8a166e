//! Resource types, requests, and admission decisions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A tenant-accounted resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Instance,
    #[serde(rename = "vcpus")]
    VCPUs,
    #[serde(rename = "mem_mb")]
    MemMB,
    Volume,
    #[serde(rename = "shared_disk_gib")]
    SharedDiskGiB,
    #[serde(rename = "external_ip")]
    ExternalIP,
    Image,
}

impl ResourceType {
    /// Every resource type the ledger knows about.
    pub const ALL: [ResourceType; 7] = [
        ResourceType::Instance,
        ResourceType::VCPUs,
        ResourceType::MemMB,
        ResourceType::Volume,
        ResourceType::SharedDiskGiB,
        ResourceType::ExternalIP,
        ResourceType::Image,
    ];

    /// Stable name, as used in config files and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Instance => "instance",
            ResourceType::VCPUs => "vcpus",
            ResourceType::MemMB => "mem_mb",
            ResourceType::Volume => "volume",
            ResourceType::SharedDiskGiB => "shared_disk_gib",
            ResourceType::ExternalIP => "external_ip",
            ResourceType::Image => "image",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An amount of a single resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedResource {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub value: u64,
}

impl RequestedResource {
    pub fn new(kind: ResourceType, value: u64) -> Self {
        Self { kind, value }
    }
}

/// A configured limit for one resource type. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub limit: Option<u64>,
}

/// Running total for one resource type of one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub used: u64,
    pub limit: Option<u64>,
}

impl Usage {
    /// Whether `amount` more fits under the limit.
    pub fn admits(&self, amount: u64) -> bool {
        match self.limit {
            Some(limit) => self
                .used
                .checked_add(amount)
                .is_some_and(|total| total <= limit),
            None => true,
        }
    }
}

/// Point-in-time snapshot of a tenant's ledger entries.
pub type UsageSnapshot = BTreeMap<ResourceType, Usage>;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Counters were incremented by the full request.
    Admitted,
    /// Counters were left untouched. Names the first resource that did not fit.
    Denied {
        resource: ResourceType,
        requested: u64,
        used: u64,
        limit: u64,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }
}
