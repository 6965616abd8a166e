//! Controller configuration, read from a TOML file.
//!
//! Every section and field is optional; missing values take the defaults
//! below.
//!
//! ```toml
//! [datastore]
//! path = "/var/lib/ciao/controller.redb"
//!
//! [network]
//! tenant_subnet_bits = 24
//!
//! [cnci]
//! vcpus = 4
//! mem_mb = 2048
//! disk_mb = 2048
//! image = "ciao-cnci"
//!
//! [quotas.default]
//! instance = 5
//! mem_mb = 1024
//! vcpus = 2
//!
//! [logging]
//! filter = "info,ciao=debug"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use ciao_datastore::CnciWorkloadSpec;
use ciao_quotas::{QuotaLimit, ResourceType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub datastore: DatastoreConfig,
    pub network: NetworkConfig,
    pub cnci: CnciConfig,
    pub quotas: QuotasConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    pub path: PathBuf,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ciao-controller.redb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Prefix length of the subnets handed to new tenants.
    pub tenant_subnet_bits: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { tenant_subnet_bits: 24 }
    }
}

/// Resources of the generated network concentrator workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnciConfig {
    pub vcpus: u64,
    pub mem_mb: u64,
    pub disk_mb: u64,
    pub image: String,
}

impl Default for CnciConfig {
    fn default() -> Self {
        Self {
            vcpus: 4,
            mem_mb: 2048,
            disk_mb: 2048,
            image: "ciao-cnci".to_string(),
        }
    }
}

impl CnciConfig {
    pub fn workload_spec(&self) -> CnciWorkloadSpec {
        CnciWorkloadSpec {
            vcpus: self.vcpus,
            mem_mb: self.mem_mb,
            disk_mb: self.disk_mb,
            image: self.image.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotasConfig {
    /// Limits given to tenants when they are first seen.
    pub default: QuotaDefaults,
}

/// Per-resource limits. An absent value means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_disk_gib: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<u64>,
}

impl QuotaDefaults {
    /// The configured limits, one entry per limited resource.
    pub fn limits(&self) -> Vec<QuotaLimit> {
        [
            (ResourceType::Instance, self.instance),
            (ResourceType::VCPUs, self.vcpus),
            (ResourceType::MemMB, self.mem_mb),
            (ResourceType::Volume, self.volume),
            (ResourceType::SharedDiskGiB, self.shared_disk_gib),
            (ResourceType::ExternalIP, self.external_ip),
            (ResourceType::Image, self.image),
        ]
        .into_iter()
        .filter(|(_, limit)| limit.is_some())
        .map(|(kind, limit)| QuotaLimit { kind, limit })
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,ciao=debug".to_string(),
            json: false,
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(content.parse()?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl FromStr for ControllerConfig {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}
