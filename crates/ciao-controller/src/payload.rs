//! Start descriptors and the per-instance configuration document.
//!
//! The document handed to the dispatch layer has three sections:
//!
//! ```text
//! ---
//! <start descriptor, YAML>
//! ...
//! <workload base configuration>
//! ---
//! <{"uuid", "hostname"} metadata, tab-indented JSON>
//! ...
//! ```
//!
//! In-instance provisioning agents split on these markers, so the layout
//! must not change.

use ciao_datastore::{FirmwareType, VmType, WorkloadRequirements};
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, ControllerResult};
use crate::network::NetworkResources;
use crate::storage::StorageResource;

/// Where the launcher keeps instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    Host,
}

/// The command a compute node needs to start an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCmd {
    pub tenant_uuid: String,
    pub instance_uuid: String,
    pub fw_type: FirmwareType,
    pub vm_type: VmType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    pub instance_persistence: Persistence,
    pub networking: NetworkResources,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage: Vec<StorageResource>,
    pub requirements: WorkloadRequirements,
}

/// Top-level start descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDescriptor {
    pub start: StartCmd,
}

/// Metadata block appended to the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub uuid: String,
    pub hostname: String,
}

/// Serialize the full configuration document.
pub fn build_document(start: &StartDescriptor, base_config: &str, meta: &UserData) -> ControllerResult<String> {
    let yaml = serde_yaml::to_string(start).map_err(|e| ControllerError::Encode(e.to_string()))?;

    let mut json = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut json, formatter);
    meta.serialize(&mut ser)
        .map_err(|e| ControllerError::Encode(e.to_string()))?;
    let json = String::from_utf8(json).map_err(|e| ControllerError::Encode(e.to_string()))?;

    Ok(format!("---\n{yaml}...\n{base_config}---\n{json}\n...\n"))
}
