//! Per-instance network configuration.

use std::net::Ipv4Addr;

use ciao_datastore::network::subnet_of;
use ciao_datastore::{Instance, Tenant};
use macaddr::MacAddr6;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, ControllerResult};

/// Network resources handed to the launcher in the start descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResources {
    pub vnic_mac: String,
    pub vnic_uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub concentrator_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concentrator_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subnet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<Ipv4Addr>,
}

/// Tenant instance MAC: `02:00` followed by the four address octets, so two
/// instances share a MAC only if they share an address.
pub fn mac_from_ip(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format_mac(MacAddr6::new(0x02, 0x00, a, b, c, d))
}

/// A random locally administered unicast MAC.
pub fn random_mac() -> String {
    let mut bytes: [u8; 6] = rand::thread_rng().r#gen();
    bytes[0] = (bytes[0] | 0x02) & 0xfe;
    format_mac(MacAddr6::from(bytes))
}

/// Lowercase, colon-separated.
fn format_mac(mac: MacAddr6) -> String {
    mac.to_string().to_ascii_lowercase()
}

/// Networking for a concentrator: fresh MAC, no subnet membership.
pub fn concentrator_network() -> NetworkResources {
    NetworkResources {
        vnic_mac: random_mac(),
        vnic_uuid: uuid::Uuid::new_v4().to_string(),
        ..NetworkResources::default()
    }
}

/// Networking for a regular instance at `ip`.
///
/// `lookup` resolves a concentrator instance ID; it is only consulted for
/// the subnet `ip` falls in. Fails with `NoConcentrator` if the tenant has
/// none registered for that subnet.
pub fn tenant_network<F>(tenant: &Tenant, ip: Ipv4Addr, lookup: F) -> ControllerResult<NetworkResources>
where
    F: FnOnce(&str) -> Option<Instance>,
{
    let subnet = subnet_of(ip, tenant.subnet_bits)?;
    let no_concentrator = || ControllerError::NoConcentrator {
        tenant_id: tenant.id.clone(),
        subnet: subnet.clone(),
    };
    let cnci_id = tenant.subnet_cncis.get(&subnet).ok_or_else(no_concentrator)?;
    let cnci = lookup(cnci_id).ok_or_else(no_concentrator)?;

    Ok(NetworkResources {
        vnic_mac: mac_from_ip(ip),
        vnic_uuid: uuid::Uuid::new_v4().to_string(),
        concentrator_uuid: cnci.id,
        concentrator_ip: cnci.ip_address,
        subnet: subnet.clone(),
        private_ip: Some(ip),
    })
}
