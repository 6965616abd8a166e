//! Tenant and pool address arithmetic.
//!
//! Every tenant draws internal addresses from `172.16.0.0/12`, carved into
//! subnets of the tenant's configured prefix length. Within each subnet the
//! network address, the first host (gateway) and the broadcast address are
//! never handed out.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::error::{DatastoreError, DatastoreResult};

/// Base of the tenant-internal address space.
pub const TENANT_NETWORK: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 0);

/// Prefix length of the tenant-internal address space.
pub const TENANT_NETWORK_BITS: u8 = 12;

/// The block of prefix `bits` containing `ip`, host bits cleared.
pub fn network_of(ip: Ipv4Addr, bits: u8) -> DatastoreResult<Ipv4Network> {
    let invalid = |_| DatastoreError::Invalid(format!("bad prefix length /{bits}"));
    let block = Ipv4Network::new(ip, bits).map_err(invalid)?;
    Ipv4Network::new(block.network(), bits).map_err(invalid)
}

/// The subnet containing `ip`, in CIDR notation.
pub fn subnet_of(ip: Ipv4Addr, bits: u8) -> DatastoreResult<String> {
    network_of(ip, bits).map(|n| n.to_string())
}

/// Parse `a.b.c.d/n` into its normalized block.
///
/// Host bits are cleared, so `192.168.0.5/24` becomes `192.168.0.0/24`.
/// A `/0` block is rejected.
pub fn parse_cidr(cidr: &str) -> DatastoreResult<Ipv4Network> {
    let invalid = || DatastoreError::Invalid(format!("bad CIDR: {cidr}"));
    if !cidr.contains('/') {
        return Err(invalid());
    }
    let block: Ipv4Network = cidr.parse().map_err(|_| invalid())?;
    if block.prefix() == 0 {
        return Err(invalid());
    }
    network_of(block.network(), block.prefix())
}

/// Number of addresses a block contributes to a pool.
pub fn cidr_size(block: &Ipv4Network) -> u64 {
    u64::from(block.size())
}

/// Whether two blocks share any address.
pub fn overlaps(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// Lowest address in the tenant space not yet in `allocated`.
pub fn next_tenant_ip(allocated: &BTreeSet<Ipv4Addr>, subnet_bits: u8) -> DatastoreResult<Ipv4Addr> {
    if !(TENANT_NETWORK_BITS..=30).contains(&subnet_bits) {
        return Err(DatastoreError::Invalid(format!(
            "tenant subnet prefix /{subnet_bits} outside /{TENANT_NETWORK_BITS}../30"
        )));
    }

    let space = network_of(TENANT_NETWORK, TENANT_NETWORK_BITS)?;
    for ip in space.iter() {
        if allocated.contains(&ip) {
            continue;
        }
        let subnet = network_of(ip, subnet_bits)?;
        let gateway = Ipv4Addr::from(u32::from(subnet.network()) + 1);
        if ip != subnet.network() && ip != gateway && ip != subnet.broadcast() {
            return Ok(ip);
        }
    }

    Err(DatastoreError::AddressExhausted(format!(
        "tenant network {TENANT_NETWORK}/{TENANT_NETWORK_BITS}"
    )))
}
