//! redb table definitions for the Ciao datastore.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Pool members live in their own tables under `{pool_id}:{member_id}` keys so
//! that pool updates touch only the members that changed.

use redb::TableDefinition;

pub type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Tenant records keyed by `{tenant_id}`.
pub const TENANTS: Table = TableDefinition::new("tenants");

/// Instance records keyed by `{instance_id}`.
pub const INSTANCES: Table = TableDefinition::new("instances");

/// Workload templates keyed by `{workload_id}`.
pub const WORKLOADS: Table = TableDefinition::new("workloads");

/// Pool headers (name and counters) keyed by `{pool_id}`.
pub const POOLS: Table = TableDefinition::new("pools");

/// External subnets keyed by `{pool_id}:{subnet_id}`.
pub const POOL_SUBNETS: Table = TableDefinition::new("pool_subnets");

/// External addresses keyed by `{pool_id}:{ip_id}`.
pub const POOL_ADDRESSES: Table = TableDefinition::new("pool_addresses");

/// Mapped (floating) IPs keyed by `{mapping_id}`.
pub const MAPPED_IPS: Table = TableDefinition::new("mapped_ips");

/// Storage attachments keyed by `{attachment_id}`.
pub const ATTACHMENTS: Table = TableDefinition::new("attachments");

/// Block device records keyed by `{block_id}`.
pub const BLOCK_DEVICES: Table = TableDefinition::new("block_devices");

pub(crate) const ALL_TABLES: [Table; 9] = [
    TENANTS,
    INSTANCES,
    WORKLOADS,
    POOLS,
    POOL_SUBNETS,
    POOL_ADDRESSES,
    MAPPED_IPS,
    ATTACHMENTS,
    BLOCK_DEVICES,
];

pub(crate) const MEMBER_KEY_SEPARATOR: char = ':';

/// Composite key for a pool member.
pub(crate) fn member_key(pool_id: &str, member_id: &str) -> String {
    format!("{pool_id}{MEMBER_KEY_SEPARATOR}{member_id}")
}
