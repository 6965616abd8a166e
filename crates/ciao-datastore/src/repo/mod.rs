//! Per-domain repositories: the in-memory tier over [`DurableStore`].
//!
//! Each repository owns one entity domain and one `RwLock`ed cache. Every
//! mutation runs inside that domain's write section and follows the same
//! order: compute the new value, write it to the durable tier, and only
//! then replace the cached value. A failed durable write returns early and
//! leaves the cache untouched.
//!
//! Reads come in two flavours, kept as distinct methods: `get`/`list`
//! serve the cache, `get_no_cache`/`list_no_cache` go to the durable tier.
//!
//! No method holds more than one domain's lock. Operations spanning several
//! domains (see [`crate::Datastore`]) visit them one at a time in this
//! order: instances, block devices, attachments, tenants, pools, mapped IPs.
//!
//! [`DurableStore`]: crate::store::DurableStore

mod attachments;
mod block_devices;
mod instances;
mod mapped_ips;
mod pools;
mod tenants;
mod workloads;

pub use attachments::AttachmentRepo;
pub use block_devices::BlockDeviceRepo;
pub use instances::InstanceRepo;
pub use mapped_ips::MappedIpRepo;
pub use pools::PoolRepo;
pub(crate) use pools::pool_addresses;
pub use tenants::TenantRepo;
pub use workloads::WorkloadRepo;
