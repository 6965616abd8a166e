//! The `Datastore` facade.
//!
//! Owns one repository per entity domain and implements the operations that
//! span more than one of them. Cross-domain operations take each domain's
//! write section in turn, never two at once, following the order documented
//! in [`crate::repo`].

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::{DatastoreError, DatastoreResult};
use crate::network::{cidr_size, parse_cidr};
use crate::repo::*;
use crate::store::DurableStore;
use crate::types::*;

/// Description of the network concentrator workload generated at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnciWorkloadSpec {
    pub vcpus: u64,
    pub mem_mb: u64,
    pub disk_mb: u64,
    pub image: String,
}

/// Dual-tier datastore: a redb durable tier with per-domain caches.
pub struct Datastore {
    store: DurableStore,
    tenants: TenantRepo,
    instances: InstanceRepo,
    workloads: WorkloadRepo,
    pools: PoolRepo,
    mapped_ips: MappedIpRepo,
    attachments: AttachmentRepo,
    block_devices: BlockDeviceRepo,
}

impl Datastore {
    /// Open (or create) the durable tier at `path` and warm every cache.
    pub fn open(path: &Path) -> DatastoreResult<Self> {
        Self::from_store(DurableStore::open(path)?)
    }

    /// Datastore over an in-memory durable tier.
    pub fn open_in_memory() -> DatastoreResult<Self> {
        Self::from_store(DurableStore::open_in_memory()?)
    }

    pub fn from_store(store: DurableStore) -> DatastoreResult<Self> {
        let ds = Self {
            tenants: TenantRepo::load(store.clone())?,
            instances: InstanceRepo::load(store.clone())?,
            workloads: WorkloadRepo::load(store.clone())?,
            pools: PoolRepo::load(store.clone())?,
            mapped_ips: MappedIpRepo::load(store.clone())?,
            attachments: AttachmentRepo::load(store.clone())?,
            block_devices: BlockDeviceRepo::load(store.clone())?,
            store,
        };
        info!("datastore ready");
        Ok(ds)
    }

    pub fn durable(&self) -> &DurableStore {
        &self.store
    }

    pub fn tenants(&self) -> &TenantRepo {
        &self.tenants
    }

    pub fn instances(&self) -> &InstanceRepo {
        &self.instances
    }

    pub fn workloads(&self) -> &WorkloadRepo {
        &self.workloads
    }

    pub fn pools(&self) -> &PoolRepo {
        &self.pools
    }

    pub fn mapped_ips(&self) -> &MappedIpRepo {
        &self.mapped_ips
    }

    pub fn attachments(&self) -> &AttachmentRepo {
        &self.attachments
    }

    pub fn block_devices(&self) -> &BlockDeviceRepo {
        &self.block_devices
    }

    // ── Tenants ────────────────────────────────────────────────────

    /// Create a tenant with a reserved concentrator MAC.
    pub async fn add_tenant(&self, tenant_id: &str, cnci_mac: &str, subnet_bits: u8) -> DatastoreResult<Tenant> {
        self.tenants.add(Tenant::new(tenant_id, cnci_mac, subnet_bits)).await
    }

    pub async fn allocate_tenant_ip(&self, tenant_id: &str) -> DatastoreResult<Ipv4Addr> {
        self.tenants.allocate_ip(tenant_id).await
    }

    pub async fn release_tenant_ip(&self, tenant_id: &str, ip: Ipv4Addr) -> DatastoreResult<()> {
        self.tenants.release_ip(tenant_id, ip).await
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Remove an instance record. Rejected with `Conflict` while an external
    /// address is still mapped to it.
    pub async fn delete_instance(&self, instance_id: &str) -> DatastoreResult<Instance> {
        let mapped = self.mapped_ips.list_for_instance(instance_id).await;
        if let Some(m) = mapped.first() {
            return Err(DatastoreError::Conflict(format!(
                "instance {instance_id} still has {} mapped",
                m.external_ip
            )));
        }
        self.instances.delete(instance_id).await
    }

    // ── Block devices and attachments ──────────────────────────────

    /// Record a block device and add it to its tenant's device set.
    pub async fn create_block_data(&self, block: BlockData) -> DatastoreResult<()> {
        self.block_devices.create(block.clone()).await?;
        self.tenants.insert_device(&block).await;
        Ok(())
    }

    /// Delete a block device record and drop it from its tenant's device set.
    pub async fn delete_block_data(&self, block_id: &str) -> DatastoreResult<()> {
        let removed = self.block_devices.delete(block_id).await?;
        self.tenants.remove_device(&removed.tenant_id, block_id).await;
        Ok(())
    }

    /// Attach a block device to an instance, marking the device in use.
    pub async fn attach_storage(&self, attachment: StorageAttachment) -> DatastoreResult<()> {
        self.transition_attachment(&attachment.block_id, BlockState::InUse, async {
            self.attachments.create(attachment.clone()).await
        })
        .await
    }

    /// Detach storage, marking the device available again.
    pub async fn detach_storage(&self, attachment_id: &str) -> DatastoreResult<StorageAttachment> {
        let attachment = self
            .attachments
            .get(attachment_id)
            .await
            .ok_or_else(|| DatastoreError::NotFound(format!("attachment {attachment_id}")))?;
        self.transition_attachment(&attachment.block_id, BlockState::Available, async {
            self.attachments.delete(attachment_id).await
        })
        .await
    }

    /// Move a tracked block device to `state`, run the attachment change,
    /// then refresh the tenant's device set. Untracked devices (launcher-local
    /// scratch space) only get the attachment change.
    async fn transition_attachment<T>(
        &self,
        block_id: &str,
        state: BlockState,
        change: impl Future<Output = DatastoreResult<T>>,
    ) -> DatastoreResult<T> {
        let previous = self.block_devices.get(block_id).await.map(|b| b.state);
        let updated = match previous {
            Some(_) => Some(self.block_devices.set_state(block_id, state).await?),
            None => None,
        };
        let out = match change.await {
            Ok(out) => out,
            Err(e) => {
                if let Some(prev) = previous {
                    self.restore_block_state(block_id, prev).await;
                }
                return Err(e);
            }
        };
        if let Some(block) = updated {
            self.tenants.insert_device(&block).await;
        }
        Ok(out)
    }

    async fn restore_block_state(&self, block_id: &str, state: BlockState) {
        if let Err(e) = self.block_devices.set_state(block_id, state).await {
            warn!(%block_id, ?state, error = %e, "failed to restore block device state");
        }
    }

    // ── Pools and mapped IPs ───────────────────────────────────────

    /// Map a free address from `pool_id` to an instance's internal address.
    ///
    /// The address is reserved in the pool's `mapped` set inside the pool
    /// domain's write section, so concurrent mappings never pick the same one.
    pub async fn map_external_ip(&self, pool_id: &str, instance_id: &str) -> DatastoreResult<MappedIP> {
        let instance = self
            .instances
            .get(instance_id)
            .await
            .ok_or_else(|| DatastoreError::NotFound(format!("instance {instance_id}")))?;
        let internal_ip = instance
            .ip_address
            .ok_or_else(|| DatastoreError::Invalid(format!("instance {instance_id} has no internal address")))?;

        let (external_ip, pool_name) = self
            .pools
            .modify(pool_id, |pool| {
                if pool.free == 0 {
                    return Err(DatastoreError::AddressExhausted(format!("pool {}", pool.name)));
                }
                let address = pool_addresses(pool)
                    .find(|a| !pool.mapped.contains(a))
                    .ok_or_else(|| DatastoreError::AddressExhausted(format!("pool {}", pool.name)))?;
                pool.mapped.insert(address);
                pool.free -= 1;
                Ok((address, pool.name.clone()))
            })
            .await?;

        let mapped = MappedIP {
            id: uuid::Uuid::new_v4().to_string(),
            external_ip,
            internal_ip,
            instance_id: instance.id,
            tenant_id: instance.tenant_id,
            pool_id: pool_id.to_string(),
            pool_name,
        };
        if let Err(e) = self.mapped_ips.create(mapped.clone()).await {
            self.return_pool_address(pool_id, external_ip).await;
            return Err(e);
        }
        Ok(mapped)
    }

    /// Undo a mapping and return its address to the pool.
    pub async fn unmap_external_ip(&self, external_ip: Ipv4Addr) -> DatastoreResult<MappedIP> {
        let mapped = self
            .mapped_ips
            .get(external_ip)
            .await
            .ok_or_else(|| DatastoreError::NotFound(format!("mapped address {external_ip}")))?;
        let removed = self.mapped_ips.delete(&mapped.id).await?;
        self.return_pool_address(&removed.pool_id, removed.external_ip).await;
        Ok(removed)
    }

    async fn return_pool_address(&self, pool_id: &str, address: Ipv4Addr) {
        let result = self
            .pools
            .modify(pool_id, |pool| {
                if pool.mapped.remove(&address) {
                    pool.free = (pool.free + 1).min(pool.total_ips);
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(%pool_id, %address, error = %e, "failed to return address to pool");
        }
    }

    /// Remove an external subnet. Rejected while any of its addresses is
    /// mapped; the pool domain checks this under its own lock.
    pub async fn delete_external_subnet(&self, pool_id: &str, subnet_id: &str) -> DatastoreResult<()> {
        self.pools.delete_external_subnet(pool_id, subnet_id).await
    }

    /// Remove an external address. Rejected while it is mapped.
    pub async fn delete_external_ip(&self, pool_id: &str, ip_id: &str) -> DatastoreResult<()> {
        self.pools.delete_external_ip(pool_id, ip_id).await
    }

    // ── Workloads ──────────────────────────────────────────────────

    pub async fn add_workload(&self, workload: Workload) -> DatastoreResult<()> {
        self.workloads.add(workload).await
    }

    /// Store the network concentrator workload and return its ID.
    pub async fn generate_cnci_workload(&self, spec: &CnciWorkloadSpec) -> DatastoreResult<WorkloadId> {
        let workload = Workload {
            id: uuid::Uuid::new_v4().to_string(),
            description: "Network concentrator".to_string(),
            vm_type: VmType::Qemu,
            fw_type: FirmwareType::Legacy,
            image_name: None,
            config: "#cloud-config\n".to_string(),
            storage: vec![WorkloadStorage {
                source: StorageSource::Image {
                    image_ref: spec.image.clone(),
                },
                size_gib: spec.disk_mb.div_ceil(1024),
                bootable: true,
                ephemeral: true,
                internal: true,
            }],
            requirements: WorkloadRequirements {
                mem_mb: spec.mem_mb,
                vcpus: spec.vcpus,
                network_node: true,
            },
        };
        let id = workload.id.clone();
        self.workloads.add(workload).await?;
        info!(workload_id = %id, image = %spec.image, "concentrator workload generated");
        Ok(id)
    }

    // ── Consistency ────────────────────────────────────────────────

    /// Compare every cached domain with the durable tier. Never writes.
    pub async fn check_consistency(&self) -> DatastoreResult<()> {
        let mut diverged = Vec::new();
        if self.tenants.list().await != self.tenants.list_no_cache()? {
            diverged.push("tenants");
        }
        if self.instances.list().await != self.instances.list_no_cache()? {
            diverged.push("instances");
        }
        if self.workloads.list().await != self.workloads.list_no_cache()? {
            diverged.push("workloads");
        }
        if self.pools.list().await != self.pools.list_no_cache()? {
            diverged.push("pools");
        }
        if self.mapped_ips.list().await != self.mapped_ips.list_no_cache()? {
            diverged.push("mapped_ips");
        }
        if self.attachments.list().await != self.attachments.list_no_cache()? {
            diverged.push("attachments");
        }
        if self.block_devices.list().await != self.block_devices.list_no_cache()? {
            diverged.push("block_devices");
        }
        self.check_pool_counters(&mut diverged).await;

        if diverged.is_empty() {
            debug!(checked_at = %Utc::now(), "datastore consistent");
            Ok(())
        } else {
            let domains = diverged.join(", ");
            error!(%domains, "cache diverged from durable tier");
            Err(DatastoreError::Invariant(format!("cache diverged: {domains}")))
        }
    }

    /// Pool counters must cover exactly the member addresses, the pool's
    /// `mapped` set must match the stored mappings, and `free` must count
    /// what is not mapped.
    async fn check_pool_counters(&self, diverged: &mut Vec<&'static str>) {
        let mapped = self.mapped_ips.list().await;
        for pool in self.pools.list().await {
            let derived: u64 = pool.ips.len() as u64
                + pool
                    .subnets
                    .iter()
                    .filter_map(|s| parse_cidr(&s.cidr).ok())
                    .map(|block| cidr_size(&block))
                    .sum::<u64>();
            let stored: BTreeSet<Ipv4Addr> = mapped
                .values()
                .filter(|m| m.pool_id == pool.id)
                .map(|m| m.external_ip)
                .collect();
            let in_use = pool.mapped.len() as u64;
            if derived != pool.total_ips || stored != pool.mapped || pool.free + in_use != pool.total_ips {
                warn!(
                    pool_id = %pool.id,
                    total_ips = pool.total_ips,
                    free = pool.free,
                    derived,
                    in_use,
                    mappings = stored.len(),
                    "pool counters drifted from membership"
                );
                diverged.push("pool_counters");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn datastore_with_instance() -> Datastore {
        let ds = Datastore::open_in_memory().unwrap();
        ds.add_tenant("t1", "02:aa:bb:cc:dd:ee", 24).await.unwrap();
        let ip = ds.allocate_tenant_ip("t1").await.unwrap();
        ds.instances()
            .add(Instance {
                id: "i1".to_string(),
                tenant_id: "t1".to_string(),
                workload_id: "w1".to_string(),
                name: None,
                state: InstanceState::Running,
                ip_address: Some(ip),
                mac_address: "02:00:ac:10:00:02".to_string(),
                vnic_id: "vnic-1".to_string(),
                subnet: Some("172.16.0.0/24".to_string()),
                cnci: false,
                create_time: Utc::now(),
            })
            .await
            .unwrap();
        ds.pools().create(Pool::new("p1", "public")).await.unwrap();
        ds
    }

    fn block(id: &str) -> BlockData {
        BlockData {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            size_gib: 10,
            state: BlockState::Available,
            description: "data".to_string(),
            internal: false,
            create_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn map_and_unmap_external_ip() {
        let ds = datastore_with_instance().await;
        ds.pools()
            .add_external_ips("p1", &[Ipv4Addr::new(10, 0, 0, 1)])
            .await
            .unwrap();

        let mapped = ds.map_external_ip("p1", "i1").await.unwrap();
        assert_eq!(mapped.external_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(mapped.pool_name, "public");
        assert_eq!(ds.mapped_ips().get(mapped.external_ip).await.unwrap(), mapped);
        assert_eq!(ds.pools().get("p1").await.unwrap().free, 0);

        assert!(matches!(
            ds.map_external_ip("p1", "i1").await,
            Err(DatastoreError::AddressExhausted(_))
        ));

        ds.unmap_external_ip(mapped.external_ip).await.unwrap();
        assert!(ds.mapped_ips().list_no_cache().unwrap().is_empty());
        assert_eq!(ds.pools().get_no_cache("p1").unwrap().unwrap().free, 1);
        ds.check_consistency().await.unwrap();
    }

    #[tokio::test]
    async fn mapped_instance_cannot_be_deleted() {
        let ds = datastore_with_instance().await;
        ds.pools().add_external_subnet("p1", "192.168.0.0/30").await.unwrap();
        let mapped = ds.map_external_ip("p1", "i1").await.unwrap();

        assert!(matches!(
            ds.delete_instance("i1").await,
            Err(DatastoreError::Conflict(_))
        ));
        ds.unmap_external_ip(mapped.external_ip).await.unwrap();
        ds.delete_instance("i1").await.unwrap();
        assert!(ds.instances().get_no_cache("i1").unwrap().is_none());
    }

    #[tokio::test]
    async fn mapped_members_cannot_be_removed() {
        let ds = datastore_with_instance().await;
        let subnet = ds.pools().add_external_subnet("p1", "192.168.0.0/30").await.unwrap();
        let ips = ds
            .pools()
            .add_external_ips("p1", &[Ipv4Addr::new(10, 0, 0, 1)])
            .await
            .unwrap();
        let mapped = ds.map_external_ip("p1", "i1").await.unwrap();
        assert_eq!(mapped.external_ip, Ipv4Addr::new(10, 0, 0, 1));

        assert!(matches!(
            ds.delete_external_ip("p1", &ips[0].id).await,
            Err(DatastoreError::Conflict(_))
        ));
        ds.delete_external_subnet("p1", &subnet.id).await.unwrap();

        let pool = ds.pools().get("p1").await.unwrap();
        assert_eq!((pool.total_ips, pool.free), (1, 0));
        ds.check_consistency().await.unwrap();
    }

    #[tokio::test]
    async fn subnet_with_mapped_address_cannot_be_removed() {
        let ds = datastore_with_instance().await;
        let subnet = ds.pools().add_external_subnet("p1", "192.168.0.0/30").await.unwrap();
        let mapped = ds.map_external_ip("p1", "i1").await.unwrap();
        assert_eq!(mapped.external_ip, Ipv4Addr::new(192, 168, 0, 0));
        assert!(ds.pools().get("p1").await.unwrap().mapped.contains(&mapped.external_ip));

        assert!(matches!(
            ds.delete_external_subnet("p1", &subnet.id).await,
            Err(DatastoreError::Conflict(_))
        ));
        assert!(matches!(ds.pools().delete("p1").await, Err(DatastoreError::Conflict(_))));
        let pool = ds.pools().get_no_cache("p1").unwrap().unwrap();
        assert_eq!((pool.subnets.len(), pool.total_ips, pool.free), (1, 4, 3));

        ds.unmap_external_ip(mapped.external_ip).await.unwrap();
        assert!(ds.pools().get("p1").await.unwrap().mapped.is_empty());
        ds.delete_external_subnet("p1", &subnet.id).await.unwrap();
        ds.check_consistency().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_mappings_get_distinct_addresses() {
        let ds = Arc::new(datastore_with_instance().await);
        ds.pools().add_external_subnet("p1", "192.168.0.0/29").await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let ds = ds.clone();
                tokio::spawn(async move { ds.map_external_ip("p1", "i1").await })
            })
            .collect();
        let mut addresses = BTreeSet::new();
        for task in tasks {
            addresses.insert(task.await.unwrap().unwrap().external_ip);
        }
        assert_eq!(addresses.len(), 8);
        assert_eq!(ds.pools().get("p1").await.unwrap().free, 0);
        ds.check_consistency().await.unwrap();
    }

    #[tokio::test]
    async fn block_devices_feed_tenant_devices() {
        let ds = datastore_with_instance().await;
        ds.create_block_data(block("b1")).await.unwrap();
        ds.create_block_data(block("b2")).await.unwrap();

        let tenant = ds.tenants().get("t1").await.unwrap();
        assert_eq!(tenant.devices.len(), 2);
        assert_eq!(tenant, ds.tenants().get_no_cache("t1").unwrap().unwrap());

        ds.delete_block_data("b1").await.unwrap();
        let tenant = ds.tenants().get("t1").await.unwrap();
        assert!(!tenant.devices.contains_key("b1"));
        assert_eq!(tenant, ds.tenants().get_no_cache("t1").unwrap().unwrap());
    }

    #[tokio::test]
    async fn attach_and_detach_track_block_state() {
        let ds = datastore_with_instance().await;
        ds.create_block_data(block("b1")).await.unwrap();
        let attachment = StorageAttachment {
            id: "a1".to_string(),
            instance_id: "i1".to_string(),
            block_id: "b1".to_string(),
            ephemeral: false,
        };
        ds.attach_storage(attachment.clone()).await.unwrap();
        assert_eq!(ds.block_devices().get("b1").await.unwrap().state, BlockState::InUse);
        assert_eq!(
            ds.tenants().get("t1").await.unwrap().devices["b1"].state,
            BlockState::InUse
        );

        // A second attachment with the same ID fails and leaves state as it was.
        assert!(ds.attach_storage(attachment).await.is_err());
        assert_eq!(ds.block_devices().get("b1").await.unwrap().state, BlockState::InUse);

        ds.detach_storage("a1").await.unwrap();
        assert_eq!(
            ds.block_devices().get_no_cache("b1").unwrap().unwrap().state,
            BlockState::Available
        );
        ds.check_consistency().await.unwrap();
    }

    #[tokio::test]
    async fn generate_cnci_workload_is_network_node() {
        let ds = Datastore::open_in_memory().unwrap();
        let id = ds
            .generate_cnci_workload(&CnciWorkloadSpec {
                vcpus: 4,
                mem_mb: 2048,
                disk_mb: 2048,
                image: "cnci-image".to_string(),
            })
            .await
            .unwrap();
        let workload = ds.workloads().get(&id).await.unwrap();
        assert!(workload.requirements.network_node);
        assert_eq!(workload.storage[0].size_gib, 2);
    }

    #[tokio::test]
    async fn reopen_warms_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ciao.redb");
        {
            let ds = Datastore::open(&path).unwrap();
            ds.add_tenant("t1", "mac", 24).await.unwrap();
            ds.pools().create(Pool::new("p1", "public")).await.unwrap();
        }
        let ds = Datastore::open(&path).unwrap();
        assert!(ds.tenants().get("t1").await.is_some());
        assert!(ds.pools().get("p1").await.is_some());
        ds.check_consistency().await.unwrap();
    }
}
