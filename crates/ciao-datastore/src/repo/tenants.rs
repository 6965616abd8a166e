//! Tenant repository.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DatastoreError, DatastoreResult};
use crate::network::next_tenant_ip;
use crate::store::DurableStore;
use crate::types::*;

/// Cached tenants keyed by ID.
pub struct TenantRepo {
    store: DurableStore,
    cache: RwLock<BTreeMap<TenantId, Tenant>>,
}

impl TenantRepo {
    /// Warm the cache from the durable tier.
    pub(crate) fn load(store: DurableStore) -> DatastoreResult<Self> {
        let tenants = store
            .list_tenants()?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect::<BTreeMap<_, _>>();
        debug!(count = tenants.len(), "tenant cache loaded");
        Ok(Self {
            store,
            cache: RwLock::new(tenants),
        })
    }

    pub async fn get(&self, tenant_id: &str) -> Option<Tenant> {
        self.cache.read().await.get(tenant_id).cloned()
    }

    pub fn get_no_cache(&self, tenant_id: &str) -> DatastoreResult<Option<Tenant>> {
        self.store.get_tenant(tenant_id)
    }

    pub async fn list(&self) -> Vec<Tenant> {
        self.cache.read().await.values().cloned().collect()
    }

    pub fn list_no_cache(&self) -> DatastoreResult<Vec<Tenant>> {
        self.store.list_tenants()
    }

    /// Create a tenant. Fails with `Conflict` if the ID is taken.
    pub async fn add(&self, tenant: Tenant) -> DatastoreResult<Tenant> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(&tenant.id) {
            return Err(DatastoreError::Conflict(format!("tenant {} exists", tenant.id)));
        }
        let mut tenant = tenant;
        tenant.devices = self.store.get_tenant_devices(&tenant.id)?;
        self.store.add_tenant(&tenant)?;
        cache.insert(tenant.id.clone(), tenant.clone());
        info!(tenant_id = %tenant.id, "tenant added");
        Ok(tenant)
    }

    /// Replace a tenant record. The device set is derived from block
    /// devices and is kept as cached, whatever `tenant.devices` holds.
    pub async fn update(&self, tenant: &Tenant) -> DatastoreResult<()> {
        self.modify(&tenant.id, |current| {
            let devices = std::mem::take(&mut current.devices);
            *current = tenant.clone();
            current.devices = devices;
            Ok(())
        })
        .await
    }

    /// Read-modify-write a tenant inside the tenant domain's write section.
    pub async fn modify<R, F>(&self, tenant_id: &str, f: F) -> DatastoreResult<R>
    where
        F: FnOnce(&mut Tenant) -> DatastoreResult<R>,
    {
        let mut cache = self.cache.write().await;
        let cached = cache
            .get_mut(tenant_id)
            .ok_or_else(|| DatastoreError::NotFound(format!("tenant {tenant_id}")))?;
        let mut next = cached.clone();
        let out = f(&mut next)?;
        if next.id != cached.id {
            return Err(DatastoreError::Invalid("tenant ID cannot change".to_string()));
        }
        self.store.update_tenant(&next)?;
        *cached = next;
        Ok(out)
    }

    /// Hand out the lowest free internal address.
    pub async fn allocate_ip(&self, tenant_id: &str) -> DatastoreResult<Ipv4Addr> {
        let ip = self
            .modify(tenant_id, |t| {
                let ip = next_tenant_ip(&t.allocated_ips, t.subnet_bits)?;
                t.allocated_ips.insert(ip);
                Ok(ip)
            })
            .await?;
        debug!(%tenant_id, %ip, "tenant IP allocated");
        Ok(ip)
    }

    /// Return an internal address. Fails with `NotFound` if it was not allocated.
    pub async fn release_ip(&self, tenant_id: &str, ip: Ipv4Addr) -> DatastoreResult<()> {
        self.modify(tenant_id, |t| {
            if t.allocated_ips.remove(&ip) {
                Ok(())
            } else {
                Err(DatastoreError::NotFound(format!("address {ip} of tenant {tenant_id}")))
            }
        })
        .await?;
        debug!(%tenant_id, %ip, "tenant IP released");
        Ok(())
    }

    /// Record the concentrator serving `subnet`.
    pub async fn set_subnet_cnci(&self, tenant_id: &str, subnet: &str, instance_id: &str) -> DatastoreResult<()> {
        self.modify(tenant_id, |t| {
            t.subnet_cncis.insert(subnet.to_string(), instance_id.to_string());
            if t.cnci_id.is_none() {
                t.cnci_id = Some(instance_id.to_string());
            }
            Ok(())
        })
        .await?;
        info!(%tenant_id, %subnet, %instance_id, "concentrator registered");
        Ok(())
    }

    /// Forget the concentrator serving `subnet`. Returns its instance ID.
    pub async fn remove_subnet_cnci(&self, tenant_id: &str, subnet: &str) -> DatastoreResult<Option<InstanceId>> {
        self.modify(tenant_id, |t| {
            let removed = t.subnet_cncis.remove(subnet);
            if removed.is_some() && removed == t.cnci_id {
                t.cnci_id = t.subnet_cncis.values().next().cloned();
            }
            Ok(removed)
        })
        .await
    }

    /// Cache-only: the device set is derived from block devices, which the
    /// caller has already written durably.
    pub(crate) async fn insert_device(&self, block: &BlockData) {
        if let Some(t) = self.cache.write().await.get_mut(&block.tenant_id) {
            t.devices.insert(block.id.clone(), block.clone());
        }
    }

    pub(crate) async fn remove_device(&self, tenant_id: &str, block_id: &str) {
        if let Some(t) = self.cache.write().await.get_mut(tenant_id) {
            t.devices.remove(block_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> TenantRepo {
        TenantRepo::load(DurableStore::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn add_then_get_matches_no_cache() {
        let repo = repo();
        repo.add(Tenant::new("t1", "02:aa:00:00:00:01", 24)).await.unwrap();

        let cached = repo.get("t1").await.unwrap();
        let durable = repo.get_no_cache("t1").unwrap().unwrap();
        assert_eq!(cached, durable);
        assert_eq!(repo.list().await, repo.list_no_cache().unwrap());
    }

    #[tokio::test]
    async fn update_changes_both_tiers() {
        let repo = repo();
        let mut tenant = repo.add(Tenant::new("t1", "mac", 24)).await.unwrap();
        tenant.cnci_ip = Some(Ipv4Addr::new(127, 0, 0, 2));
        repo.update(&tenant).await.unwrap();

        assert_eq!(repo.get("t1").await.unwrap().cnci_ip, tenant.cnci_ip);
        assert_eq!(repo.get_no_cache("t1").unwrap().unwrap().cnci_ip, tenant.cnci_ip);
    }

    #[tokio::test]
    async fn update_unknown_tenant_is_not_found() {
        let repo = repo();
        let err = repo.update(&Tenant::new("ghost", "mac", 24)).await.unwrap_err();
        assert!(matches!(err, DatastoreError::NotFound(_)));
        assert!(repo.list().await.is_empty());
    }

    #[tokio::test]
    async fn failed_modification_leaves_cache_untouched() {
        let repo = repo();
        repo.add(Tenant::new("t1", "mac", 24)).await.unwrap();
        let before = repo.get("t1").await.unwrap();

        let result: DatastoreResult<()> = repo
            .modify("t1", |t| {
                t.subnet_bits = 16;
                Err(DatastoreError::Invalid("nope".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(repo.get("t1").await.unwrap(), before);
        assert_eq!(repo.get_no_cache("t1").unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn allocate_and_release_ip() {
        let repo = repo();
        repo.add(Tenant::new("t1", "mac", 24)).await.unwrap();

        let a = repo.allocate_ip("t1").await.unwrap();
        let b = repo.allocate_ip("t1").await.unwrap();
        assert_eq!(a, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(b, Ipv4Addr::new(172, 16, 0, 3));

        repo.release_ip("t1", a).await.unwrap();
        assert!(repo.release_ip("t1", a).await.is_err());
        assert_eq!(repo.allocate_ip("t1").await.unwrap(), a);

        let durable = repo.get_no_cache("t1").unwrap().unwrap();
        assert_eq!(durable.allocated_ips.len(), 2);
    }

    #[tokio::test]
    async fn subnet_cnci_bookkeeping() {
        let repo = repo();
        repo.add(Tenant::new("t1", "mac", 24)).await.unwrap();
        repo.set_subnet_cnci("t1", "172.16.0.0/24", "cnci-1").await.unwrap();

        let t = repo.get("t1").await.unwrap();
        assert_eq!(t.cnci_id.as_deref(), Some("cnci-1"));
        assert_eq!(t.subnet_cncis.get("172.16.0.0/24").map(String::as_str), Some("cnci-1"));

        let removed = repo.remove_subnet_cnci("t1", "172.16.0.0/24").await.unwrap();
        assert_eq!(removed.as_deref(), Some("cnci-1"));
        assert!(repo.get("t1").await.unwrap().cnci_id.is_none());
    }
}
