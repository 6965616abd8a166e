//! Mapped (floating) IP repository, cached by external address.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DatastoreError, DatastoreResult};
use crate::store::DurableStore;
use crate::types::MappedIP;

pub struct MappedIpRepo {
    store: DurableStore,
    cache: RwLock<BTreeMap<Ipv4Addr, MappedIP>>,
}

impl MappedIpRepo {
    pub(crate) fn load(store: DurableStore) -> DatastoreResult<Self> {
        let mapped = store.list_mapped_ips()?;
        debug!(count = mapped.len(), "mapped IP cache loaded");
        Ok(Self {
            store,
            cache: RwLock::new(mapped),
        })
    }

    /// Record a mapping. Fails with `Conflict` if the external address is
    /// already mapped or the ID is taken.
    pub async fn create(&self, mapped: MappedIP) -> DatastoreResult<()> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(&mapped.external_ip) {
            return Err(DatastoreError::Conflict(format!(
                "address {} already mapped",
                mapped.external_ip
            )));
        }
        self.store.add_mapped_ip(&mapped)?;
        info!(
            external_ip = %mapped.external_ip,
            internal_ip = %mapped.internal_ip,
            instance_id = %mapped.instance_id,
            "external IP mapped"
        );
        cache.insert(mapped.external_ip, mapped);
        Ok(())
    }

    pub async fn get(&self, external_ip: Ipv4Addr) -> Option<MappedIP> {
        self.cache.read().await.get(&external_ip).cloned()
    }

    pub fn get_no_cache(&self, external_ip: Ipv4Addr) -> DatastoreResult<Option<MappedIP>> {
        Ok(self.store.list_mapped_ips()?.remove(&external_ip))
    }

    pub async fn list(&self) -> BTreeMap<Ipv4Addr, MappedIP> {
        self.cache.read().await.clone()
    }

    pub fn list_no_cache(&self) -> DatastoreResult<BTreeMap<Ipv4Addr, MappedIP>> {
        self.store.list_mapped_ips()
    }

    pub async fn list_for_instance(&self, instance_id: &str) -> Vec<MappedIP> {
        self.cache
            .read()
            .await
            .values()
            .filter(|m| m.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Remove a mapping by ID. Returns the removed record.
    pub async fn delete(&self, mapping_id: &str) -> DatastoreResult<MappedIP> {
        let mut cache = self.cache.write().await;
        let external_ip = cache
            .values()
            .find(|m| m.id == mapping_id)
            .map(|m| m.external_ip)
            .ok_or_else(|| DatastoreError::NotFound(format!("mapped IP {mapping_id}")))?;
        self.store.delete_mapped_ip(mapping_id)?;
        let removed = cache
            .remove(&external_ip)
            .ok_or_else(|| DatastoreError::Invariant(format!("mapped IP {mapping_id} vanished from cache")))?;
        info!(%external_ip, %mapping_id, "external IP unmapped");
        Ok(removed)
    }
}
