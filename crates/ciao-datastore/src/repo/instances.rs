//! Instance repository.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DatastoreError, DatastoreResult};
use crate::store::DurableStore;
use crate::types::*;

/// Cached instances keyed by ID.
pub struct InstanceRepo {
    store: DurableStore,
    cache: RwLock<BTreeMap<InstanceId, Instance>>,
}

impl InstanceRepo {
    pub(crate) fn load(store: DurableStore) -> DatastoreResult<Self> {
        let instances = store
            .list_instances()?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect::<BTreeMap<_, _>>();
        debug!(count = instances.len(), "instance cache loaded");
        Ok(Self {
            store,
            cache: RwLock::new(instances),
        })
    }

    /// Persist a new instance.
    ///
    /// Fails with `Conflict` on a duplicate ID or when the name is already
    /// used by another instance of the same tenant.
    pub async fn add(&self, instance: Instance) -> DatastoreResult<()> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(&instance.id) {
            return Err(DatastoreError::Conflict(format!("instance {} exists", instance.id)));
        }
        if let Some(name) = &instance.name {
            if find_by_name(&cache, &instance.tenant_id, name).is_some() {
                return Err(DatastoreError::Conflict(format!("name {name} already in use")));
            }
        }
        self.store.add_instance(&instance)?;
        info!(
            instance_id = %instance.id,
            tenant_id = %instance.tenant_id,
            workload_id = %instance.workload_id,
            cnci = instance.cnci,
            "instance added"
        );
        cache.insert(instance.id.clone(), instance);
        Ok(())
    }

    pub async fn get(&self, instance_id: &str) -> Option<Instance> {
        self.cache.read().await.get(instance_id).cloned()
    }

    pub fn get_no_cache(&self, instance_id: &str) -> DatastoreResult<Option<Instance>> {
        self.store.get_instance(instance_id)
    }

    pub async fn list(&self) -> Vec<Instance> {
        self.cache.read().await.values().cloned().collect()
    }

    pub fn list_no_cache(&self) -> DatastoreResult<Vec<Instance>> {
        self.store.list_instances()
    }

    pub async fn list_for_tenant(&self, tenant_id: &str) -> Vec<Instance> {
        self.cache
            .read()
            .await
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    /// Resolve a tenant-scoped name to an instance ID.
    pub async fn resolve_name(&self, tenant_id: &str, name: &str) -> Option<InstanceId> {
        find_by_name(&*self.cache.read().await, tenant_id, name).map(|i| i.id.clone())
    }

    /// Record a new lifecycle state. Returns the updated instance.
    pub async fn update_state(&self, instance_id: &str, state: InstanceState) -> DatastoreResult<Instance> {
        let updated = self.modify(instance_id, |i| i.state = state).await?;
        debug!(%instance_id, %state, "instance state updated");
        Ok(updated)
    }

    /// Record the address a concentrator reported for itself.
    pub async fn set_address(&self, instance_id: &str, ip: Ipv4Addr) -> DatastoreResult<Instance> {
        self.modify(instance_id, |i| i.ip_address = Some(ip)).await
    }

    async fn modify(&self, instance_id: &str, f: impl FnOnce(&mut Instance)) -> DatastoreResult<Instance> {
        let mut cache = self.cache.write().await;
        let cached = cache
            .get_mut(instance_id)
            .ok_or_else(|| DatastoreError::NotFound(format!("instance {instance_id}")))?;
        let mut next = cached.clone();
        f(&mut next);
        self.store.update_instance(&next)?;
        *cached = next.clone();
        Ok(next)
    }

    /// Remove an instance record. Returns the removed instance.
    pub async fn delete(&self, instance_id: &str) -> DatastoreResult<Instance> {
        let mut cache = self.cache.write().await;
        if !cache.contains_key(instance_id) {
            return Err(DatastoreError::NotFound(format!("instance {instance_id}")));
        }
        self.store.delete_instance(instance_id)?;
        let removed = cache
            .remove(instance_id)
            .ok_or_else(|| DatastoreError::Invariant(format!("instance {instance_id} vanished from cache")))?;
        info!(%instance_id, "instance deleted");
        Ok(removed)
    }
}

fn find_by_name<'a>(
    cache: &'a BTreeMap<InstanceId, Instance>,
    tenant_id: &str,
    name: &str,
) -> Option<&'a Instance> {
    cache
        .values()
        .find(|i| i.tenant_id == tenant_id && i.name.as_deref() == Some(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn instance(id: &str, tenant: &str, name: Option<&str>) -> Instance {
        Instance {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            workload_id: "w1".to_string(),
            name: name.map(str::to_string),
            state: InstanceState::Pending,
            ip_address: Some(Ipv4Addr::new(172, 16, 0, 2)),
            mac_address: "02:00:ac:10:00:02".to_string(),
            vnic_id: "vnic-1".to_string(),
            subnet: Some("172.16.0.0/24".to_string()),
            cnci: false,
            create_time: Utc::now(),
        }
    }

    fn repo() -> InstanceRepo {
        InstanceRepo::load(DurableStore::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn add_get_list() {
        let repo = repo();
        repo.add(instance("i1", "t1", None)).await.unwrap();
        repo.add(instance("i2", "t2", None)).await.unwrap();

        assert_eq!(repo.get("i1").await, repo.get_no_cache("i1").unwrap());
        assert_eq!(repo.list().await, repo.list_no_cache().unwrap());
        assert_eq!(repo.list_for_tenant("t2").await.len(), 1);
    }

    #[tokio::test]
    async fn names_are_unique_per_tenant() {
        let repo = repo();
        repo.add(instance("i1", "t1", Some("web"))).await.unwrap();
        repo.add(instance("i2", "t2", Some("web"))).await.unwrap();

        let err = repo.add(instance("i3", "t1", Some("web"))).await.unwrap_err();
        assert!(matches!(err, DatastoreError::Conflict(_)));
        assert_eq!(repo.resolve_name("t1", "web").await.as_deref(), Some("i1"));
        assert_eq!(repo.resolve_name("t2", "web").await.as_deref(), Some("i2"));
        assert!(repo.resolve_name("t3", "web").await.is_none());
    }

    #[tokio::test]
    async fn update_state_writes_through() {
        let repo = repo();
        repo.add(instance("i1", "t1", None)).await.unwrap();
        repo.update_state("i1", InstanceState::Running).await.unwrap();

        assert_eq!(repo.get("i1").await.unwrap().state, InstanceState::Running);
        assert_eq!(repo.get_no_cache("i1").unwrap().unwrap().state, InstanceState::Running);
        assert!(repo.update_state("ghost", InstanceState::Running).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_both_tiers() {
        let repo = repo();
        repo.add(instance("i1", "t1", None)).await.unwrap();
        let removed = repo.delete("i1").await.unwrap();
        assert_eq!(removed.id, "i1");
        assert!(repo.get("i1").await.is_none());
        assert!(repo.get_no_cache("i1").unwrap().is_none());
        assert!(matches!(repo.delete("i1").await, Err(DatastoreError::NotFound(_))));
    }
}
