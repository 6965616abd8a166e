//! Workload template repository. Workloads are immutable once stored.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DatastoreError, DatastoreResult};
use crate::store::DurableStore;
use crate::types::Workload;

pub struct WorkloadRepo {
    store: DurableStore,
    cache: RwLock<BTreeMap<String, Workload>>,
}

impl WorkloadRepo {
    pub(crate) fn load(store: DurableStore) -> DatastoreResult<Self> {
        let workloads = store
            .list_workloads()?
            .into_iter()
            .map(|w| (w.id.clone(), w))
            .collect::<BTreeMap<_, _>>();
        debug!(count = workloads.len(), "workload cache loaded");
        Ok(Self {
            store,
            cache: RwLock::new(workloads),
        })
    }

    /// Store a workload template. Fails with `Conflict` if the ID is taken.
    pub async fn add(&self, workload: Workload) -> DatastoreResult<()> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(&workload.id) {
            return Err(DatastoreError::Conflict(format!("workload {} exists", workload.id)));
        }
        self.store.put_workload(&workload)?;
        info!(workload_id = %workload.id, description = %workload.description, "workload added");
        cache.insert(workload.id.clone(), workload);
        Ok(())
    }

    pub async fn get(&self, workload_id: &str) -> Option<Workload> {
        self.cache.read().await.get(workload_id).cloned()
    }

    pub fn get_no_cache(&self, workload_id: &str) -> DatastoreResult<Option<Workload>> {
        self.store.get_workload(workload_id)
    }

    pub async fn list(&self) -> Vec<Workload> {
        self.cache.read().await.values().cloned().collect()
    }

    pub fn list_no_cache(&self) -> DatastoreResult<Vec<Workload>> {
        self.store.list_workloads()
    }
}
