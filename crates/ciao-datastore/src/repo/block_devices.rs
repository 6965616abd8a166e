//! Block device repository.
//!
//! A tenant's `devices` view is derived from this domain; the
//! [`Datastore`](crate::Datastore) facade refreshes it after each change.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DatastoreError, DatastoreResult};
use crate::store::DurableStore;
use crate::types::{BlockData, BlockState};

pub struct BlockDeviceRepo {
    store: DurableStore,
    cache: RwLock<BTreeMap<String, BlockData>>,
}

impl BlockDeviceRepo {
    pub(crate) fn load(store: DurableStore) -> DatastoreResult<Self> {
        let blocks = store
            .list_block_data()?
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect::<BTreeMap<_, _>>();
        debug!(count = blocks.len(), "block device cache loaded");
        Ok(Self {
            store,
            cache: RwLock::new(blocks),
        })
    }

    pub async fn create(&self, block: BlockData) -> DatastoreResult<()> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(&block.id) {
            return Err(DatastoreError::Conflict(format!("block device {} exists", block.id)));
        }
        self.store.add_block_data(&block)?;
        info!(block_id = %block.id, tenant_id = %block.tenant_id, size_gib = block.size_gib, "block device added");
        cache.insert(block.id.clone(), block);
        Ok(())
    }

    pub async fn get(&self, block_id: &str) -> Option<BlockData> {
        self.cache.read().await.get(block_id).cloned()
    }

    pub fn get_no_cache(&self, block_id: &str) -> DatastoreResult<Option<BlockData>> {
        self.store.get_block_data(block_id)
    }

    pub async fn list(&self) -> Vec<BlockData> {
        self.cache.read().await.values().cloned().collect()
    }

    pub fn list_no_cache(&self) -> DatastoreResult<Vec<BlockData>> {
        self.store.list_block_data()
    }

    pub async fn set_state(&self, block_id: &str, state: BlockState) -> DatastoreResult<BlockData> {
        let mut cache = self.cache.write().await;
        let cached = cache
            .get_mut(block_id)
            .ok_or_else(|| DatastoreError::NotFound(format!("block device {block_id}")))?;
        let mut next = cached.clone();
        next.state = state;
        self.store.update_block_data(&next)?;
        *cached = next.clone();
        Ok(next)
    }

    pub async fn delete(&self, block_id: &str) -> DatastoreResult<BlockData> {
        let mut cache = self.cache.write().await;
        if !cache.contains_key(block_id) {
            return Err(DatastoreError::NotFound(format!("block device {block_id}")));
        }
        self.store.delete_block_data(block_id)?;
        let removed = cache
            .remove(block_id)
            .ok_or_else(|| DatastoreError::Invariant(format!("block device {block_id} vanished from cache")))?;
        info!(%block_id, "block device deleted");
        Ok(removed)
    }
}
