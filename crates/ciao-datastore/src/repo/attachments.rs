//! Storage attachment repository.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DatastoreError, DatastoreResult};
use crate::store::DurableStore;
use crate::types::StorageAttachment;

/// Cached attachments keyed by attachment ID.
pub struct AttachmentRepo {
    store: DurableStore,
    cache: RwLock<BTreeMap<String, StorageAttachment>>,
}

impl AttachmentRepo {
    pub(crate) fn load(store: DurableStore) -> DatastoreResult<Self> {
        let attachments = store
            .list_storage_attachments()?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect::<BTreeMap<_, _>>();
        debug!(count = attachments.len(), "attachment cache loaded");
        Ok(Self {
            store,
            cache: RwLock::new(attachments),
        })
    }

    pub async fn create(&self, attachment: StorageAttachment) -> DatastoreResult<()> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(&attachment.id) {
            return Err(DatastoreError::Conflict(format!("attachment {} exists", attachment.id)));
        }
        self.store.add_storage_attachment(&attachment)?;
        info!(
            attachment_id = %attachment.id,
            instance_id = %attachment.instance_id,
            block_id = %attachment.block_id,
            "storage attached"
        );
        cache.insert(attachment.id.clone(), attachment);
        Ok(())
    }

    pub async fn get(&self, attachment_id: &str) -> Option<StorageAttachment> {
        self.cache.read().await.get(attachment_id).cloned()
    }

    pub fn get_no_cache(&self, attachment_id: &str) -> DatastoreResult<Option<StorageAttachment>> {
        self.store.get_storage_attachment(attachment_id)
    }

    pub async fn list(&self) -> Vec<StorageAttachment> {
        self.cache.read().await.values().cloned().collect()
    }

    pub fn list_no_cache(&self) -> DatastoreResult<Vec<StorageAttachment>> {
        self.store.list_storage_attachments()
    }

    pub async fn list_for_instance(&self, instance_id: &str) -> Vec<StorageAttachment> {
        self.cache
            .read()
            .await
            .values()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect()
    }

    pub async fn delete(&self, attachment_id: &str) -> DatastoreResult<StorageAttachment> {
        let mut cache = self.cache.write().await;
        if !cache.contains_key(attachment_id) {
            return Err(DatastoreError::NotFound(format!("attachment {attachment_id}")));
        }
        self.store.delete_storage_attachment(attachment_id)?;
        let removed = cache
            .remove(attachment_id)
            .ok_or_else(|| DatastoreError::Invariant(format!("attachment {attachment_id} vanished from cache")))?;
        info!(%attachment_id, "storage detached");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(id: &str, block: &str) -> StorageAttachment {
        StorageAttachment {
            id: id.to_string(),
            instance_id: "i1".to_string(),
            block_id: block.to_string(),
            ephemeral: false,
        }
    }

    #[tokio::test]
    async fn attachment_round_trip_with_coexisting_entry() {
        let repo = AttachmentRepo::load(DurableStore::open_in_memory().unwrap()).unwrap();
        let a = attachment("a1", "b1");
        let b = attachment("a2", "b2");
        repo.create(a.clone()).await.unwrap();
        repo.create(b.clone()).await.unwrap();

        let listed = repo.list_no_cache().unwrap();
        assert_eq!(listed.iter().filter(|x| **x == a).count(), 1);
        assert_eq!(repo.get_no_cache("a1").unwrap(), Some(a.clone()));
        assert_eq!(repo.get("a1").await, repo.get_no_cache("a1").unwrap());

        repo.delete("a1").await.unwrap();
        assert!(repo.get_no_cache("a1").unwrap().is_none());
        let listed = repo.list_no_cache().unwrap();
        assert!(!listed.contains(&a));
        assert!(listed.contains(&b));
        assert_eq!(repo.list().await, listed);
    }

    #[tokio::test]
    async fn delete_unknown_attachment_is_not_found() {
        let repo = AttachmentRepo::load(DurableStore::open_in_memory().unwrap()).unwrap();
        assert!(matches!(
            repo.delete("ghost").await,
            Err(DatastoreError::NotFound(_))
        ));
    }
}
