//! Storage resolution against an external volume service.
//!
//! Existing volumes pass through unchanged. Image-backed, volume-backed and
//! empty requirements get a new volume from the [`VolumeService`]. Local
//! scratch space is created by the launcher and never reaches the service.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ciao_datastore::{StorageSource, Workload};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Source of a volume to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    Image(String),
    Volume(String),
    Empty,
}

/// A request to the volume service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    pub description: String,
    pub source: VolumeSource,
    pub size_gib: u64,
    pub internal: bool,
}

/// External block storage collaborator.
pub trait VolumeService: Send + Sync {
    /// Create a volume for `tenant_id`, returning its ID.
    fn create_volume(
        &self,
        tenant_id: &str,
        request: VolumeRequest,
    ) -> impl Future<Output = anyhow::Result<String>> + Send;

    fn delete_volume(&self, tenant_id: &str, volume_id: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// One storage entry of the start descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageResource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub local: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size_gib: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Resolved storage for one launch attempt.
#[derive(Debug, Default)]
pub struct ResolvedStorage {
    pub resources: Vec<StorageResource>,
    /// Volumes created by this attempt, with their sizes.
    pub created: Vec<(String, u64)>,
}

/// Resolve every storage requirement of `workload` into `resolved`.
///
/// Each volume is recorded in `resolved.created` as soon as the service
/// returns it, so a caller that stops polling still knows what to delete.
/// On failure, volumes created so far are deleted again and `created` is
/// cleared before the error is returned.
pub async fn resolve_storage<V: VolumeService>(
    volumes: &V,
    tenant_id: &str,
    instance_id: &str,
    workload: &Workload,
    resolved: &mut ResolvedStorage,
) -> anyhow::Result<()> {
    for requirement in &workload.storage {
        let source = match &requirement.source {
            StorageSource::Existing { id } => {
                resolved.resources.push(StorageResource {
                    id: id.clone(),
                    bootable: requirement.bootable,
                    ephemeral: false,
                    local: false,
                    size_gib: 0,
                });
                continue;
            }
            StorageSource::Local => {
                resolved.resources.push(StorageResource {
                    id: String::new(),
                    bootable: requirement.bootable,
                    ephemeral: true,
                    local: true,
                    size_gib: requirement.size_gib,
                });
                continue;
            }
            StorageSource::Image { image_ref } => VolumeSource::Image(image_ref.clone()),
            StorageSource::Volume { source_volume_id } => VolumeSource::Volume(source_volume_id.clone()),
            StorageSource::Empty => VolumeSource::Empty,
        };

        let request = VolumeRequest {
            description: format!("Volume for instance: {instance_id}"),
            source,
            size_gib: requirement.size_gib,
            internal: requirement.internal,
        };
        match volumes.create_volume(tenant_id, request).await {
            Ok(volume_id) => {
                debug!(%tenant_id, %instance_id, %volume_id, "volume created");
                resolved.created.push((volume_id.clone(), requirement.size_gib));
                resolved.resources.push(StorageResource {
                    id: volume_id,
                    bootable: requirement.bootable,
                    ephemeral: requirement.ephemeral,
                    local: false,
                    size_gib: 0,
                });
            }
            Err(e) => {
                delete_volumes(volumes, tenant_id, resolved.created.iter().map(|(id, _)| id.as_str())).await;
                resolved.created.clear();
                return Err(e.context("error creating volume"));
            }
        }
    }
    Ok(())
}

/// Best-effort deletion. Failures are logged and leaked.
pub async fn delete_volumes<'a, V: VolumeService>(
    volumes: &V,
    tenant_id: &str,
    ids: impl IntoIterator<Item = &'a str>,
) {
    for volume_id in ids {
        if let Err(e) = volumes.delete_volume(tenant_id, volume_id).await {
            warn!(%tenant_id, %volume_id, error = %e, "failed to delete volume");
        }
    }
}

// ── In-memory volume service ──────────────────────────────────────

/// Volume service that keeps volumes in memory, for tests and local runs
/// without a block storage backend.
#[derive(Debug, Default)]
pub struct MemoryVolumes {
    volumes: Mutex<BTreeMap<String, (String, VolumeRequest)>>,
    fail_creates: AtomicBool,
    create_delay_ms: AtomicU64,
}

impl MemoryVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent creations fail.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent creations take `delay` before the volume exists.
    pub fn delay_creates(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.create_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// IDs of live volumes.
    pub async fn volume_ids(&self) -> Vec<String> {
        self.volumes.lock().await.keys().cloned().collect()
    }
}

impl VolumeService for MemoryVolumes {
    async fn create_volume(&self, tenant_id: &str, request: VolumeRequest) -> anyhow::Result<String> {
        if self.fail_creates.load(Ordering::SeqCst) {
            anyhow::bail!("volume service unavailable");
        }
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.volumes
            .lock()
            .await
            .insert(id.clone(), (tenant_id.to_string(), request));
        Ok(id)
    }

    async fn delete_volume(&self, tenant_id: &str, volume_id: &str) -> anyhow::Result<()> {
        let mut volumes = self.volumes.lock().await;
        match volumes.get(volume_id) {
            Some((owner, _)) if owner == tenant_id => {
                volumes.remove(volume_id);
                Ok(())
            }
            Some(_) => anyhow::bail!("volume {volume_id} belongs to another tenant"),
            None => anyhow::bail!("volume {volume_id} not found"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciao_datastore::*;

    fn workload(storage: Vec<WorkloadStorage>) -> Workload {
        Workload {
            id: "w1".to_string(),
            description: "test".to_string(),
            vm_type: VmType::Qemu,
            fw_type: FirmwareType::Efi,
            image_name: None,
            config: String::new(),
            storage,
            requirements: WorkloadRequirements {
                mem_mb: 512,
                vcpus: 1,
                network_node: false,
            },
        }
    }

    fn req(source: StorageSource) -> WorkloadStorage {
        WorkloadStorage {
            source,
            size_gib: 10,
            bootable: false,
            ephemeral: true,
            internal: false,
        }
    }

    #[tokio::test]
    async fn existing_and_local_skip_the_service() {
        let volumes = MemoryVolumes::new();
        let wl = workload(vec![
            req(StorageSource::Existing { id: "vol-1".to_string() }),
            req(StorageSource::Local),
        ]);
        let mut resolved = ResolvedStorage::default();
        resolve_storage(&volumes, "t1", "i1", &wl, &mut resolved).await.unwrap();
        assert!(resolved.created.is_empty());
        assert_eq!(resolved.resources[0].id, "vol-1");
        assert!(!resolved.resources[0].ephemeral);
        assert!(resolved.resources[1].local);
        assert!(volumes.volume_ids().await.is_empty());
    }

    #[tokio::test]
    async fn image_and_empty_create_volumes() {
        let volumes = MemoryVolumes::new();
        let wl = workload(vec![
            req(StorageSource::Image { image_ref: "ubuntu".to_string() }),
            req(StorageSource::Empty),
        ]);
        let mut resolved = ResolvedStorage::default();
        resolve_storage(&volumes, "t1", "i1", &wl, &mut resolved).await.unwrap();
        assert_eq!(resolved.created.len(), 2);
        assert_eq!(volumes.volume_ids().await.len(), 2);
        assert!(resolved.resources.iter().all(|r| r.ephemeral && !r.id.is_empty()));
    }

    #[tokio::test]
    async fn failure_removes_created_volumes() {
        struct FailSecond(MemoryVolumes, std::sync::atomic::AtomicUsize);

        impl VolumeService for FailSecond {
            async fn create_volume(&self, tenant_id: &str, request: VolumeRequest) -> anyhow::Result<String> {
                if self.1.fetch_add(1, Ordering::SeqCst) == 1 {
                    anyhow::bail!("backend full");
                }
                self.0.create_volume(tenant_id, request).await
            }

            async fn delete_volume(&self, tenant_id: &str, volume_id: &str) -> anyhow::Result<()> {
                self.0.delete_volume(tenant_id, volume_id).await
            }
        }

        let volumes = FailSecond(MemoryVolumes::new(), Default::default());
        let wl = workload(vec![req(StorageSource::Empty), req(StorageSource::Empty)]);
        let mut resolved = ResolvedStorage::default();
        let err = resolve_storage(&volumes, "t1", "i1", &wl, &mut resolved).await.unwrap_err();
        assert!(err.to_string().contains("error creating volume"));
        assert!(volumes.0.volume_ids().await.is_empty());
        assert!(resolved.created.is_empty());
    }

    #[tokio::test]
    async fn volumes_are_recorded_before_a_stalled_create_returns() {
        let volumes = MemoryVolumes::new();
        volumes.delay_creates(Duration::from_millis(100));
        let wl = workload(vec![req(StorageSource::Empty), req(StorageSource::Empty)]);
        let mut resolved = ResolvedStorage::default();

        let outcome = tokio::time::timeout(
            Duration::from_millis(150),
            resolve_storage(&volumes, "t1", "i1", &wl, &mut resolved),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(resolved.created.len(), 1);
        assert_eq!(volumes.volume_ids().await, vec![resolved.created[0].0.clone()]);
    }

    #[tokio::test]
    async fn memory_volumes_check_ownership() {
        let volumes = MemoryVolumes::new();
        let id = volumes
            .create_volume(
                "t1",
                VolumeRequest {
                    description: "d".to_string(),
                    source: VolumeSource::Empty,
                    size_gib: 1,
                    internal: false,
                },
            )
            .await
            .unwrap();
        assert!(volumes.delete_volume("t2", &id).await.is_err());
        volumes.delete_volume("t1", &id).await.unwrap();
        assert!(volumes.delete_volume("t1", &id).await.is_err());
    }
}
