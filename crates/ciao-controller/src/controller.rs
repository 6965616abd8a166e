//! The instance lifecycle pipeline.
//!
//! A launch walks through these steps, each of which may fail:
//!
//! 1. naming: a requested name must be free within the tenant
//! 2. network config: allocate an internal address and find the subnet's
//!    concentrator (concentrators themselves only get a fresh MAC)
//! 3. storage resolve: create the workload's volumes
//! 4. admission: ask the resource ledger (skipped for concentrators)
//! 5. persist: write the instance record
//! 6. storage attach: best effort, errors are reported but not fatal
//!
//! Anything acquired before a failure is handed back through
//! [`Reservation::rollback`]. A launch future dropped before the instance is
//! persisted hands it back as well, from a task spawned by the reservation's
//! `Drop`.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use ciao_datastore::*;
use ciao_quotas::{Admission, Decision, QuotaResult, Quotas, RequestedResource};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::network::{self, NetworkResources};
use crate::payload::{self, Persistence, StartCmd, StartDescriptor, UserData};
use crate::quotas::instance_resources;
use crate::state::StateTracker;
use crate::storage::{self, ResolvedStorage, VolumeService};

/// A request to start one instance of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub tenant_id: String,
    pub workload_id: String,
    pub name: Option<String>,
}

/// A successfully launched instance.
#[derive(Debug)]
pub struct LaunchResult {
    pub instance: Instance,
    pub start: StartDescriptor,
    /// The serialized configuration document for the dispatch layer.
    pub document: String,
    /// Storage attachments that could not be recorded. The instance is
    /// usable without them.
    pub attachment_errors: Vec<ControllerError>,
}

/// Resources held by an in-flight launch.
///
/// Dropping an armed reservation spawns its rollback on the current runtime.
struct Reservation<V: VolumeService + 'static> {
    ds: Arc<Datastore>,
    quotas: Quotas,
    volumes: Arc<V>,
    held: Held,
    armed: bool,
}

#[derive(Default)]
struct Held {
    tenant_id: String,
    ip: Option<Ipv4Addr>,
    storage: ResolvedStorage,
    /// Block device records written for created volumes.
    blocks: Vec<String>,
    admitted: Option<Vec<RequestedResource>>,
    /// A consume request whose decision has not been seen yet.
    pending: Option<(Vec<RequestedResource>, Admission)>,
}

impl<V: VolumeService + 'static> Reservation<V> {
    fn new(ctl: &Controller<V>, tenant_id: &str) -> Self {
        Self {
            ds: ctl.ds.clone(),
            quotas: ctl.quotas.clone(),
            volumes: ctl.volumes.clone(),
            held: Held {
                tenant_id: tenant_id.to_string(),
                ..Held::default()
            },
            armed: true,
        }
    }

    /// Ask the ledger for `resources`. An admitted request is held until the
    /// reservation is committed or rolled back.
    async fn admit(&mut self, resources: Vec<RequestedResource>) -> QuotaResult<Decision> {
        let admission = self.quotas.consume(&self.held.tenant_id, &resources);
        let (_, admission) = self.held.pending.insert((resources, admission));
        let decision = admission.await;
        if let Some((resources, _)) = self.held.pending.take() {
            if matches!(decision, Ok(Decision::Admitted)) {
                self.held.admitted = Some(resources);
            }
        }
        decision
    }

    /// The instance is persisted; nothing is given back from here on.
    fn commit(mut self) {
        self.armed = false;
    }

    /// Give everything back. Failures are logged and leaked.
    async fn rollback(mut self) {
        if let Some(release) = self.disarm() {
            release.run().await;
        }
    }

    fn disarm(&mut self) -> Option<Release<V>> {
        if !std::mem::replace(&mut self.armed, false) {
            return None;
        }
        Some(Release {
            ds: self.ds.clone(),
            quotas: self.quotas.clone(),
            volumes: self.volumes.clone(),
            held: std::mem::take(&mut self.held),
        })
    }
}

impl<V: VolumeService + 'static> Drop for Reservation<V> {
    fn drop(&mut self) {
        let Some(release) = self.disarm() else {
            return;
        };
        let tenant_id = release.held.tenant_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(%tenant_id, "launch abandoned, rolling back");
                handle.spawn(release.run());
            }
            Err(_) => warn!(%tenant_id, "launch abandoned outside a runtime, resources leaked"),
        }
    }
}

/// An owned rollback, runnable after the launch that made it is gone.
struct Release<V> {
    ds: Arc<Datastore>,
    quotas: Quotas,
    volumes: Arc<V>,
    held: Held,
}

impl<V: VolumeService> Release<V> {
    async fn run(self) {
        let Release { ds, quotas, volumes, held } = self;
        let tenant_id = held.tenant_id.as_str();
        if let Some(resources) = &held.admitted {
            quotas.release(tenant_id, resources);
        }
        if let Some((resources, admission)) = held.pending {
            if let Ok(Decision::Admitted) = admission.await {
                quotas.release(tenant_id, &resources);
            }
        }
        for volume_id in &held.blocks {
            if let Err(e) = ds.delete_block_data(volume_id).await {
                warn!(%tenant_id, %volume_id, error = %e, "failed to forget volume");
            }
        }
        let created: Vec<&str> = held.storage.created.iter().map(|(id, _)| id.as_str()).collect();
        storage::delete_volumes(&*volumes, tenant_id, created).await;
        if let Some(ip) = held.ip {
            if let Err(e) = ds.release_tenant_ip(tenant_id, ip).await {
                warn!(%tenant_id, %ip, error = %e, "failed to release tenant IP");
            }
        }
        debug!(%tenant_id, "launch rolled back");
    }
}

/// The instance lifecycle controller.
pub struct Controller<V> {
    ds: Arc<Datastore>,
    quotas: Quotas,
    volumes: Arc<V>,
    config: ControllerConfig,
    states: StateTracker,
}

impl<V: VolumeService + 'static> Controller<V> {
    pub fn new(ds: Arc<Datastore>, quotas: Quotas, volumes: V, config: ControllerConfig) -> Self {
        Self {
            ds,
            quotas,
            volumes: Arc::new(volumes),
            config,
            states: StateTracker::new(),
        }
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.ds
    }

    pub fn quotas(&self) -> &Quotas {
        &self.quotas
    }

    pub fn volumes(&self) -> &V {
        &self.volumes
    }

    // ── Tenants ────────────────────────────────────────────────────

    /// Look a tenant up, creating it on first use with the configured subnet
    /// size and default quotas.
    pub async fn ensure_tenant(&self, tenant_id: &str) -> ControllerResult<Tenant> {
        if let Some(tenant) = self.ds.tenants().get(tenant_id).await {
            return Ok(tenant);
        }

        let mut tenant = Tenant::new(
            tenant_id,
            network::random_mac(),
            self.config.network.tenant_subnet_bits,
        );
        tenant.quotas = self.config.quotas.default.limits();
        let tenant = match self.ds.tenants().add(tenant).await {
            Ok(tenant) => tenant,
            // Lost a race with another first request for the same tenant.
            Err(DatastoreError::Conflict(_)) => self
                .ds
                .tenants()
                .get(tenant_id)
                .await
                .ok_or_else(|| ControllerError::Invariant(format!("tenant {tenant_id} vanished")))?,
            Err(e) => return Err(e.into()),
        };

        self.quotas.add_tenant(tenant_id);
        self.quotas.set_limits(tenant_id, tenant.quotas.clone());
        info!(%tenant_id, subnet_bits = tenant.subnet_bits, "tenant created");
        Ok(tenant)
    }

    /// Register `instance_id` as the concentrator serving `subnet`, reachable
    /// at `ip`.
    pub async fn register_cnci(
        &self,
        tenant_id: &str,
        subnet: &str,
        instance_id: &str,
        ip: Ipv4Addr,
    ) -> ControllerResult<()> {
        let instance = self
            .ds
            .instances()
            .get(instance_id)
            .await
            .ok_or_else(|| ControllerError::NotFound(format!("instance {instance_id}")))?;
        if !instance.cnci || instance.tenant_id != tenant_id {
            return Err(ControllerError::Conflict(format!(
                "instance {instance_id} is not a concentrator of tenant {tenant_id}"
            )));
        }
        self.ds.instances().set_address(instance_id, ip).await?;
        self.ds.tenants().set_subnet_cnci(tenant_id, subnet, instance_id).await?;
        self.ds
            .tenants()
            .modify(tenant_id, |t| {
                if t.cnci_id.as_deref() == Some(instance_id) {
                    t.cnci_ip = Some(ip);
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    // ── Launch ─────────────────────────────────────────────────────

    /// Launch one instance. See the module docs for the steps.
    pub async fn launch_instance(&self, request: LaunchRequest) -> ControllerResult<LaunchResult> {
        let tenant_id = request.tenant_id.as_str();
        let workload = self
            .ds
            .workloads()
            .get(&request.workload_id)
            .await
            .ok_or_else(|| ControllerError::NotFound(format!("workload {}", request.workload_id)))?;
        let tenant = self.ensure_tenant(tenant_id).await?;
        let cnci = workload.requirements.network_node;

        if let Some(name) = &request.name {
            if self.ds.instances().resolve_name(tenant_id, name).await.is_some() {
                return Err(ControllerError::NameInUse(name.clone()));
            }
        }

        let instance_id = uuid::Uuid::new_v4().to_string();
        let mut reservation = Reservation::new(self, tenant_id);

        match self
            .prepare(&tenant, &workload, &instance_id, cnci, &mut reservation)
            .await
        {
            Ok(prepared) => {
                self.commit(request, workload, instance_id, prepared, reservation)
                    .await
            }
            Err(e) => {
                warn!(%tenant_id, %instance_id, error = %e, "launch failed");
                reservation.rollback().await;
                Err(e)
            }
        }
    }

    /// Network config, storage resolution and admission. Everything acquired
    /// is recorded in `reservation`.
    async fn prepare(
        &self,
        tenant: &Tenant,
        workload: &Workload,
        instance_id: &str,
        cnci: bool,
        reservation: &mut Reservation<V>,
    ) -> ControllerResult<Prepared> {
        let networking = if cnci {
            network::concentrator_network()
        } else {
            let ip = self.ds.allocate_tenant_ip(&tenant.id).await?;
            reservation.held.ip = Some(ip);
            let subnet = ciao_datastore::network::subnet_of(ip, tenant.subnet_bits)?;
            let cnci_instance = match tenant.subnet_cncis.get(&subnet) {
                Some(id) => self.ds.instances().get(id).await,
                None => None,
            };
            network::tenant_network(tenant, ip, |_| cnci_instance)?
        };

        storage::resolve_storage(
            &*self.volumes,
            &tenant.id,
            instance_id,
            workload,
            &mut reservation.held.storage,
        )
        .await
        .map_err(ControllerError::Volume)?;
        let created = reservation.held.storage.created.clone();
        for (volume_id, size_gib) in &created {
            self.ds
                .create_block_data(BlockData {
                    id: volume_id.clone(),
                    tenant_id: tenant.id.clone(),
                    size_gib: *size_gib,
                    state: BlockState::Available,
                    description: format!("Volume for instance: {instance_id}"),
                    internal: cnci,
                    create_time: Utc::now(),
                })
                .await?;
            reservation.held.blocks.push(volume_id.clone());
        }

        if !cnci {
            match reservation.admit(instance_resources(workload)).await? {
                Decision::Admitted => {}
                Decision::Denied {
                    resource,
                    requested,
                    used,
                    limit,
                } => {
                    return Err(ControllerError::QuotaExceeded {
                        resource,
                        requested,
                        used,
                        limit,
                    });
                }
            }
        }

        Ok(Prepared {
            networking,
            storage: reservation.held.storage.resources.clone(),
        })
    }

    /// Build the start document, persist the instance and attach storage.
    async fn commit(
        &self,
        request: LaunchRequest,
        workload: Workload,
        instance_id: String,
        prepared: Prepared,
        reservation: Reservation<V>,
    ) -> ControllerResult<LaunchResult> {
        let cnci = workload.requirements.network_node;
        let start = StartDescriptor {
            start: StartCmd {
                tenant_uuid: request.tenant_id.clone(),
                instance_uuid: instance_id.clone(),
                fw_type: workload.fw_type,
                vm_type: workload.vm_type,
                docker_image: match workload.vm_type {
                    VmType::Docker => workload.image_name.clone(),
                    VmType::Qemu => None,
                },
                instance_persistence: Persistence::Host,
                networking: prepared.networking.clone(),
                storage: prepared.storage,
                requirements: workload.requirements.clone(),
            },
        };
        let meta = UserData {
            uuid: instance_id.clone(),
            hostname: request.name.clone().unwrap_or_else(|| instance_id.clone()),
        };
        let document = match payload::build_document(&start, &workload.config, &meta) {
            Ok(document) => document,
            Err(e) => {
                reservation.rollback().await;
                return Err(e);
            }
        };

        let NetworkResources {
            vnic_mac,
            vnic_uuid,
            subnet,
            private_ip,
            ..
        } = prepared.networking;
        let instance = Instance {
            id: instance_id.clone(),
            tenant_id: request.tenant_id.clone(),
            workload_id: workload.id.clone(),
            name: request.name,
            state: InstanceState::Pending,
            ip_address: private_ip,
            mac_address: vnic_mac,
            vnic_id: vnic_uuid,
            subnet: (!subnet.is_empty()).then_some(subnet),
            cnci,
            create_time: Utc::now(),
        };
        // Reports can arrive as soon as the record exists.
        drop(self.states.subscribe(&instance_id, InstanceState::Pending).await);
        if let Err(e) = self.ds.instances().add(instance.clone()).await {
            warn!(%instance_id, error = %e, "failed to persist instance");
            self.states.forget(&instance_id).await;
            reservation.rollback().await;
            return Err(match e {
                DatastoreError::Conflict(msg) if instance.name.is_some() => ControllerError::NameInUse(msg),
                e => e.into(),
            });
        }
        reservation.commit();

        let attachment_errors = self.attach_storage(&instance_id, &start.start.storage).await;
        for e in &attachment_errors {
            warn!(%instance_id, error = %e, "storage attachment failed");
        }

        info!(
            %instance_id,
            tenant_id = %instance.tenant_id,
            workload_id = %instance.workload_id,
            cnci,
            ip = ?instance.ip_address,
            "instance launched"
        );
        Ok(LaunchResult {
            instance,
            start,
            document,
            attachment_errors,
        })
    }

    async fn attach_storage(&self, instance_id: &str, resources: &[storage::StorageResource]) -> Vec<ControllerError> {
        let mut errors = Vec::new();
        for resource in resources.iter().filter(|r| !r.local) {
            if self.ds.block_devices().get(&resource.id).await.is_none() {
                errors.push(ControllerError::NotFound(format!("block device {}", resource.id)));
                continue;
            }
            let attachment = StorageAttachment {
                id: uuid::Uuid::new_v4().to_string(),
                instance_id: instance_id.to_string(),
                block_id: resource.id.clone(),
                ephemeral: resource.ephemeral,
            };
            if let Err(e) = self.ds.attach_storage(attachment).await {
                errors.push(e.into());
            }
        }
        errors
    }

    // ── Deletion ───────────────────────────────────────────────────

    /// Delete an instance and release what it holds.
    pub async fn delete_instance(&self, instance_id: &str) -> ControllerResult<()> {
        let instance = self.ds.delete_instance(instance_id).await?;
        let tenant_id = instance.tenant_id.as_str();

        if instance.cnci {
            self.forget_concentrator(&instance).await;
        } else {
            if let Some(ip) = instance.ip_address {
                if let Err(e) = self.ds.release_tenant_ip(tenant_id, ip).await {
                    warn!(%instance_id, %ip, error = %e, "failed to release tenant IP");
                }
            }
            match self.ds.workloads().get(&instance.workload_id).await {
                Some(workload) => self.quotas.release(tenant_id, &instance_resources(&workload)),
                None => warn!(
                    %instance_id,
                    workload_id = %instance.workload_id,
                    "workload gone, quota not released"
                ),
            }
        }

        self.release_storage(&instance).await;
        self.states.retire(instance_id, InstanceState::Deleted).await;
        info!(%instance_id, %tenant_id, "instance deleted");
        Ok(())
    }

    /// Detach every volume; ephemeral ones are deleted as well.
    async fn release_storage(&self, instance: &Instance) {
        let tenant_id = instance.tenant_id.as_str();
        for attachment in self.ds.attachments().list_for_instance(&instance.id).await {
            if let Err(e) = self.ds.detach_storage(&attachment.id).await {
                warn!(attachment_id = %attachment.id, error = %e, "failed to detach storage");
                continue;
            }
            if !attachment.ephemeral {
                continue;
            }
            if let Err(e) = self.ds.delete_block_data(&attachment.block_id).await {
                warn!(block_id = %attachment.block_id, error = %e, "failed to forget volume");
            }
            storage::delete_volumes(&*self.volumes, tenant_id, [attachment.block_id.as_str()]).await;
        }
    }

    async fn forget_concentrator(&self, instance: &Instance) {
        let Some(tenant) = self.ds.tenants().get(&instance.tenant_id).await else {
            return;
        };
        let subnets: Vec<String> = tenant
            .subnet_cncis
            .iter()
            .filter(|(_, id)| **id == instance.id)
            .map(|(subnet, _)| subnet.clone())
            .collect();
        for subnet in subnets {
            if let Err(e) = self.ds.tenants().remove_subnet_cnci(&tenant.id, &subnet).await {
                warn!(tenant_id = %tenant.id, %subnet, error = %e, "failed to unregister concentrator");
            }
        }
    }

    // ── State ──────────────────────────────────────────────────────

    /// Apply a status report and notify subscribers.
    pub async fn update_instance_state(&self, instance_id: &str, state: InstanceState) -> ControllerResult<Instance> {
        let instance = self.ds.instances().update_state(instance_id, state).await?;
        self.states.publish(instance_id, state).await;
        Ok(instance)
    }

    /// Watch an instance's state.
    pub async fn subscribe(&self, instance_id: &str) -> ControllerResult<watch::Receiver<InstanceState>> {
        let instance = self
            .ds
            .instances()
            .get(instance_id)
            .await
            .ok_or_else(|| ControllerError::NotFound(format!("instance {instance_id}")))?;
        Ok(self.states.subscribe(instance_id, instance.state).await)
    }

    /// Wait until the instance reaches `state`. Fails with `NotFound` if the
    /// instance is deleted first.
    pub async fn wait_for_state(&self, instance_id: &str, state: InstanceState) -> ControllerResult<()> {
        let mut rx = self.subscribe(instance_id).await?;
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| ControllerError::NotFound(format!("instance {instance_id} deleted")))
    }
}

struct Prepared {
    networking: NetworkResources,
    storage: Vec<storage::StorageResource>,
}
