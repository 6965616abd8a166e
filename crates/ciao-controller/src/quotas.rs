//! Rebuilding the resource ledger from the datastore at start-up.

use ciao_datastore::{Datastore, Workload};
use ciao_quotas::{Quotas, RequestedResource, ResourceType};
use tracing::{info, warn};

use crate::error::ControllerResult;

/// Resources one instance of `workload` is accounted for.
pub fn instance_resources(workload: &Workload) -> Vec<RequestedResource> {
    vec![
        RequestedResource::new(ResourceType::Instance, 1),
        RequestedResource::new(ResourceType::MemMB, workload.requirements.mem_mb),
        RequestedResource::new(ResourceType::VCPUs, workload.requirements.vcpus),
    ]
}

/// Register every stored tenant with the ledger, replay the usage of its
/// persisted instances, then install its stored limits.
///
/// Usage is replayed before limits are set so that a tenant already over a
/// lowered limit keeps its real usage instead of having instances dropped
/// from the count.
pub async fn populate(quotas: &Quotas, ds: &Datastore) -> ControllerResult<()> {
    let tenants = ds.tenants().list().await;
    for tenant in &tenants {
        quotas.add_tenant(&tenant.id);
    }

    let mut replayed = 0usize;
    for instance in ds.instances().list().await {
        if instance.cnci {
            continue;
        }
        let Some(workload) = ds.workloads().get(&instance.workload_id).await else {
            warn!(
                instance_id = %instance.id,
                workload_id = %instance.workload_id,
                "instance references unknown workload, not accounted"
            );
            continue;
        };
        let decision = quotas
            .consume(&instance.tenant_id, &instance_resources(&workload))
            .await?;
        if !decision.is_admitted() {
            warn!(instance_id = %instance.id, ?decision, "usage replay denied");
        }
        replayed += 1;
    }

    for tenant in &tenants {
        quotas.set_limits(&tenant.id, tenant.quotas.clone());
    }
    info!(tenants = tenants.len(), instances = replayed, "quota ledger populated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ciao_datastore::*;
    use ciao_quotas::QuotaLimit;
    use std::net::Ipv4Addr;

    fn workload() -> Workload {
        Workload {
            id: "w1".to_string(),
            description: "vm".to_string(),
            vm_type: VmType::Qemu,
            fw_type: FirmwareType::Efi,
            image_name: None,
            config: String::new(),
            storage: Vec::new(),
            requirements: WorkloadRequirements {
                mem_mb: 512,
                vcpus: 1,
                network_node: false,
            },
        }
    }

    fn instance(id: &str, cnci: bool) -> Instance {
        Instance {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            workload_id: "w1".to_string(),
            name: None,
            state: InstanceState::Running,
            ip_address: Some(Ipv4Addr::new(172, 16, 0, 2)),
            mac_address: "02:00:ac:10:00:02".to_string(),
            vnic_id: "vnic".to_string(),
            subnet: None,
            cnci,
            create_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn replays_usage_and_limits() {
        let ds = Datastore::open_in_memory().unwrap();
        ds.add_workload(workload()).await.unwrap();
        ds.add_tenant("t1", "mac", 24).await.unwrap();
        ds.tenants()
            .modify("t1", |t| {
                t.quotas = vec![QuotaLimit {
                    kind: ResourceType::MemMB,
                    limit: Some(512),
                }];
                Ok(())
            })
            .await
            .unwrap();
        ds.instances().add(instance("i1", false)).await.unwrap();
        ds.instances().add(instance("i2", false)).await.unwrap();
        ds.instances().add(instance("c1", true)).await.unwrap();

        let quotas = Quotas::spawn();
        populate(&quotas, &ds).await.unwrap();

        let usage = quotas.usage("t1").await.unwrap();
        assert_eq!(usage[&ResourceType::Instance].used, 2);
        assert_eq!(usage[&ResourceType::MemMB].used, 1024);
        assert_eq!(usage[&ResourceType::MemMB].limit, Some(512));
        assert_eq!(usage[&ResourceType::VCPUs].used, 2);
        quotas.shutdown();
    }
}
