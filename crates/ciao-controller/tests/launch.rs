//! End-to-end launch and teardown tests.
//!
//! Every test runs a real in-memory datastore, a live quota ledger and the
//! in-memory volume service.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ciao_controller::*;
use ciao_datastore::*;
use ciao_quotas::{QuotaLimit, Quotas, ResourceType};

const TENANT: &str = "tenant-a";
const SUBNET: &str = "172.16.0.0/24";
const CNCI_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 10);

fn controller() -> Controller<MemoryVolumes> {
    let ds = Arc::new(Datastore::open_in_memory().unwrap());
    Controller::new(ds, Quotas::spawn(), MemoryVolumes::new(), ControllerConfig::default())
}

fn web_workload() -> Workload {
    Workload {
        id: "web".to_string(),
        description: "web server".to_string(),
        vm_type: VmType::Qemu,
        fw_type: FirmwareType::Efi,
        image_name: None,
        config: "#cloud-config\nruncmd: []\n".to_string(),
        storage: vec![WorkloadStorage {
            source: StorageSource::Image {
                image_ref: "ubuntu".to_string(),
            },
            size_gib: 10,
            bootable: true,
            ephemeral: true,
            internal: false,
        }],
        requirements: WorkloadRequirements {
            mem_mb: 512,
            vcpus: 1,
            network_node: false,
        },
    }
}

fn launch(workload_id: &str, name: Option<&str>) -> LaunchRequest {
    LaunchRequest {
        tenant_id: TENANT.to_string(),
        workload_id: workload_id.to_string(),
        name: name.map(str::to_string),
    }
}

/// Launch and register a concentrator for the tenant's first subnet.
async fn with_concentrator(ctl: &Controller<MemoryVolumes>) -> String {
    let spec = ControllerConfig::default().cnci.workload_spec();
    let workload_id = ctl.datastore().generate_cnci_workload(&spec).await.unwrap();
    let cnci = ctl.launch_instance(launch(&workload_id, None)).await.unwrap();
    assert!(cnci.instance.cnci);
    assert!(cnci.instance.ip_address.is_none());

    ctl.register_cnci(TENANT, SUBNET, &cnci.instance.id, CNCI_IP)
        .await
        .unwrap();
    cnci.instance.id
}

async fn setup() -> (Controller<MemoryVolumes>, String) {
    let ctl = controller();
    ctl.datastore().add_workload(web_workload()).await.unwrap();
    let cnci_id = with_concentrator(&ctl).await;
    (ctl, cnci_id)
}

async fn used(ctl: &Controller<MemoryVolumes>, kind: ResourceType) -> u64 {
    let usage = ctl.quotas().usage(TENANT).await.unwrap();
    usage.get(&kind).map_or(0, |u| u.used)
}

#[tokio::test]
async fn launch_builds_document_and_records_instance() {
    let (ctl, cnci_id) = setup().await;

    let result = ctl.launch_instance(launch("web", Some("frontend"))).await.unwrap();
    let instance = &result.instance;

    assert_eq!(instance.state, InstanceState::Pending);
    assert_eq!(instance.ip_address, Some(Ipv4Addr::new(172, 16, 0, 2)));
    assert_eq!(instance.mac_address, "02:00:ac:10:00:02");
    assert_eq!(instance.subnet.as_deref(), Some(SUBNET));
    assert!(result.attachment_errors.is_empty());

    let net = &result.start.start.networking;
    assert_eq!(net.concentrator_uuid, cnci_id);
    assert_eq!(net.concentrator_ip, Some(CNCI_IP));

    assert!(result.document.starts_with("---\nstart:\n"));
    assert!(result.document.contains(&instance.id));
    assert!(result.document.contains("...\n#cloud-config\nruncmd: []\n---\n"));
    assert!(result.document.ends_with("\t\"hostname\": \"frontend\"\n}\n...\n"));

    let stored = ctl.datastore().instances().get_no_cache(&instance.id).unwrap();
    assert_eq!(stored.as_ref(), Some(instance));

    let attachments = ctl.datastore().attachments().list_for_instance(&instance.id).await;
    assert_eq!(attachments.len(), 1);
    assert!(attachments[0].ephemeral);
    let block = ctl.datastore().block_devices().get(&attachments[0].block_id).await.unwrap();
    assert_eq!(block.state, BlockState::InUse);

    assert_eq!(used(&ctl, ResourceType::Instance).await, 1);
    assert_eq!(used(&ctl, ResourceType::MemMB).await, 512);
    ctl.datastore().check_consistency().await.unwrap();
}

#[tokio::test]
async fn launch_without_concentrator_leaves_nothing_behind() {
    let ctl = controller();
    ctl.datastore().add_workload(web_workload()).await.unwrap();

    let err = ctl.launch_instance(launch("web", None)).await.unwrap_err();
    assert!(matches!(err, ControllerError::NoConcentrator { ref subnet, .. } if subnet == SUBNET));
    assert_eq!(err.class(), ErrorClass::DependencyFailure);

    let tenant = ctl.datastore().tenants().get(TENANT).await.unwrap();
    assert!(tenant.allocated_ips.is_empty());
    assert_eq!(used(&ctl, ResourceType::Instance).await, 0);
    assert!(ctl.volumes().volume_ids().await.is_empty());
    assert!(ctl.datastore().instances().list().await.is_empty());
}

#[tokio::test]
async fn unknown_workload_is_not_found() {
    let ctl = controller();
    let err = ctl.launch_instance(launch("missing", None)).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFound);
}

#[tokio::test]
async fn concurrent_launches_respect_quota() {
    let (ctl, _) = setup().await;
    ctl.quotas().set_limits(
        TENANT,
        vec![
            QuotaLimit {
                kind: ResourceType::Instance,
                limit: Some(5),
            },
            QuotaLimit {
                kind: ResourceType::MemMB,
                limit: Some(1024),
            },
            QuotaLimit {
                kind: ResourceType::VCPUs,
                limit: Some(2),
            },
        ],
    );

    let (a, b, c) = tokio::join!(
        ctl.launch_instance(launch("web", None)),
        ctl.launch_instance(launch("web", None)),
        ctl.launch_instance(launch("web", None)),
    );
    let results = [a, b, c];
    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let denied: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();

    assert_eq!(admitted, 2);
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].class(), ErrorClass::QuotaExceeded);

    assert_eq!(used(&ctl, ResourceType::Instance).await, 2);
    assert_eq!(used(&ctl, ResourceType::MemMB).await, 1024);
    assert_eq!(used(&ctl, ResourceType::VCPUs).await, 2);

    // The denied launch gave its address and volume back.
    let tenant = ctl.datastore().tenants().get(TENANT).await.unwrap();
    assert_eq!(tenant.allocated_ips.len(), 2);
    // One volume per admitted instance plus the concentrator's.
    assert_eq!(ctl.volumes().volume_ids().await.len(), 3);
    assert_eq!(ctl.datastore().block_devices().list().await.len(), 3);
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let (ctl, _) = setup().await;
    ctl.launch_instance(launch("web", Some("db"))).await.unwrap();

    let err = ctl.launch_instance(launch("web", Some("db"))).await.unwrap_err();
    assert!(matches!(err, ControllerError::NameInUse(ref name) if name == "db"));
    assert_eq!(err.class(), ErrorClass::Conflict);

    let tenant = ctl.datastore().tenants().get(TENANT).await.unwrap();
    assert_eq!(tenant.allocated_ips.len(), 1);
    assert_eq!(used(&ctl, ResourceType::Instance).await, 1);
}

#[tokio::test]
async fn volume_failure_rolls_back() {
    let (ctl, _) = setup().await;
    let volumes_before = ctl.volumes().volume_ids().await;
    ctl.volumes().fail_creates(true);

    let err = ctl.launch_instance(launch("web", None)).await.unwrap_err();
    assert!(matches!(err, ControllerError::Volume(_)));
    assert_eq!(err.class(), ErrorClass::DependencyFailure);

    let tenant = ctl.datastore().tenants().get(TENANT).await.unwrap();
    assert!(tenant.allocated_ips.is_empty());
    assert_eq!(used(&ctl, ResourceType::Instance).await, 0);
    assert_eq!(ctl.volumes().volume_ids().await, volumes_before);
    assert_eq!(ctl.datastore().instances().list().await.len(), 1);

    ctl.volumes().fail_creates(false);
    let retry = ctl.launch_instance(launch("web", None)).await.unwrap();
    assert_eq!(retry.instance.ip_address, Some(Ipv4Addr::new(172, 16, 0, 2)));
}

#[tokio::test]
async fn delete_releases_everything() {
    let (ctl, _) = setup().await;
    let volumes_before = ctl.volumes().volume_ids().await;
    let launched = ctl.launch_instance(launch("web", Some("tmp"))).await.unwrap();
    let id = launched.instance.id.clone();

    ctl.delete_instance(&id).await.unwrap();

    assert!(ctl.datastore().instances().get(&id).await.is_none());
    assert!(ctl.datastore().attachments().list_for_instance(&id).await.is_empty());
    assert_eq!(ctl.volumes().volume_ids().await, volumes_before);
    let tenant = ctl.datastore().tenants().get(TENANT).await.unwrap();
    assert!(tenant.allocated_ips.is_empty());
    assert_eq!(tenant.devices.len(), 1);
    assert_eq!(used(&ctl, ResourceType::Instance).await, 0);
    assert_eq!(used(&ctl, ResourceType::MemMB).await, 0);

    // The name is free again.
    ctl.launch_instance(launch("web", Some("tmp"))).await.unwrap();
    ctl.datastore().check_consistency().await.unwrap();

    let err = ctl.delete_instance(&id).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFound);
}

#[tokio::test]
async fn delete_is_refused_while_address_is_mapped() {
    let (ctl, _) = setup().await;
    let launched = ctl.launch_instance(launch("web", None)).await.unwrap();
    let ds = ctl.datastore();
    ds.pools().create(Pool::new("p1", "public")).await.unwrap();
    ds.pools()
        .add_external_ips("p1", &[Ipv4Addr::new(203, 0, 113, 5)])
        .await
        .unwrap();
    let mapping = ds.map_external_ip("p1", &launched.instance.id).await.unwrap();

    let err = ctl.delete_instance(&launched.instance.id).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Conflict);
    assert!(ds.instances().get(&launched.instance.id).await.is_some());

    ds.unmap_external_ip(mapping.external_ip).await.unwrap();
    ctl.delete_instance(&launched.instance.id).await.unwrap();
}

#[tokio::test]
async fn deleting_concentrator_unregisters_subnet() {
    let (ctl, cnci_id) = setup().await;
    ctl.delete_instance(&cnci_id).await.unwrap();

    let tenant = ctl.datastore().tenants().get(TENANT).await.unwrap();
    assert!(tenant.subnet_cncis.is_empty());
    assert!(tenant.cnci_id.is_none());

    let err = ctl.launch_instance(launch("web", None)).await.unwrap_err();
    assert!(matches!(err, ControllerError::NoConcentrator { .. }));
}

#[tokio::test]
async fn wait_for_state_sees_updates() {
    let (ctl, _) = setup().await;
    let id = ctl.launch_instance(launch("web", None)).await.unwrap().instance.id;

    let (waited, updated) = tokio::join!(
        ctl.wait_for_state(&id, InstanceState::Running),
        async {
            tokio::task::yield_now().await;
            ctl.update_instance_state(&id, InstanceState::Running).await
        }
    );
    waited.unwrap();
    assert_eq!(updated.unwrap().state, InstanceState::Running);

    // Already there.
    ctl.wait_for_state(&id, InstanceState::Running).await.unwrap();
}

#[tokio::test]
async fn wait_for_state_fails_when_instance_is_deleted() {
    let (ctl, _) = setup().await;
    let id = ctl.launch_instance(launch("web", None)).await.unwrap().instance.id;

    let (waited, deleted) = tokio::join!(
        ctl.wait_for_state(&id, InstanceState::Running),
        async {
            tokio::task::yield_now().await;
            ctl.delete_instance(&id).await
        }
    );
    deleted.unwrap();
    assert_eq!(waited.unwrap_err().class(), ErrorClass::NotFound);
}

#[tokio::test]
async fn missing_block_device_is_reported_but_not_fatal() {
    let (ctl, _) = setup().await;
    let mut workload = web_workload();
    workload.id = "attach".to_string();
    workload.storage = vec![WorkloadStorage {
        source: StorageSource::Existing {
            id: "missing".to_string(),
        },
        size_gib: 0,
        bootable: false,
        ephemeral: false,
        internal: false,
    }];
    ctl.datastore().add_workload(workload).await.unwrap();

    let result = ctl.launch_instance(launch("attach", None)).await.unwrap();
    assert_eq!(result.attachment_errors.len(), 1);
    assert_eq!(result.attachment_errors[0].class(), ErrorClass::NotFound);

    let id = &result.instance.id;
    assert!(ctl.datastore().instances().get_no_cache(id).unwrap().is_some());
    assert!(ctl.datastore().attachments().list_for_instance(id).await.is_empty());
    assert_eq!(result.start.start.storage[0].id, "missing");
    assert_eq!(used(&ctl, ResourceType::Instance).await, 1);
}

#[tokio::test]
async fn abandoned_launch_gives_everything_back() {
    let (ctl, _) = setup().await;
    let mut workload = web_workload();
    workload.storage.push(workload.storage[0].clone());
    workload.id = "two-disks".to_string();
    ctl.datastore().add_workload(workload).await.unwrap();
    let volumes_before = ctl.volumes().volume_ids().await;

    // The first volume lands, the launch is dropped while the second is
    // still being created.
    ctl.volumes().delay_creates(Duration::from_millis(100));
    let outcome = tokio::time::timeout(
        Duration::from_millis(150),
        ctl.launch_instance(launch("two-disks", None)),
    )
    .await;
    assert!(outcome.is_err());
    ctl.volumes().delay_creates(Duration::ZERO);

    let ds = ctl.datastore();
    for _ in 0..100 {
        let tenant = ds.tenants().get(TENANT).await.unwrap();
        if tenant.allocated_ips.is_empty() && ctl.volumes().volume_ids().await == volumes_before {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let tenant = ds.tenants().get(TENANT).await.unwrap();
    assert!(tenant.allocated_ips.is_empty());
    assert_eq!(tenant.devices.len(), 1);
    assert_eq!(ctl.volumes().volume_ids().await, volumes_before);
    assert_eq!(ds.block_devices().list().await.len(), 1);
    assert_eq!(ds.instances().list().await.len(), 1);
    assert_eq!(used(&ctl, ResourceType::Instance).await, 0);
    ds.check_consistency().await.unwrap();

    let retry = ctl.launch_instance(launch("web", None)).await.unwrap();
    assert_eq!(retry.instance.ip_address, Some(Ipv4Addr::new(172, 16, 0, 2)));
}

#[tokio::test]
async fn report_before_first_subscriber_is_not_lost() {
    let (ctl, _) = setup().await;
    let id = ctl.launch_instance(launch("web", None)).await.unwrap().instance.id;

    // A second controller over the same store starts with no channels.
    let restarted = Controller::new(
        ctl.datastore().clone(),
        ctl.quotas().clone(),
        MemoryVolumes::new(),
        ControllerConfig::default(),
    );
    restarted.update_instance_state(&id, InstanceState::Running).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(1),
        restarted.wait_for_state(&id, InstanceState::Running),
    )
    .await
    .unwrap()
    .unwrap();

    // The launching controller created the channel before persisting.
    let mut rx = ctl.subscribe(&id).await.unwrap();
    ctl.update_instance_state(&id, InstanceState::Running).await.unwrap();
    assert_eq!(*rx.borrow_and_update(), InstanceState::Running);
}
