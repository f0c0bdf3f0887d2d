//! Handler-level tests for the CloudProvider service over in-memory
//! adapters.

use std::sync::Arc;

use tonic::Code;

use proxmox_ca_application::orchestrator::Orchestrator;
use proxmox_ca_domain::state_store::{StateStore, VmRecord};
use proxmox_ca_grpc::proto::*;
use proxmox_ca_grpc::services::CloudProviderService;
use proxmox_ca_infrastructure::testing::{FakeKube, FakeProxmox};
use proxmox_ca_infrastructure::SqliteStateStore;
use proxmox_ca_shared::config::{
    GroupConfig, InstanceShape, K3sConfig, ProviderSettings, ProxmoxConfig,
};
use proxmox_ca_shared::{VmState, Vmid};

fn settings() -> ProviderSettings {
    ProviderSettings {
        proxmox: ProxmoxConfig {
            api_url: "https://pve.example:8006".into(),
            node: "pve1".into(),
            token_id: "ca@pve!provider".into(),
            token_secret: "secret".into(),
            verify_tls: true,
            import_storage: "local".into(),
            iso_storage: "local".into(),
            vm_storage: "local-lvm".into(),
            bridge: "vmbr0".into(),
            cloud_image_url: "https://cloud.example/noble.qcow2".into(),
        },
        k3s: K3sConfig {
            version: "v1.31.4+k3s1".into(),
            server_url: "https://k3s.example:6443".into(),
            cluster_token: "join-token".into(),
            ssh_public_key: "ssh-ed25519 AAAA test@host".into(),
        },
        state_file: "/tmp/unused.db".into(),
        pending_vm_timeout_secs: 900,
        reconcile_interval_secs: 20,
        node_groups: vec![GroupConfig {
            id: "web".into(),
            name_prefix: "ca-web".into(),
            min_size: 0,
            max_size: 3,
            shape: InstanceShape::default(),
            labels: vec![],
            taints: vec![],
            template_payload: "{\"cpu\":\"2\"}".into(),
        }],
    }
}

struct TestStack {
    service: CloudProviderService,
    store: Arc<SqliteStateStore>,
    kube: Arc<FakeKube>,
}

async fn stack() -> TestStack {
    let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
    store.init().await.unwrap();
    let kube = Arc::new(FakeKube::new());
    let store_dyn: Arc<dyn StateStore> = store.clone();
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(settings()),
        store_dyn,
        Arc::new(FakeProxmox::new()),
        kube.clone(),
    ));
    TestStack {
        service: CloudProviderService::new(orchestrator),
        store,
        kube,
    }
}

async fn insert_row(store: &SqliteStateStore, vmid: u32, state: VmState) {
    store
        .insert_vm(&VmRecord {
            vmid: Vmid(vmid),
            group_id: "web".into(),
            hostname: format!("ca-web-{vmid}"),
            state,
            created_at: 1_700_000_000,
            last_transition_at: 1_700_000_000,
            last_error: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn node_groups_lists_the_configuration() {
    let stack = stack().await;
    let reply = stack.service.node_groups(NodeGroupsRequest {}).await.unwrap();
    assert_eq!(reply.node_groups.len(), 1);
    let group = &reply.node_groups[0];
    assert_eq!(group.id, "web");
    assert_eq!(group.min_size, 0);
    assert_eq!(group.max_size, 3);
}

#[tokio::test]
async fn target_size_round_trips_through_increase() {
    let stack = stack().await;
    let reply = stack
        .service
        .node_group_target_size(NodeGroupTargetSizeRequest { id: "web".into() })
        .await
        .unwrap();
    assert_eq!(reply.target_size, 0);

    stack
        .service
        .node_group_increase_size(NodeGroupIncreaseSizeRequest {
            id: "web".into(),
            delta: 2,
        })
        .await
        .unwrap();

    let reply = stack
        .service
        .node_group_target_size(NodeGroupTargetSizeRequest { id: "web".into() })
        .await
        .unwrap();
    assert_eq!(reply.target_size, 2);
}

#[tokio::test]
async fn increase_beyond_max_returns_out_of_range() {
    let stack = stack().await;
    let status = stack
        .service
        .node_group_increase_size(NodeGroupIncreaseSizeRequest {
            id: "web".into(),
            delta: 10,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::OutOfRange);

    let reply = stack
        .service
        .node_group_target_size(NodeGroupTargetSizeRequest { id: "web".into() })
        .await
        .unwrap();
    assert_eq!(reply.target_size, 0, "rejected call left desired untouched");
}

#[tokio::test]
async fn unknown_group_returns_not_found() {
    let stack = stack().await;
    let status = stack
        .service
        .node_group_target_size(NodeGroupTargetSizeRequest { id: "db".into() })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn node_group_nodes_reports_provider_ids_and_states() {
    let stack = stack().await;
    insert_row(&stack.store, 101, VmState::Active).await;
    insert_row(&stack.store, 102, VmState::Pending).await;
    insert_row(&stack.store, 103, VmState::Failed).await;

    let reply = stack
        .service
        .node_group_nodes(NodeGroupNodesRequest { id: "web".into() })
        .await
        .unwrap();

    assert_eq!(reply.instances.len(), 2, "failed rows are not live");
    let running = reply
        .instances
        .iter()
        .find(|i| i.id == "proxmox://web/101")
        .unwrap();
    assert_eq!(running.status.instance_state, InstanceState::Running);
    let creating = reply
        .instances
        .iter()
        .find(|i| i.id == "proxmox://web/102")
        .unwrap();
    assert_eq!(creating.status.instance_state, InstanceState::Creating);
}

#[tokio::test]
async fn node_group_for_node_decodes_provider_ids_without_the_api() {
    let stack = stack().await;
    // No node registered in Kubernetes; the provider id alone is enough.
    let reply = stack
        .service
        .node_group_for_node(NodeGroupForNodeRequest {
            node: ExternalGrpcNode {
                name: "ca-web-101".into(),
                provider_id: "proxmox://web/101".into(),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    assert_eq!(reply.node_group.id, "web");
}

#[tokio::test]
async fn node_group_for_node_reads_the_join_labels() {
    let stack = stack().await;
    stack.kube.register_node("ca-web-101", "web", Vmid(101));

    let reply = stack
        .service
        .node_group_for_node(NodeGroupForNodeRequest {
            node: ExternalGrpcNode {
                name: "ca-web-101".into(),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    assert_eq!(reply.node_group.id, "web");

    let reply = stack
        .service
        .node_group_for_node(NodeGroupForNodeRequest {
            node: ExternalGrpcNode {
                name: "some-control-plane".into(),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    assert_eq!(reply.node_group.id, "", "unmanaged nodes get an empty group");
}

#[tokio::test]
async fn delete_nodes_marks_and_decrements() {
    let stack = stack().await;
    stack
        .service
        .node_group_increase_size(NodeGroupIncreaseSizeRequest {
            id: "web".into(),
            delta: 2,
        })
        .await
        .unwrap();
    insert_row(&stack.store, 101, VmState::Active).await;
    insert_row(&stack.store, 102, VmState::Active).await;
    stack.kube.register_node("ca-web-101", "web", Vmid(101));

    stack
        .service
        .node_group_delete_nodes(NodeGroupDeleteNodesRequest {
            id: "web".into(),
            nodes: vec![ExternalGrpcNode {
                name: "ca-web-101".into(),
                provider_id: "proxmox://web/101".into(),
                ..Default::default()
            }],
        })
        .await
        .unwrap();

    let row = stack.store.get_vm(Vmid(101)).await.unwrap().unwrap();
    assert_eq!(row.state, VmState::DeletingVm);
    let reply = stack
        .service
        .node_group_target_size(NodeGroupTargetSizeRequest { id: "web".into() })
        .await
        .unwrap();
    assert_eq!(reply.target_size, 1);
}

#[tokio::test]
async fn template_info_and_gpu_surface_are_served_from_config() {
    let stack = stack().await;
    let reply = stack
        .service
        .node_group_template_node_info(NodeGroupTemplateNodeInfoRequest { id: "web".into() })
        .await
        .unwrap();
    assert_eq!(reply.node_payload, b"{\"cpu\":\"2\"}");

    let gpu = stack.service.gpu_label(GpuLabelRequest {}).await.unwrap();
    assert!(gpu.label.is_empty());

    let options = stack
        .service
        .node_group_get_options(NodeGroupAutoscalingOptionsRequest {
            id: "web".into(),
            defaults: AutoscalingOptions {
                scale_down_utilization_threshold: 0.5,
                ..Default::default()
            },
        })
        .await
        .unwrap();
    assert_eq!(
        options
            .node_group_autoscaling_options
            .scale_down_utilization_threshold,
        0.5
    );
}

#[tokio::test]
async fn refresh_is_a_no_op() {
    let stack = stack().await;
    stack.service.refresh(RefreshRequest {}).await.unwrap();
}
