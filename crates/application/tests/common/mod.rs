#![allow(dead_code)]
//! Shared test harness: one group, an in-memory store, and the in-memory
//! Proxmox/Kubernetes doubles from the infrastructure crate.

use std::sync::Arc;

use proxmox_ca_application::orchestrator::Orchestrator;
use proxmox_ca_application::reconcile::Reconciler;
use proxmox_ca_application::scaling::ScalingService;
use proxmox_ca_domain::state_store::{StateStore, VmRecord};
use proxmox_ca_infrastructure::testing::{FakeKube, FakeProxmox};
use proxmox_ca_infrastructure::SqliteStateStore;
use proxmox_ca_shared::config::{
    GroupConfig, InstanceShape, K3sConfig, ProviderSettings, ProxmoxConfig,
};
use proxmox_ca_shared::{VmState, Vmid};

pub const GROUP: &str = "web";

pub fn settings_with_group(min_size: u32, max_size: u32) -> ProviderSettings {
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
            id: GROUP.into(),
            name_prefix: format!("ca-{GROUP}"),
            min_size,
            max_size,
            shape: InstanceShape::default(),
            labels: vec![],
            taints: vec![],
            template_payload: "{\"cpu\":\"2\",\"memory\":\"2Gi\"}".into(),
        }],
    }
}

pub struct Harness {
    pub settings: Arc<ProviderSettings>,
    pub store: Arc<SqliteStateStore>,
    pub proxmox: Arc<FakeProxmox>,
    pub kube: Arc<FakeKube>,
    pub scaling: Arc<ScalingService>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub async fn new(settings: ProviderSettings) -> Self {
        let settings = Arc::new(settings);
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        store.init().await.unwrap();
        let proxmox = Arc::new(FakeProxmox::new());
        let kube = Arc::new(FakeKube::new());

        let store_dyn: Arc<dyn StateStore> = store.clone();
        let scaling = Arc::new(ScalingService::new(
            settings.clone(),
            store_dyn.clone(),
            kube.clone(),
        ));
        let reconciler = Reconciler::new(
            settings.clone(),
            store_dyn,
            proxmox.clone(),
            kube.clone(),
            scaling.clone(),
        );
        Self {
            settings,
            store,
            proxmox,
            kube,
            scaling,
            reconciler,
        }
    }

    pub fn group(&self) -> &GroupConfig {
        self.settings.group(GROUP).unwrap()
    }

    /// One reconcile pass over every configured group.
    pub async fn tick(&self) {
        for group in &self.settings.node_groups {
            self.reconciler.reconcile_group(group).await;
        }
    }

    pub async fn rows(&self) -> Vec<VmRecord> {
        self.store.list_vms(GROUP).await.unwrap()
    }

    pub async fn row(&self, vmid: Vmid) -> Option<VmRecord> {
        self.store.get_vm(vmid).await.unwrap()
    }

    pub async fn desired(&self) -> u32 {
        self.scaling.target_size(GROUP).await.unwrap()
    }

    pub async fn live_count(&self) -> u32 {
        self.store.count_live(GROUP).await.unwrap()
    }

    /// Register the kube node for an existing row, as the k3s agent would.
    pub async fn join_node(&self, vmid: Vmid) {
        let record = self.row(vmid).await.expect("row exists");
        self.kube.register_node(&record.hostname, GROUP, vmid);
    }

    /// Insert a row directly, bypassing the reconciler (test setups).
    pub async fn insert_row(&self, vmid: Vmid, state: VmState, created_at: i64) {
        let group = self.group();
        self.store
            .insert_vm(&VmRecord {
                vmid,
                group_id: group.id.clone(),
                hostname: group.hostname(vmid),
                state,
                created_at,
                last_transition_at: created_at,
                last_error: None,
            })
            .await
            .unwrap();
    }

    pub fn orchestrator(self) -> Arc<Orchestrator> {
        let store_dyn: Arc<dyn StateStore> = self.store.clone();
        Arc::new(Orchestrator::new(
            self.settings.clone(),
            store_dyn,
            self.proxmox.clone(),
            self.kube.clone(),
        ))
    }

    pub fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}
