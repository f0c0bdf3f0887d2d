//! Configuration Data Transfer Objects
//!
//! Immutable configuration values loaded once at startup. The structs mirror
//! the YAML document; the loader fills in environment overrides before
//! validation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ids::Vmid;

/// Root configuration for the provider.
///
/// This is the single source of truth for all configuration; it is loaded by
/// [`super::ConfigLoader`] and handed to every component at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Proxmox endpoint, credentials and storage layout
    #[serde(default)]
    pub proxmox: ProxmoxConfig,

    /// k3s join parameters baked into every seed image
    #[serde(default)]
    pub k3s: K3sConfig,

    /// Path of the durable state database
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Seconds a VM may stay in `pending` before it is failed
    #[serde(default = "default_pending_vm_timeout")]
    pub pending_vm_timeout_secs: u64,

    /// Seconds between reconcile ticks
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Managed node groups, immutable at runtime
    #[serde(default)]
    pub node_groups: Vec<GroupConfig>,
}

impl ProviderSettings {
    pub fn group(&self, group_id: &str) -> Option<&GroupConfig> {
        self.node_groups.iter().find(|g| g.id == group_id)
    }
}

/// Proxmox API endpoint and VM placement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxConfig {
    /// Base API URL, e.g. `https://pve.example:8006`
    #[serde(default)]
    pub api_url: String,

    /// Proxmox node that hosts the managed VMs
    #[serde(default)]
    pub node: String,

    /// API token id, `user@realm!tokenname`
    #[serde(default)]
    pub token_id: String,

    /// API token secret
    #[serde(default)]
    pub token_secret: String,

    /// Verify the API server's TLS certificate
    #[serde(default = "default_true")]
    pub verify_tls: bool,

    /// Storage that receives the downloaded cloud image
    #[serde(default = "default_local_storage")]
    pub import_storage: String,

    /// Storage that holds seed ISO volumes
    #[serde(default = "default_local_storage")]
    pub iso_storage: String,

    /// Storage that backs VM disks
    #[serde(default = "default_vm_storage")]
    pub vm_storage: String,

    /// Bridge the VM NIC attaches to
    #[serde(default = "default_bridge")]
    pub bridge: String,

    /// URL of the cloud image imported as the boot disk
    #[serde(default)]
    pub cloud_image_url: String,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            node: String::new(),
            token_id: String::new(),
            token_secret: String::new(),
            verify_tls: true,
            import_storage: default_local_storage(),
            iso_storage: default_local_storage(),
            vm_storage: default_vm_storage(),
            bridge: default_bridge(),
            cloud_image_url: String::new(),
        }
    }
}

/// k3s agent join configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct K3sConfig {
    /// Pinned k3s release installed on every node
    #[serde(default = "default_k3s_version")]
    pub version: String,

    /// URL of the k3s server the agents join
    #[serde(default)]
    pub server_url: String,

    /// Cluster join token
    #[serde(default)]
    pub cluster_token: String,

    /// SSH public key installed for the default user
    #[serde(default)]
    pub ssh_public_key: String,
}

impl Default for K3sConfig {
    fn default() -> Self {
        Self {
            version: default_k3s_version(),
            server_url: String::new(),
            cluster_token: String::new(),
            ssh_public_key: String::new(),
        }
    }
}

/// Instance shape shared by every VM in a group
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstanceShape {
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

impl Default for InstanceShape {
    fn default() -> Self {
        Self {
            cores: 2,
            memory_mb: 2048,
            disk_gb: 20,
        }
    }
}

/// A managed node group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Short unique identifier; also part of the Proxmox tag and provider id
    pub id: String,

    /// Hostname prefix; defaults to `ca-<id>` when absent from the document
    #[serde(default)]
    pub name_prefix: String,

    #[serde(default)]
    pub min_size: u32,

    #[serde(default = "default_max_size")]
    pub max_size: u32,

    #[serde(default)]
    pub shape: InstanceShape,

    /// Extra node labels passed to the k3s agent at join
    #[serde(default)]
    pub labels: Vec<String>,

    /// Node taints passed to the k3s agent at join
    #[serde(default)]
    pub taints: Vec<String>,

    /// Opaque per-group node description returned to the autoscaler
    #[serde(default)]
    pub template_payload: String,
}

impl GroupConfig {
    /// Hostname of the VM with the given id, `<name_prefix>-<vmid>`.
    ///
    /// The hostname doubles as the Kubernetes node name once the agent joins.
    pub fn hostname(&self, vmid: Vmid) -> String {
        format!("{}-{}", self.name_prefix, vmid)
    }
}

fn default_true() -> bool {
    true
}

fn default_local_storage() -> String {
    "local".to_string()
}

fn default_vm_storage() -> String {
    "local-lvm".to_string()
}

fn default_bridge() -> String {
    "vmbr0".to_string()
}

fn default_k3s_version() -> String {
    "v1.31.4+k3s1".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/proxmox-ca/state.db")
}

fn default_pending_vm_timeout() -> u64 {
    900
}

fn default_reconcile_interval() -> u64 {
    20
}

fn default_max_size() -> u32 {
    10
}
