//! Kubernetes port
//!
//! Read-mostly view of the cluster: resolve a node name to the group/vmid it
//! was joined with, and delete node objects during teardown. Nodes carry the
//! two well-known labels below from the moment the k3s agent registers.

use async_trait::async_trait;

use proxmox_ca_shared::Vmid;

/// Node label naming the owning group, set at join time.
pub const LABEL_GROUP: &str = "autoscaler.proxmox/group";

/// Node label naming the backing vmid, set at join time.
pub const LABEL_VMID: &str = "autoscaler.proxmox/vmid";

/// The managed identity a node advertises through its labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAssignment {
    pub group_id: String,
    pub vmid: Vmid,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum KubeError {
    /// API unreachable or request failed; retry next tick
    #[error("transient kubernetes error: {message}")]
    Transient { message: String },

    /// The node does not exist, or carries no managed labels
    #[error("node not found: {name}")]
    NotFound { name: String },
}

impl KubeError {
    pub fn transient(message: impl Into<String>) -> Self {
        KubeError::Transient {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Look up a node by name and read its managed labels.
    ///
    /// Implementations may cache results for a short TTL (at most 30s) to
    /// tolerate flapping.
    async fn resolve(&self, node_name: &str) -> Result<NodeAssignment, KubeError>;

    /// Delete the node object. An already-absent node is success.
    async fn delete_node(&self, node_name: &str) -> Result<(), KubeError>;
}
