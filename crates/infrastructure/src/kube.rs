//! Kubernetes adapter
//!
//! Node lookup over kube-rs. `resolve` reads the two provider labels off the
//! named node and caches the answer (including negative answers) for a short
//! TTL so a flapping API does not whipsaw the reconciler.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams};
use kube::Client;
use tokio::sync::RwLock;
use tracing::debug;

use proxmox_ca_domain::kube_api::{KubeApi, KubeError, NodeAssignment, LABEL_GROUP, LABEL_VMID};
use proxmox_ca_shared::Vmid;

/// Cache lifetime; the port contract allows at most 30s.
const RESOLVE_TTL: Duration = Duration::from_secs(15);

pub struct KubeAdapter {
    nodes: Api<Node>,
    cache: RwLock<HashMap<String, (Instant, Option<NodeAssignment>)>>,
}

impl KubeAdapter {
    /// Connect using the in-cluster service account or the local kubeconfig,
    /// whichever the environment provides.
    pub async fn try_default() -> Result<Self, KubeError> {
        let client = Client::try_default()
            .await
            .map_err(|e| KubeError::transient(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn assignment_from_node(node: &Node) -> Option<NodeAssignment> {
        let labels = node.metadata.labels.as_ref()?;
        let group_id = labels.get(LABEL_GROUP)?.trim();
        let vmid = labels.get(LABEL_VMID)?.trim().parse::<u32>().ok()?;
        if group_id.is_empty() {
            return None;
        }
        Some(NodeAssignment {
            group_id: group_id.to_string(),
            vmid: Vmid(vmid),
        })
    }
}

#[async_trait]
impl KubeApi for KubeAdapter {
    async fn resolve(&self, node_name: &str) -> Result<NodeAssignment, KubeError> {
        {
            let cache = self.cache.read().await;
            if let Some((stamp, cached)) = cache.get(node_name) {
                if stamp.elapsed() < RESOLVE_TTL {
                    return match cached {
                        Some(assignment) => Ok(assignment.clone()),
                        None => Err(KubeError::NotFound {
                            name: node_name.to_string(),
                        }),
                    };
                }
            }
        }

        let node = self
            .nodes
            .get_opt(node_name)
            .await
            .map_err(|e| KubeError::transient(e.to_string()))?;
        let assignment = node.as_ref().and_then(Self::assignment_from_node);
        debug!(
            target: "proxmox_ca::kube",
            node = %node_name,
            resolved = assignment.is_some(),
            "node lookup"
        );

        self.cache
            .write()
            .await
            .insert(node_name.to_string(), (Instant::now(), assignment.clone()));

        assignment.ok_or_else(|| KubeError::NotFound {
            name: node_name.to_string(),
        })
    }

    async fn delete_node(&self, node_name: &str) -> Result<(), KubeError> {
        match self.nodes.delete(node_name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(KubeError::transient(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn node_with_labels(labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn reads_provider_labels() {
        let node = node_with_labels(&[
            ("autoscaler.proxmox/group", "web"),
            ("autoscaler.proxmox/vmid", "101"),
            ("kubernetes.io/os", "linux"),
        ]);
        let assignment = KubeAdapter::assignment_from_node(&node).unwrap();
        assert_eq!(assignment.group_id, "web");
        assert_eq!(assignment.vmid, Vmid(101));
    }

    #[test]
    fn unmanaged_nodes_resolve_to_none() {
        assert!(KubeAdapter::assignment_from_node(&node_with_labels(&[(
            "kubernetes.io/os",
            "linux"
        )]))
        .is_none());
        assert!(KubeAdapter::assignment_from_node(&node_with_labels(&[
            ("autoscaler.proxmox/group", "web"),
            ("autoscaler.proxmox/vmid", "not-a-number"),
        ]))
        .is_none());
    }
}
