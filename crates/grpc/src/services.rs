//! CloudProvider service handlers
//!
//! One method per protocol operation, each strictly non-blocking with
//! respect to Proxmox: handlers only consult the orchestrator's store-backed
//! entry points and reply. The reconciler does the slow work on its own
//! schedule, which is why `Refresh` is a no-op.

use std::sync::Arc;

use tonic::Status;
use tracing::info;

use proxmox_ca_application::orchestrator::Orchestrator;
use proxmox_ca_domain::state_store::VmRecord;
use proxmox_ca_shared::config::GroupConfig;
use proxmox_ca_shared::{ids, VmState};

use crate::proto::*;
use crate::to_status;

pub struct CloudProviderService {
    orchestrator: Arc<Orchestrator>,
}

impl CloudProviderService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn node_groups(
        &self,
        _request: NodeGroupsRequest,
    ) -> Result<NodeGroupsResponse, Status> {
        let node_groups = self
            .orchestrator
            .node_groups()
            .iter()
            .map(group_reply)
            .collect();
        Ok(NodeGroupsResponse { node_groups })
    }

    pub async fn node_group_for_node(
        &self,
        request: NodeGroupForNodeRequest,
    ) -> Result<NodeGroupForNodeResponse, Status> {
        // Nodes we provisioned carry our provider id; decoding it saves the
        // API round trip.
        if let Some((group_id, _)) = ids::parse_provider_id(&request.node.provider_id) {
            if let Ok(group) = self.orchestrator.group(&group_id) {
                return Ok(NodeGroupForNodeResponse {
                    node_group: group_reply(group),
                });
            }
        }
        let group = self
            .orchestrator
            .node_group_for_node(&request.node.name)
            .await
            .map_err(to_status)?;
        Ok(NodeGroupForNodeResponse {
            node_group: group.map(group_reply).unwrap_or_default(),
        })
    }

    pub async fn node_group_target_size(
        &self,
        request: NodeGroupTargetSizeRequest,
    ) -> Result<NodeGroupTargetSizeResponse, Status> {
        let target_size = self
            .orchestrator
            .target_size(&request.id)
            .await
            .map_err(to_status)?;
        Ok(NodeGroupTargetSizeResponse {
            target_size: target_size as i32,
        })
    }

    pub async fn node_group_increase_size(
        &self,
        request: NodeGroupIncreaseSizeRequest,
    ) -> Result<NodeGroupIncreaseSizeResponse, Status> {
        self.orchestrator
            .increase_size(&request.id, request.delta as i64)
            .await
            .map_err(to_status)?;
        Ok(NodeGroupIncreaseSizeResponse {})
    }

    pub async fn node_group_decrease_target_size(
        &self,
        request: NodeGroupDecreaseTargetSizeRequest,
    ) -> Result<NodeGroupDecreaseTargetSizeResponse, Status> {
        self.orchestrator
            .decrease_target_size(&request.id, request.delta as i64)
            .await
            .map_err(to_status)?;
        Ok(NodeGroupDecreaseTargetSizeResponse {})
    }

    pub async fn node_group_delete_nodes(
        &self,
        request: NodeGroupDeleteNodesRequest,
    ) -> Result<NodeGroupDeleteNodesResponse, Status> {
        let names: Vec<String> = request.nodes.iter().map(|n| n.name.clone()).collect();
        self.orchestrator
            .delete_nodes(&request.id, &names)
            .await
            .map_err(to_status)?;
        Ok(NodeGroupDeleteNodesResponse {})
    }

    pub async fn node_group_nodes(
        &self,
        request: NodeGroupNodesRequest,
    ) -> Result<NodeGroupNodesResponse, Status> {
        let rows = self
            .orchestrator
            .node_group_nodes(&request.id)
            .await
            .map_err(to_status)?;
        Ok(NodeGroupNodesResponse {
            instances: rows.iter().filter_map(instance_reply).collect(),
        })
    }

    pub async fn node_group_template_node_info(
        &self,
        request: NodeGroupTemplateNodeInfoRequest,
    ) -> Result<NodeGroupTemplateNodeInfoResponse, Status> {
        let group = self.orchestrator.group(&request.id).map_err(to_status)?;
        Ok(NodeGroupTemplateNodeInfoResponse {
            node_payload: group.template_payload.clone().into_bytes(),
        })
    }

    pub async fn node_group_get_options(
        &self,
        request: NodeGroupAutoscalingOptionsRequest,
    ) -> Result<NodeGroupAutoscalingOptionsResponse, Status> {
        self.orchestrator.group(&request.id).map_err(to_status)?;
        Ok(NodeGroupAutoscalingOptionsResponse {
            node_group_autoscaling_options: request.defaults,
        })
    }

    pub async fn gpu_label(&self, _request: GpuLabelRequest) -> Result<GpuLabelResponse, Status> {
        Ok(GpuLabelResponse {
            label: String::new(),
        })
    }

    pub async fn get_available_gpu_types(
        &self,
        _request: GetAvailableGpuTypesRequest,
    ) -> Result<GetAvailableGpuTypesResponse, Status> {
        Ok(GetAvailableGpuTypesResponse::default())
    }

    /// The reconciler refreshes autonomously on its own interval.
    pub async fn refresh(&self, _request: RefreshRequest) -> Result<RefreshResponse, Status> {
        Ok(RefreshResponse {})
    }

    /// Shutdown hook: stop the reconcile loop at the next tick boundary.
    pub async fn cleanup(&self, _request: CleanupRequest) -> Result<CleanupResponse, Status> {
        info!(target: "proxmox_ca::grpc", "cleanup requested, stopping reconciler");
        self.orchestrator.stop().await;
        Ok(CleanupResponse {})
    }
}

fn group_reply(group: &GroupConfig) -> NodeGroup {
    NodeGroup {
        id: group.id.clone(),
        min_size: group.min_size as i32,
        max_size: group.max_size as i32,
        debug: format!("group={} prefix={}", group.id, group.name_prefix),
    }
}

/// Only live rows are reported to the autoscaler; a row in any other state
/// yields `None`.
fn instance_reply(record: &VmRecord) -> Option<Instance> {
    let instance_state = match record.state {
        VmState::Active => InstanceState::Running,
        VmState::Pending => InstanceState::Creating,
        VmState::Failed
        | VmState::DeletingVm
        | VmState::DeletingIso
        | VmState::DeletingNode => return None,
    };
    Some(Instance {
        id: ids::provider_id(&record.group_id, record.vmid),
        status: InstanceStatus {
            instance_state,
            error_info: record.last_error.clone().unwrap_or_default(),
        },
    })
}
