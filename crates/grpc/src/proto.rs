//! Typed records of the externalgrpc CloudProvider schema
//!
//! Hand-maintained mirrors of the protocol messages the provider handles.
//! The generated transport stub owns the wire encoding; these records keep
//! the service layer statically typed and the adapter boundary narrow.

use std::collections::HashMap;

/// The subset of a Kubernetes node the autoscaler sends with its requests.
#[derive(Debug, Clone, Default)]
pub struct ExternalGrpcNode {
    pub name: String,
    pub provider_id: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroup {
    pub id: String,
    pub min_size: i32,
    pub max_size: i32,
    pub debug: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceState {
    #[default]
    Unspecified,
    Running,
    Creating,
    Deleting,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceStatus {
    pub instance_state: InstanceState,
    pub error_info: String,
}

#[derive(Debug, Clone, Default)]
pub struct Instance {
    pub id: String,
    pub status: InstanceStatus,
}

/// Autoscaling options echoed through `NodeGroupGetOptions`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoscalingOptions {
    pub scale_down_utilization_threshold: f64,
    pub scale_down_gpu_utilization_threshold: f64,
    pub scale_down_unneeded_time_secs: i64,
    pub scale_down_unready_time_secs: i64,
    pub max_node_provision_time_secs: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupsRequest {}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupsResponse {
    pub node_groups: Vec<NodeGroup>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupForNodeRequest {
    pub node: ExternalGrpcNode,
}

/// An empty `node_group.id` means the node is not managed by this provider.
#[derive(Debug, Clone, Default)]
pub struct NodeGroupForNodeResponse {
    pub node_group: NodeGroup,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupTargetSizeRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupTargetSizeResponse {
    pub target_size: i32,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupIncreaseSizeRequest {
    pub id: String,
    pub delta: i32,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupIncreaseSizeResponse {}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupDecreaseTargetSizeRequest {
    pub id: String,
    pub delta: i32,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupDecreaseTargetSizeResponse {}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupDeleteNodesRequest {
    pub id: String,
    pub nodes: Vec<ExternalGrpcNode>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupDeleteNodesResponse {}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupNodesRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupNodesResponse {
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupTemplateNodeInfoRequest {
    pub id: String,
}

/// Opaque per-group node description; the autoscaler decodes it on its side.
#[derive(Debug, Clone, Default)]
pub struct NodeGroupTemplateNodeInfoResponse {
    pub node_payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupAutoscalingOptionsRequest {
    pub id: String,
    pub defaults: AutoscalingOptions,
}

#[derive(Debug, Clone, Default)]
pub struct NodeGroupAutoscalingOptionsResponse {
    pub node_group_autoscaling_options: AutoscalingOptions,
}

#[derive(Debug, Clone, Default)]
pub struct GpuLabelRequest {}

#[derive(Debug, Clone, Default)]
pub struct GpuLabelResponse {
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct GetAvailableGpuTypesRequest {}

#[derive(Debug, Clone, Default)]
pub struct GetAvailableGpuTypesResponse {
    pub gpu_types: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshRequest {}

#[derive(Debug, Clone, Default)]
pub struct RefreshResponse {}

#[derive(Debug, Clone, Default)]
pub struct CleanupRequest {}

#[derive(Debug, Clone, Default)]
pub struct CleanupResponse {}
