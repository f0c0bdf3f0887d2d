//! Proxmox port
//!
//! Async facade over the fixed set of Proxmox operations the provider needs.
//! Every operation is idempotent and may block on remote I/O; the reconciler
//! retries transient failures on the next tick and routes permanent failures
//! into the `failed` state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use proxmox_ca_shared::config::InstanceShape;
use proxmox_ca_shared::Vmid;

/// One row of the tag-scoped VM listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub vmid: Vmid,
    pub name: String,
    pub running: bool,
    pub tags: Vec<String>,
}

/// Point-in-time status of a single VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStatus {
    pub present: bool,
    pub running: bool,
    pub tags: Vec<String>,
}

/// Parameters for creating a VM shell.
#[derive(Debug, Clone)]
pub struct CreateVmSpec {
    pub vmid: Vmid,
    pub hostname: String,
    pub shape: InstanceShape,
    pub storage: String,
    pub bridge: String,
    pub tags: Vec<String>,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum ProxmoxError {
    /// Network failure, timeout, 5xx or lock contention; retry next tick
    #[error("transient proxmox error: {message}")]
    Transient { message: String },

    /// Invalid request or missing resource where presence is required
    #[error("permanent proxmox error: {message}")]
    Permanent { message: String },
}

impl ProxmoxError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProxmoxError::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProxmoxError::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProxmoxError::Transient { .. })
    }
}

/// The Proxmox operations the provider drives.
#[async_trait]
pub trait ProxmoxApi: Send + Sync {
    /// List VMs carrying the given tag.
    async fn list_vms_with_tag(&self, tag: &str) -> Result<Vec<VmSummary>, ProxmoxError>;

    /// Ask the cluster for the next free vmid.
    async fn next_vmid(&self) -> Result<Vmid, ProxmoxError>;

    /// Create a VM shell. Succeeds if a VM with this vmid already exists.
    async fn create_vm(&self, spec: &CreateVmSpec) -> Result<(), ProxmoxError>;

    /// Stream the cloud image into a Proxmox volume, attach it as the boot
    /// disk, and grow it to `disk_gb`. Skips work already done on a previous
    /// attempt.
    async fn import_disk(
        &self,
        vmid: Vmid,
        image_url: &str,
        target_storage: &str,
        disk_gb: u32,
    ) -> Result<(), ProxmoxError>;

    /// Upload an ISO volume, overwriting any previous content of that name.
    async fn upload_iso(&self, iso_name: &str, content: Vec<u8>) -> Result<(), ProxmoxError>;

    /// Attach an ISO volume as the VM's cdrom. Idempotent.
    async fn attach_iso(&self, vmid: Vmid, iso_name: &str) -> Result<(), ProxmoxError>;

    /// Start the VM. Succeeds if it is already running.
    async fn start_vm(&self, vmid: Vmid) -> Result<(), ProxmoxError>;

    /// Graceful shutdown, hard stop after a fixed deadline. Succeeds if the
    /// VM is already stopped.
    async fn stop_vm(&self, vmid: Vmid) -> Result<(), ProxmoxError>;

    /// Stop and destroy the VM. Succeeds if the VM is already absent.
    async fn destroy_vm(&self, vmid: Vmid) -> Result<(), ProxmoxError>;

    /// Destroy an ISO volume. Succeeds if the volume is already absent.
    async fn destroy_iso(&self, iso_name: &str) -> Result<(), ProxmoxError>;

    /// Status of a single VM; `present: false` for unknown vmids.
    async fn vm_status(&self, vmid: Vmid) -> Result<VmStatus, ProxmoxError>;
}
