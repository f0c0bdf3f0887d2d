//! Scaling controller
//!
//! Request-side handlers for the autoscaler's calls. Handlers never touch
//! Proxmox; they read and mutate the state store (desired sizes via
//! compare-and-set, VM rows via the lifecycle driver) and reply. The
//! orchestrator serialises calls per group with an in-process lock; the CAS
//! on the store is the authoritative barrier.

use std::sync::Arc;

use tracing::{info, warn};

use proxmox_ca_domain::kube_api::{KubeApi, KubeError};
use proxmox_ca_domain::lifecycle::VmEvent;
use proxmox_ca_domain::state_store::{StateStore, VmRecord};
use proxmox_ca_domain::{DomainError, Result};
use proxmox_ca_shared::config::{GroupConfig, ProviderSettings};
use proxmox_ca_shared::Vmid;

use crate::driver;

pub struct ScalingService {
    settings: Arc<ProviderSettings>,
    store: Arc<dyn StateStore>,
    kube: Arc<dyn KubeApi>,
}

impl ScalingService {
    pub fn new(
        settings: Arc<ProviderSettings>,
        store: Arc<dyn StateStore>,
        kube: Arc<dyn KubeApi>,
    ) -> Self {
        Self {
            settings,
            store,
            kube,
        }
    }

    pub fn group(&self, group_id: &str) -> Result<&GroupConfig> {
        self.settings
            .group(group_id)
            .ok_or_else(|| DomainError::GroupNotFound {
                group_id: group_id.to_string(),
            })
    }

    /// Read the group's desired size, seeding `min_size` on first read and
    /// clamping a stored value that has fallen outside the configured bounds.
    pub async fn ensure_desired(&self, group: &GroupConfig) -> Result<u32> {
        let stored = self.store.init_desired(&group.id, group.min_size).await?;
        let clamped = stored.clamp(group.min_size, group.max_size);
        if clamped != stored {
            warn!(
                target: "proxmox_ca::scaling",
                group = %group.id,
                stored,
                clamped,
                "stored desired size outside configured bounds"
            );
            if let Err(err) = self.store.cas_desired(&group.id, stored, clamped).await {
                if !err.is_conflict() {
                    return Err(err.into());
                }
            }
        }
        Ok(clamped)
    }

    pub async fn target_size(&self, group_id: &str) -> Result<u32> {
        let group = self.group(group_id)?;
        self.ensure_desired(group).await
    }

    /// Grow the group's target by `delta`.
    pub async fn increase_size(&self, group_id: &str, delta: i64) -> Result<()> {
        let group = self.group(group_id)?;
        if delta <= 0 {
            return Err(DomainError::OutOfRange {
                message: format!("increase delta must be positive, got {delta}"),
            });
        }
        loop {
            let cur = self.ensure_desired(group).await?;
            let new = cur as i64 + delta;
            if new > group.max_size as i64 {
                return Err(DomainError::OutOfRange {
                    message: format!(
                        "scale up would exceed max size for {}: current={cur} delta={delta} max={}",
                        group.id, group.max_size
                    ),
                });
            }
            match self.store.cas_desired(&group.id, cur, new as u32).await {
                Ok(()) => {
                    info!(
                        target: "proxmox_ca::scaling",
                        group = %group.id, from = cur, to = new, "target size increased"
                    );
                    return Ok(());
                }
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Shrink the group's target by `delta` (negative) without terminating
    /// any live VM: the new target may not drop below the live count.
    pub async fn decrease_target_size(&self, group_id: &str, delta: i64) -> Result<()> {
        let group = self.group(group_id)?;
        if delta >= 0 {
            return Err(DomainError::OutOfRange {
                message: format!("decrease delta must be negative, got {delta}"),
            });
        }
        loop {
            let cur = self.ensure_desired(group).await?;
            let live = self.store.count_live(&group.id).await?;
            let new = cur as i64 + delta;
            let floor = live.max(group.min_size) as i64;
            if new < floor {
                return Err(DomainError::OutOfRange {
                    message: format!(
                        "scale down below live floor for {}: current={cur} delta={delta} floor={floor}",
                        group.id
                    ),
                });
            }
            match self.store.cas_desired(&group.id, cur, new as u32).await {
                Ok(()) => {
                    info!(
                        target: "proxmox_ca::scaling",
                        group = %group.id, from = cur, to = new, "target size decreased"
                    );
                    return Ok(());
                }
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Mark the named nodes' VMs for deletion and shrink the target by the
    /// number of VMs actually marked. Unknown nodes are ignored.
    pub async fn delete_nodes(&self, group_id: &str, node_names: &[String]) -> Result<()> {
        let group = self.group(group_id)?;
        let mut marked = 0u32;
        for name in node_names {
            match self.find_vm(group, name).await? {
                Some(record) if record.state.is_live() => {
                    match driver::apply_event(
                        self.store.as_ref(),
                        &record,
                        VmEvent::DeleteRequested,
                        None,
                    )
                    .await
                    {
                        Ok(_) => {
                            info!(
                                target: "proxmox_ca::scaling",
                                group = %group.id, vmid = %record.vmid, node = %name,
                                "node marked for deletion"
                            );
                            marked += 1;
                        }
                        Err(err) if err.is_conflict() => {
                            // Another writer moved the row first; it is
                            // already leaving the live set.
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Some(_) => {}
                None => {
                    warn!(
                        target: "proxmox_ca::scaling",
                        group = %group.id, node = %name, "ignoring unknown node in delete request"
                    );
                }
            }
        }

        if marked > 0 {
            loop {
                let cur = self.ensure_desired(group).await?;
                let new = cur.saturating_sub(marked).max(group.min_size);
                match self.store.cas_desired(&group.id, cur, new).await {
                    Ok(()) => break,
                    Err(err) if err.is_conflict() => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    /// Which group, if any, manages the named node.
    pub async fn group_for_node(&self, node_name: &str) -> Result<Option<&GroupConfig>> {
        match self.kube.resolve(node_name).await {
            Ok(assignment) => Ok(self.settings.group(&assignment.group_id)),
            Err(KubeError::NotFound { .. }) => {
                // Fall back to the store: the node may be gone from the API
                // while its row still exists.
                for group in &self.settings.node_groups {
                    if self.find_vm_by_hostname(group, node_name).await?.is_some() {
                        return Ok(Some(group));
                    }
                }
                Ok(None)
            }
            Err(err @ KubeError::Transient { .. }) => Err(err.into()),
        }
    }

    /// Live rows of a group, for the autoscaler's instance listing.
    pub async fn live_vms(&self, group_id: &str) -> Result<Vec<VmRecord>> {
        let group = self.group(group_id)?;
        let rows = self.store.list_vms(&group.id).await?;
        Ok(rows.into_iter().filter(|r| r.state.is_live()).collect())
    }

    /// Resolve a node name to this group's VM row: labels first, hostname
    /// match as fallback.
    async fn find_vm(&self, group: &GroupConfig, node_name: &str) -> Result<Option<VmRecord>> {
        match self.kube.resolve(node_name).await {
            Ok(assignment) => {
                if let Some(record) = self.row_in_group(group, assignment.vmid).await? {
                    return Ok(Some(record));
                }
            }
            Err(KubeError::NotFound { .. }) => {}
            Err(KubeError::Transient { message }) => {
                warn!(
                    target: "proxmox_ca::scaling",
                    node = %node_name, %message, "node lookup unavailable, matching by hostname"
                );
            }
        }
        self.find_vm_by_hostname(group, node_name).await
    }

    async fn row_in_group(&self, group: &GroupConfig, vmid: Vmid) -> Result<Option<VmRecord>> {
        Ok(self
            .store
            .get_vm(vmid)
            .await?
            .filter(|r| r.group_id == group.id))
    }

    async fn find_vm_by_hostname(
        &self,
        group: &GroupConfig,
        node_name: &str,
    ) -> Result<Option<VmRecord>> {
        let rows = self.store.list_vms(&group.id).await?;
        Ok(rows.into_iter().find(|r| r.hostname == node_name))
    }
}
