//! Group context
//!
//! Joins the store's view of a group with the Proxmox tag view into one
//! snapshot per reconcile tick. The context is stateless; it is rebuilt
//! from scratch every time it is asked.

use std::collections::BTreeMap;
use std::sync::Arc;

use proxmox_ca_domain::proxmox_api::{ProxmoxApi, VmSummary};
use proxmox_ca_domain::state_store::{StateStore, VmRecord};
use proxmox_ca_domain::DomainError;
use proxmox_ca_shared::config::GroupConfig;
use proxmox_ca_shared::{tags, Vmid};

/// How one VM appears after joining both views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationClass {
    /// Row exists and the VM exists
    Nominal,
    /// Row exists but Proxmox no longer has the VM
    InfraMissing,
    /// Proxmox has a tagged VM with no row
    Orphan,
}

/// One vmid's joined observation.
#[derive(Debug, Clone)]
pub struct VmObservation {
    pub vmid: Vmid,
    pub record: Option<VmRecord>,
    pub proxmox: Option<VmSummary>,
}

impl VmObservation {
    pub fn class(&self) -> ObservationClass {
        match (&self.record, &self.proxmox) {
            (Some(_), Some(_)) => ObservationClass::Nominal,
            (Some(_), None) => ObservationClass::InfraMissing,
            (None, _) => ObservationClass::Orphan,
        }
    }
}

/// Per-group inventory for one tick.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub group_id: String,
    pub desired: u32,
    pub vms: Vec<VmObservation>,
}

impl GroupSnapshot {
    pub fn orphans(&self) -> impl Iterator<Item = &VmObservation> {
        self.vms
            .iter()
            .filter(|obs| obs.class() == ObservationClass::Orphan)
    }

    /// Rows whose backing VM is gone but that still count as live.
    pub fn missing_live(&self) -> impl Iterator<Item = &VmRecord> {
        self.vms
            .iter()
            .filter(|obs| obs.class() == ObservationClass::InfraMissing)
            .filter_map(|obs| obs.record.as_ref())
            .filter(|r| r.state.is_live())
    }
}

/// Snapshot builder over the two read paths.
pub struct GroupContext {
    store: Arc<dyn StateStore>,
    proxmox: Arc<dyn ProxmoxApi>,
}

impl GroupContext {
    pub fn new(store: Arc<dyn StateStore>, proxmox: Arc<dyn ProxmoxApi>) -> Self {
        Self { store, proxmox }
    }

    /// Build the snapshot for `group`: list the store rows, list the VMs
    /// carrying the group tag, and outer-join on vmid.
    pub async fn snapshot(
        &self,
        group: &GroupConfig,
        desired: u32,
    ) -> Result<GroupSnapshot, DomainError> {
        let records = self.store.list_vms(&group.id).await?;
        let summaries = self
            .proxmox
            .list_vms_with_tag(&tags::group_tag(&group.id))
            .await?;

        let mut joined: BTreeMap<Vmid, VmObservation> = BTreeMap::new();
        for record in records {
            joined.insert(
                record.vmid,
                VmObservation {
                    vmid: record.vmid,
                    record: Some(record),
                    proxmox: None,
                },
            );
        }
        for summary in summaries {
            let vmid = summary.vmid;
            joined
                .entry(vmid)
                .or_insert_with(|| VmObservation {
                    vmid,
                    record: None,
                    proxmox: None,
                })
                .proxmox = Some(summary);
        }

        Ok(GroupSnapshot {
            group_id: group.id.clone(),
            desired,
            vms: joined.into_values().collect(),
        })
    }
}
