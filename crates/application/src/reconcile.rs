//! Reconciler
//!
//! One periodic pass per group: adopt or condemn orphans, route rows whose
//! VM vanished into the teardown pipeline, drive every cleanup state to
//! completion, promote pending VMs whose node has joined, fail pending VMs
//! that outstayed the timeout, and finally close the gap between the live
//! count and the desired size. The reconciler never propagates errors —
//! transient failures are logged and retried on the next tick, permanent
//! Proxmox failures move the affected row to `failed`.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use proxmox_ca_domain::kube_api::{KubeApi, KubeError};
use proxmox_ca_domain::lifecycle::{self, CleanupEffect, VmEvent};
use proxmox_ca_domain::proxmox_api::{CreateVmSpec, ProxmoxApi, ProxmoxError};
use proxmox_ca_domain::state_store::{StateStore, StoreError, VmRecord};
use proxmox_ca_shared::config::{GroupConfig, ProviderSettings};
use proxmox_ca_shared::{tags, VmState, Vmid};

use crate::driver;
use crate::group_context::GroupContext;
use crate::scaling::ScalingService;
use crate::seed::{self, seed_iso_name};

pub struct Reconciler {
    settings: Arc<ProviderSettings>,
    context: GroupContext,
    store: Arc<dyn StateStore>,
    proxmox: Arc<dyn ProxmoxApi>,
    kube: Arc<dyn KubeApi>,
    scaling: Arc<ScalingService>,
}

impl Reconciler {
    pub fn new(
        settings: Arc<ProviderSettings>,
        store: Arc<dyn StateStore>,
        proxmox: Arc<dyn ProxmoxApi>,
        kube: Arc<dyn KubeApi>,
        scaling: Arc<ScalingService>,
    ) -> Self {
        let context = GroupContext::new(store.clone(), proxmox.clone());
        Self {
            settings,
            context,
            store,
            proxmox,
            kube,
            scaling,
        }
    }

    /// One reconcile pass for one group. Caller holds the group lock.
    pub async fn reconcile_group(&self, group: &GroupConfig) {
        let desired = match self.scaling.ensure_desired(group).await {
            Ok(desired) => desired,
            Err(err) => {
                warn!(
                    target: "proxmox_ca::reconcile",
                    group = %group.id, %err, "skipping group, cannot read desired size"
                );
                return;
            }
        };

        let snapshot = match self.context.snapshot(group, desired).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    target: "proxmox_ca::reconcile",
                    group = %group.id, %err, "skipping group, cannot build inventory"
                );
                return;
            }
        };

        self.handle_orphans(group, &snapshot.vms).await;
        self.handle_missing(group, &snapshot).await;
        self.drive_cleanup(group).await;
        self.handle_pending_and_active(group, &snapshot.vms).await;
        self.converge_size(group, desired).await;
    }

    /// Untracked tagged VMs: adopt the healthy ones, condemn the rest.
    async fn handle_orphans(
        &self,
        group: &GroupConfig,
        observations: &[crate::group_context::VmObservation],
    ) {
        let now = Utc::now().timestamp();
        for obs in observations {
            let (None, Some(summary)) = (&obs.record, &obs.proxmox) else {
                continue;
            };
            let state = if summary.running {
                VmState::Active
            } else {
                VmState::DeletingVm
            };
            let hostname = if summary.name.is_empty() {
                group.hostname(summary.vmid)
            } else {
                summary.name.clone()
            };
            let record = VmRecord {
                vmid: summary.vmid,
                group_id: group.id.clone(),
                hostname,
                state,
                created_at: now,
                last_transition_at: now,
                last_error: None,
            };
            match self.store.insert_vm(&record).await {
                Ok(()) => info!(
                    target: "proxmox_ca::reconcile",
                    group = %group.id, vmid = %summary.vmid, state = %state,
                    "orphan VM registered"
                ),
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(err) => warn!(
                    target: "proxmox_ca::reconcile",
                    group = %group.id, vmid = %summary.vmid, %err, "failed registering orphan"
                ),
            }
        }
    }

    /// Live rows whose VM is gone from Proxmox enter the teardown pipeline;
    /// the destroy steps are idempotent, so the pipeline no-ops through the
    /// already-absent resources.
    async fn handle_missing(
        &self,
        group: &GroupConfig,
        snapshot: &crate::group_context::GroupSnapshot,
    ) {
        for record in snapshot.missing_live() {
            debug!(
                target: "proxmox_ca::reconcile",
                group = %group.id, vmid = %record.vmid, "VM vanished from Proxmox, cleaning up"
            );
            self.apply(record, VmEvent::DeleteRequested, Some("vm missing from proxmox"))
                .await;
        }
    }

    /// Run every row that needs cleanup as far as it will go this tick: a
    /// transient side-effect failure parks the row until the next pass.
    async fn drive_cleanup(&self, group: &GroupConfig) {
        let rows = match self.store.list_vms(&group.id).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(target: "proxmox_ca::reconcile", group = %group.id, %err, "cannot list rows");
                return;
            }
        };
        for record in rows.into_iter().filter(|r| r.state.needs_cleanup()) {
            self.drive_cleanup_vm(group, record).await;
        }
    }

    async fn drive_cleanup_vm(&self, group: &GroupConfig, mut record: VmRecord) {
        loop {
            if record.state == VmState::Failed {
                match self.apply(&record, VmEvent::DeleteRequested, None).await {
                    Some(state) => record.state = state,
                    None => return,
                }
                continue;
            }
            let Some(effect) = lifecycle::cleanup_effect(record.state) else {
                return;
            };
            match self.run_cleanup_effect(&record, effect).await {
                Ok(()) => match self.apply(&record, effect.done_event(), None).await {
                    Some(state) if state != record.state => record.state = state,
                    Some(_) => return,
                    None => {
                        info!(
                            target: "proxmox_ca::reconcile",
                            group = %group.id, vmid = %record.vmid, "VM fully removed"
                        );
                        return;
                    }
                },
                Err(message) => {
                    debug!(
                        target: "proxmox_ca::reconcile",
                        group = %group.id, vmid = %record.vmid, state = %record.state, %message,
                        "cleanup step deferred"
                    );
                    if let Err(err) = self
                        .store
                        .set_last_error(record.vmid, Some(&message))
                        .await
                    {
                        warn!(
                            target: "proxmox_ca::reconcile",
                            vmid = %record.vmid, %err, "failed recording cleanup error"
                        );
                    }
                    return;
                }
            }
        }
    }

    async fn run_cleanup_effect(
        &self,
        record: &VmRecord,
        effect: CleanupEffect,
    ) -> Result<(), String> {
        match effect {
            CleanupEffect::DestroyVm => self
                .proxmox
                .destroy_vm(record.vmid)
                .await
                .map_err(|e| e.to_string()),
            CleanupEffect::DestroyIso => self
                .proxmox
                .destroy_iso(&seed_iso_name(record.vmid))
                .await
                .map_err(|e| e.to_string()),
            CleanupEffect::DeleteNode => match self.kube.delete_node(&record.hostname).await {
                Ok(()) | Err(KubeError::NotFound { .. }) => Ok(()),
                Err(err) => Err(err.to_string()),
            },
        }
    }

    /// Pending rows: re-enter the create pipeline while the VM is not yet
    /// running, promote once the node has registered, and fail on timeout.
    /// Active rows whose VM stopped underneath them are failed as well.
    async fn handle_pending_and_active(
        &self,
        group: &GroupConfig,
        observations: &[crate::group_context::VmObservation],
    ) {
        let now = Utc::now().timestamp();
        let timeout = self.settings.pending_vm_timeout_secs as i64;

        let mut provisioning = Vec::new();
        for obs in observations {
            let Some(record) = &obs.record else { continue };
            match record.state {
                VmState::Pending => {
                    let running = obs.proxmox.as_ref().map(|s| s.running).unwrap_or(false);
                    if running && self.node_registered(group, record).await {
                        self.apply(record, VmEvent::NodeReady, None).await;
                        info!(
                            target: "proxmox_ca::reconcile",
                            group = %group.id, vmid = %record.vmid, node = %record.hostname,
                            "VM promoted to active"
                        );
                        continue;
                    }
                    if now - record.created_at >= timeout {
                        warn!(
                            target: "proxmox_ca::reconcile",
                            group = %group.id, vmid = %record.vmid,
                            age_secs = now - record.created_at,
                            "pending VM exceeded timeout"
                        );
                        self.apply(record, VmEvent::PendingTimedOut, Some("pending timeout exceeded"))
                            .await;
                        continue;
                    }
                    if !running {
                        provisioning.push(self.provision(group, record.vmid));
                    }
                }
                VmState::Active => {
                    let running = obs.proxmox.as_ref().map(|s| s.running).unwrap_or(false);
                    if obs.proxmox.is_some() && !running {
                        warn!(
                            target: "proxmox_ca::reconcile",
                            group = %group.id, vmid = %record.vmid, "active VM no longer running"
                        );
                        self.apply(record, VmEvent::NodeLost, Some("vm not running")).await;
                    }
                }
                _ => {}
            }
        }
        join_all(provisioning).await;
    }

    async fn node_registered(&self, group: &GroupConfig, record: &VmRecord) -> bool {
        match self.kube.resolve(&record.hostname).await {
            Ok(assignment) => assignment.group_id == group.id && assignment.vmid == record.vmid,
            Err(KubeError::NotFound { .. }) => false,
            Err(KubeError::Transient { message }) => {
                debug!(
                    target: "proxmox_ca::reconcile",
                    node = %record.hostname, %message, "node lookup unavailable"
                );
                false
            }
        }
    }

    /// Close the gap between the live count and the target.
    async fn converge_size(&self, group: &GroupConfig, desired: u32) {
        let rows = match self.store.list_vms(&group.id).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(target: "proxmox_ca::reconcile", group = %group.id, %err, "cannot list rows");
                return;
            }
        };
        let live: Vec<&VmRecord> = rows.iter().filter(|r| r.state.is_live()).collect();

        if (live.len() as u32) < desired {
            self.scale_up(group, desired - live.len() as u32).await;
        } else if (live.len() as u32) > desired {
            self.scale_down(group, &live, live.len() as u32 - desired)
                .await;
        }
    }

    async fn scale_up(&self, group: &GroupConfig, count: u32) {
        let now = Utc::now().timestamp();
        let mut new_vmids = Vec::new();
        for _ in 0..count {
            let vmid = match self.proxmox.next_vmid().await {
                Ok(vmid) => vmid,
                Err(err) => {
                    warn!(
                        target: "proxmox_ca::reconcile",
                        group = %group.id, %err, "cannot allocate vmid"
                    );
                    break;
                }
            };
            let record = VmRecord {
                vmid,
                group_id: group.id.clone(),
                hostname: group.hostname(vmid),
                state: VmState::Pending,
                created_at: now,
                last_transition_at: now,
                last_error: None,
            };
            match self.store.insert_vm(&record).await {
                Ok(()) => {
                    info!(
                        target: "proxmox_ca::reconcile",
                        group = %group.id, vmid = %vmid, "creating VM"
                    );
                    new_vmids.push(vmid);
                }
                Err(err) => {
                    warn!(
                        target: "proxmox_ca::reconcile",
                        group = %group.id, vmid = %vmid, %err, "cannot insert VM row"
                    );
                }
            }
        }
        join_all(new_vmids.into_iter().map(|vmid| self.provision(group, vmid))).await;
    }

    async fn scale_down(&self, group: &GroupConfig, live: &[&VmRecord], excess: u32) {
        // Victim order: pending before active, then oldest first.
        let mut victims: Vec<&VmRecord> = live.to_vec();
        victims.sort_by_key(|r| {
            (
                if r.state == VmState::Pending { 0 } else { 1 },
                r.created_at,
                r.vmid,
            )
        });
        for record in victims.into_iter().take(excess as usize) {
            info!(
                target: "proxmox_ca::reconcile",
                group = %group.id, vmid = %record.vmid, state = %record.state,
                "scaling down VM"
            );
            self.apply(record, VmEvent::DeleteRequested, None).await;
        }
    }

    /// The create pipeline for one vmid: shell, boot disk, seed ISO, start.
    /// Every step is idempotent; re-entering on a later tick resumes where
    /// the previous attempt stopped.
    async fn provision(&self, group: &GroupConfig, vmid: Vmid) {
        match self.run_pipeline(group, vmid).await {
            Ok(()) => {}
            Err(err @ ProxmoxError::Transient { .. }) => {
                debug!(
                    target: "proxmox_ca::reconcile",
                    group = %group.id, vmid = %vmid, %err, "create pipeline deferred"
                );
                if let Err(store_err) = self
                    .store
                    .set_last_error(vmid, Some(&err.to_string()))
                    .await
                {
                    warn!(
                        target: "proxmox_ca::reconcile",
                        vmid = %vmid, %store_err, "failed recording pipeline error"
                    );
                }
            }
            Err(err @ ProxmoxError::Permanent { .. }) => {
                warn!(
                    target: "proxmox_ca::reconcile",
                    group = %group.id, vmid = %vmid, %err, "create pipeline failed permanently"
                );
                match self.store.get_vm(vmid).await {
                    Ok(Some(record)) if record.state == VmState::Pending => {
                        self.apply(&record, VmEvent::ProvisionFailed, Some(&err.to_string()))
                            .await;
                    }
                    Ok(_) => {}
                    Err(store_err) => warn!(
                        target: "proxmox_ca::reconcile",
                        vmid = %vmid, %store_err, "failed loading row after pipeline failure"
                    ),
                }
            }
        }
    }

    async fn run_pipeline(&self, group: &GroupConfig, vmid: Vmid) -> Result<(), ProxmoxError> {
        let pve = &self.settings.proxmox;
        let spec = CreateVmSpec {
            vmid,
            hostname: group.hostname(vmid),
            shape: group.shape,
            storage: pve.vm_storage.clone(),
            bridge: pve.bridge.clone(),
            tags: vec![tags::group_tag(&group.id)],
        };
        self.proxmox.create_vm(&spec).await?;
        self.proxmox
            .import_disk(vmid, &pve.cloud_image_url, &pve.import_storage, group.shape.disk_gb)
            .await?;

        let iso_name = seed_iso_name(vmid);
        let iso = seed::render_seed(group, vmid, &self.settings.k3s).into_iso();
        self.proxmox.upload_iso(&iso_name, iso).await?;
        self.proxmox.attach_iso(vmid, &iso_name).await?;

        self.proxmox.start_vm(vmid).await?;
        Ok(())
    }

    /// Apply one lifecycle event through the single write path; conflicts
    /// mean another writer won and are left for the next tick.
    async fn apply(
        &self,
        record: &VmRecord,
        event: VmEvent,
        last_error: Option<&str>,
    ) -> Option<VmState> {
        match driver::apply_event(self.store.as_ref(), record, event, last_error).await {
            Ok(next) => next,
            Err(err) if err.is_conflict() => {
                debug!(
                    target: "proxmox_ca::reconcile",
                    vmid = %record.vmid, event = %event, %err, "lost transition race"
                );
                Some(record.state)
            }
            Err(err) => {
                warn!(
                    target: "proxmox_ca::reconcile",
                    vmid = %record.vmid, event = %event, %err, "transition failed"
                );
                Some(record.state)
            }
        }
    }
}
