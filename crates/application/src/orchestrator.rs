//! Orchestrator
//!
//! Owns the long-running reconcile task, the per-group locks, and the
//! request-side entry points the remote surface calls into. Desired-size
//! mutations for a group are totally ordered by its lock; the store's
//! compare-and-set remains the authoritative barrier underneath.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use proxmox_ca_domain::kube_api::KubeApi;
use proxmox_ca_domain::proxmox_api::ProxmoxApi;
use proxmox_ca_domain::state_store::{StateStore, VmRecord};
use proxmox_ca_domain::{DomainError, Result};
use proxmox_ca_shared::config::{GroupConfig, ProviderSettings};

use crate::reconcile::Reconciler;
use crate::scaling::ScalingService;

pub struct Orchestrator {
    settings: Arc<ProviderSettings>,
    store: Arc<dyn StateStore>,
    scaling: Arc<ScalingService>,
    reconciler: Arc<Reconciler>,
    group_locks: Arc<HashMap<String, Mutex<()>>>,
    shutdown: watch::Sender<bool>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<ProviderSettings>,
        store: Arc<dyn StateStore>,
        proxmox: Arc<dyn ProxmoxApi>,
        kube: Arc<dyn KubeApi>,
    ) -> Self {
        let scaling = Arc::new(ScalingService::new(
            settings.clone(),
            store.clone(),
            kube.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            settings.clone(),
            store.clone(),
            proxmox,
            kube,
            scaling.clone(),
        ));
        let group_locks = Arc::new(
            settings
                .node_groups
                .iter()
                .map(|g| (g.id.clone(), Mutex::new(())))
                .collect::<HashMap<_, _>>(),
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            store,
            scaling,
            reconciler,
            group_locks,
            shutdown,
            reconcile_task: Mutex::new(None),
        }
    }

    /// Initialise the store and spawn the reconcile loop. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.reconcile_task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        self.store.init().await?;

        let settings = self.settings.clone();
        let reconciler = self.reconciler.clone();
        let locks = self.group_locks.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = Duration::from_secs(self.settings.reconcile_interval_secs);

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // A tick that overruns the interval delays the next one instead
            // of letting passes overlap.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                target: "proxmox_ca::reconcile",
                interval_secs = interval.as_secs(), "reconcile loop started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        info!(target: "proxmox_ca::reconcile", "reconcile loop stopping");
                        return;
                    }
                }
                for group in &settings.node_groups {
                    let Some(lock) = locks.get(&group.id) else { continue };
                    let _guard = lock.lock().await;
                    reconciler.reconcile_group(group).await;
                }
            }
        }));
        Ok(())
    }

    /// Stop the reconcile loop at the next tick boundary.
    pub async fn stop(&self) {
        let handle = self.reconcile_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.shutdown.send(true);
            if let Err(err) = handle.await {
                warn!(target: "proxmox_ca::reconcile", %err, "reconcile task ended abnormally");
            }
        }
    }

    pub fn node_groups(&self) -> &[GroupConfig] {
        &self.settings.node_groups
    }

    pub fn group(&self, group_id: &str) -> Result<&GroupConfig> {
        self.scaling.group(group_id)
    }

    pub async fn node_group_for_node(&self, node_name: &str) -> Result<Option<&GroupConfig>> {
        self.scaling.group_for_node(node_name).await
    }

    pub async fn target_size(&self, group_id: &str) -> Result<u32> {
        let _guard = self.lock_group(group_id)?.lock().await;
        self.scaling.target_size(group_id).await
    }

    pub async fn increase_size(&self, group_id: &str, delta: i64) -> Result<()> {
        let _guard = self.lock_group(group_id)?.lock().await;
        self.scaling.increase_size(group_id, delta).await
    }

    pub async fn decrease_target_size(&self, group_id: &str, delta: i64) -> Result<()> {
        let _guard = self.lock_group(group_id)?.lock().await;
        self.scaling.decrease_target_size(group_id, delta).await
    }

    pub async fn delete_nodes(&self, group_id: &str, node_names: &[String]) -> Result<()> {
        let _guard = self.lock_group(group_id)?.lock().await;
        self.scaling.delete_nodes(group_id, node_names).await
    }

    pub async fn node_group_nodes(&self, group_id: &str) -> Result<Vec<VmRecord>> {
        let _guard = self.lock_group(group_id)?.lock().await;
        self.scaling.live_vms(group_id).await
    }

    fn lock_group(&self, group_id: &str) -> Result<&Mutex<()>> {
        self.group_locks
            .get(group_id)
            .ok_or_else(|| DomainError::GroupNotFound {
                group_id: group_id.to_string(),
            })
    }
}
