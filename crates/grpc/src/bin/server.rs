//! Provider daemon
//!
//! Loads configuration, opens the state store, connects the Proxmox and
//! Kubernetes adapters, and runs the orchestrator until a shutdown signal.
//! The externalgrpc transport stub hosts [`CloudProviderService`] on top of
//! the same orchestrator instance.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use proxmox_ca_application::orchestrator::Orchestrator;
use proxmox_ca_grpc::services::CloudProviderService;
use proxmox_ca_infrastructure::{KubeAdapter, ProxmoxAdapter, SqliteStateStore};
use proxmox_ca_shared::config::ConfigLoader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = env::var("PROVIDER_CONFIG")
        .unwrap_or_else(|_| "/config/provider-config.yaml".to_string());
    let env_file = Path::new(".env")
        .exists()
        .then(|| PathBuf::from(".env"));

    let settings = Arc::new(ConfigLoader::new(env_file).load(Path::new(&config_path))?);
    info!(
        groups = settings.node_groups.len(),
        state_file = %settings.state_file.display(),
        "configuration loaded"
    );

    let store = Arc::new(SqliteStateStore::new(&settings.state_file).await?);
    let proxmox = Arc::new(ProxmoxAdapter::new(settings.proxmox.clone())?);
    let kube = Arc::new(KubeAdapter::try_default().await?);

    let orchestrator = Arc::new(Orchestrator::new(
        settings.clone(),
        store,
        proxmox,
        kube,
    ));
    orchestrator.start().await?;

    let service = CloudProviderService::new(orchestrator.clone());
    for group in orchestrator.node_groups() {
        info!(
            group = %group.id,
            min = group.min_size,
            max = group.max_size,
            "serving node group"
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = service.cleanup(proxmox_ca_grpc::proto::CleanupRequest {}).await;
    Ok(())
}
