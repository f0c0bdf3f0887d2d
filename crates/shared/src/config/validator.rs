//! Configuration validation

use std::collections::HashSet;

use super::dto::ProviderSettings;
use super::error::{ConfigError, Result};

/// Required scalars are reported under the environment variable name an
/// operator would use to supply them.
const REQUIRED: [(&str, fn(&ProviderSettings) -> &str); 8] = [
    ("PM_API_URL", |s| &s.proxmox.api_url),
    ("PM_NODE", |s| &s.proxmox.node),
    ("PM_TOKEN_ID", |s| &s.proxmox.token_id),
    ("PM_TOKEN_SECRET", |s| &s.proxmox.token_secret),
    ("CLOUD_IMAGE_URL", |s| &s.proxmox.cloud_image_url),
    ("K3S_SERVER_URL", |s| &s.k3s.server_url),
    ("K3S_CLUSTER_TOKEN", |s| &s.k3s.cluster_token),
    ("SSH_PUBLIC_KEY", |s| &s.k3s.ssh_public_key),
];

/// Validate loaded settings.
///
/// Checks the presence of every required scalar, then the cross-field rules
/// on node groups and timings.
pub fn validate_settings(settings: &ProviderSettings) -> Result<()> {
    for (var, getter) in REQUIRED {
        if getter(settings).trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                var: var.to_string(),
            });
        }
    }

    if settings.node_groups.is_empty() {
        return Err(ConfigError::Validation(
            "at least one node group must be configured".to_string(),
        ));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for group in &settings.node_groups {
        if group.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "node group id must not be empty".to_string(),
            ));
        }
        if !seen.insert(group.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate node group id: {}",
                group.id
            )));
        }
        if group.min_size > group.max_size {
            return Err(ConfigError::Validation(format!(
                "group {}: min_size {} exceeds max_size {}",
                group.id, group.min_size, group.max_size
            )));
        }
        if group.shape.cores == 0 || group.shape.memory_mb == 0 || group.shape.disk_gb == 0 {
            return Err(ConfigError::Validation(format!(
                "group {}: instance shape must be non-zero",
                group.id
            )));
        }
    }

    if settings.reconcile_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "reconcile interval must be at least one second".to_string(),
        ));
    }
    if settings.pending_vm_timeout_secs < settings.reconcile_interval_secs {
        return Err(ConfigError::Validation(
            "pending VM timeout must not be shorter than the reconcile interval".to_string(),
        ));
    }

    Ok(())
}
