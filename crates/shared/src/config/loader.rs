//! Configuration loader
//!
//! Loads the YAML configuration document, applies environment variable
//! overrides, and validates the result. An optional `.env` file can be
//! loaded first for local development, matching the precedence used
//! elsewhere in the deployment: `.env` file, then process environment, then
//! the document's own values.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::dto::ProviderSettings;
use super::error::{ConfigError, Result};
use super::validator::validate_settings;

/// Environment variable names recognised as overrides, one per configurable
/// scalar. Documented here because operators set these in the deployment
/// manifest rather than editing the YAML document.
pub const ENV_PM_API_URL: &str = "PM_API_URL";
pub const ENV_PM_NODE: &str = "PM_NODE";
pub const ENV_PM_TOKEN_ID: &str = "PM_TOKEN_ID";
pub const ENV_PM_TOKEN_SECRET: &str = "PM_TOKEN_SECRET";
pub const ENV_PM_VERIFY_TLS: &str = "PM_VERIFY_TLS";
pub const ENV_IMPORT_STORAGE: &str = "IMPORT_STORAGE";
pub const ENV_ISO_STORAGE: &str = "ISO_STORAGE";
pub const ENV_VM_STORAGE: &str = "VM_STORAGE";
pub const ENV_BRIDGE: &str = "BRIDGE";
pub const ENV_CLOUD_IMAGE_URL: &str = "CLOUD_IMAGE_URL";
pub const ENV_K3S_VERSION: &str = "K3S_VERSION";
pub const ENV_K3S_SERVER_URL: &str = "K3S_SERVER_URL";
pub const ENV_K3S_CLUSTER_TOKEN: &str = "K3S_CLUSTER_TOKEN";
pub const ENV_SSH_PUBLIC_KEY: &str = "SSH_PUBLIC_KEY";
pub const ENV_STATE_FILE: &str = "PROVIDER_STATE_DB";
pub const ENV_PENDING_VM_TIMEOUT: &str = "PENDING_VM_TIMEOUT_SECONDS";
pub const ENV_RECONCILE_INTERVAL: &str = "RECONCILE_INTERVAL_SECONDS";

/// Configuration loader
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// Optional path to a .env file loaded before reading the environment
    env_file_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(env_file_path: Option<PathBuf>) -> Self {
        Self { env_file_path }
    }

    /// Load, overlay and validate provider settings.
    pub fn load(&self, config_path: &Path) -> Result<ProviderSettings> {
        if let Some(path) = &self.env_file_path {
            self.load_env_file(path)?;
        }

        let raw = std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
            path: config_path.to_path_buf(),
            source,
        })?;
        let mut settings: ProviderSettings = serde_yaml::from_str(&raw)?;

        apply_env_overrides(&mut settings)?;

        for group in &mut settings.node_groups {
            if group.name_prefix.is_empty() {
                group.name_prefix = format!("ca-{}", group.id);
            }
        }

        validate_settings(&settings)?;
        Ok(settings)
    }

    fn load_env_file(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(ConfigError::EnvFileLoad {
                path: path.to_path_buf(),
                source: dotenv::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File not found: {}", path.display()),
                )),
            });
        }
        dotenv::from_path(path).map_err(|source| ConfigError::EnvFileLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

fn apply_env_overrides(settings: &mut ProviderSettings) -> Result<()> {
    override_string(ENV_PM_API_URL, &mut settings.proxmox.api_url);
    override_string(ENV_PM_NODE, &mut settings.proxmox.node);
    override_string(ENV_PM_TOKEN_ID, &mut settings.proxmox.token_id);
    override_string(ENV_PM_TOKEN_SECRET, &mut settings.proxmox.token_secret);
    override_parsed(ENV_PM_VERIFY_TLS, &mut settings.proxmox.verify_tls)?;
    override_string(ENV_IMPORT_STORAGE, &mut settings.proxmox.import_storage);
    override_string(ENV_ISO_STORAGE, &mut settings.proxmox.iso_storage);
    override_string(ENV_VM_STORAGE, &mut settings.proxmox.vm_storage);
    override_string(ENV_BRIDGE, &mut settings.proxmox.bridge);
    override_string(ENV_CLOUD_IMAGE_URL, &mut settings.proxmox.cloud_image_url);
    override_string(ENV_K3S_VERSION, &mut settings.k3s.version);
    override_string(ENV_K3S_SERVER_URL, &mut settings.k3s.server_url);
    override_string(ENV_K3S_CLUSTER_TOKEN, &mut settings.k3s.cluster_token);
    override_string(ENV_SSH_PUBLIC_KEY, &mut settings.k3s.ssh_public_key);
    if let Some(value) = env_value(ENV_STATE_FILE) {
        settings.state_file = PathBuf::from(value);
    }
    override_parsed(ENV_PENDING_VM_TIMEOUT, &mut settings.pending_vm_timeout_secs)?;
    override_parsed(ENV_RECONCILE_INTERVAL, &mut settings.reconcile_interval_secs)?;
    Ok(())
}

/// A set but empty environment variable does not override the document.
fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn override_string(name: &str, target: &mut String) {
    if let Some(value) = env_value(name) {
        *target = value;
    }
}

fn override_parsed<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
{
    if let Some(value) = env_value(name) {
        *target = parse_env(name, &value)?;
    }
    Ok(())
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
{
    value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        var: name.to_string(),
        value: value.to_string(),
    })
}
