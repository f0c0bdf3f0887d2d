//! Provider configuration
//!
//! Configuration is loaded once at startup from a YAML document, overlaid
//! with environment variables, validated, and then passed immutably into
//! every component at construction. There is no process-wide singleton.

mod dto;
mod error;
mod loader;
mod validator;

pub use dto::{GroupConfig, InstanceShape, K3sConfig, ProviderSettings, ProxmoxConfig};
pub use error::{ConfigError, Result};
pub use loader::ConfigLoader;
pub use validator::validate_settings;
