//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading or validation.
///
/// All of these are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required configuration key has no value from either the document or
    /// the environment
    #[error("Missing required configuration: {var}")]
    MissingRequired { var: String },

    /// A configuration key has a value that cannot be interpreted
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    /// Failed to read the configuration document
    #[error("Failed to read configuration file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid YAML
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Failed to load the optional .env file
    #[error("Failed to load .env file from {path}: {source}")]
    EnvFileLoad {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },

    /// Cross-field validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
