//! Domain error kernel
//!
//! The error taxonomy the request surface translates into the remote
//! protocol's status codes. Adapter and store failures are wrapped here at
//! the application boundary; the reconciler itself never propagates errors
//! outward.

use crate::kube_api::KubeError;
use crate::proxmox_api::ProxmoxError;
use crate::state_store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum DomainError {
    #[error("unknown node group: {group_id}")]
    GroupNotFound { group_id: String },

    #[error("node not managed by this provider: {name}")]
    NodeNotFound { name: String },

    /// Requested size outside `[min_size, max_size]`, a non-positive grow
    /// delta, or a shrink below the live floor
    #[error("{message}")]
    OutOfRange { message: String },

    /// Transient backend failure; the caller may retry
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<KubeError> for DomainError {
    fn from(err: KubeError) -> Self {
        match err {
            KubeError::NotFound { name } => DomainError::NodeNotFound { name },
            KubeError::Transient { message } => DomainError::Unavailable { message },
        }
    }
}

impl From<ProxmoxError> for DomainError {
    fn from(err: ProxmoxError) -> Self {
        match err {
            ProxmoxError::Transient { message } => DomainError::Unavailable { message },
            ProxmoxError::Permanent { message } => DomainError::Internal { message },
        }
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
