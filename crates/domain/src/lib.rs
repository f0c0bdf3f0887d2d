//! Domain layer for the Proxmox cluster-autoscaler provider
//!
//! Pure lifecycle rules plus the port traits the application layer drives:
//! the Proxmox VM surface, the read-only Kubernetes lookup, and the durable
//! state store. Infrastructure crates implement the ports; nothing in here
//! performs I/O itself.

pub mod kube_api;
pub mod lifecycle;
pub mod proxmox_api;
pub mod shared_kernel;
pub mod state_store;

pub use shared_kernel::{DomainError, Result};
