//! Infrastructure adapters for the Proxmox cluster-autoscaler provider
//!
//! Implementations of the domain ports: the Proxmox HTTP client and its
//! adapter, the Kubernetes node lookup, and the SQLite-backed state store.
//! In-memory doubles for the two remote ports live in [`testing`] and are
//! shared by the test suites of the upper layers.

pub mod kube;
pub mod pve;
pub mod store;
pub mod testing;

pub use kube::KubeAdapter;
pub use pve::{ProxmoxAdapter, PveClient};
pub use store::SqliteStateStore;
