//! Shared types for the Proxmox cluster-autoscaler provider
//!
//! This crate holds everything the domain/application layers and the
//! infrastructure adapters need to agree on: the configuration surface, the
//! VM lifecycle state enum, id newtypes and the Proxmox tag scheme.

pub mod config;
pub mod ids;
pub mod states;
pub mod tags;

pub use ids::Vmid;
pub use states::VmState;
