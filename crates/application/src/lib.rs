//! Application layer for the Proxmox cluster-autoscaler provider
//!
//! Wires the domain ports into the two active parts of the system: the
//! scaling service that answers the autoscaler's calls, and the reconciler
//! that drives Proxmox toward the desired state. The orchestrator owns both
//! plus the per-group locks.

pub mod group_context;
pub mod orchestrator;
pub mod reconcile;
pub mod scaling;
pub mod seed;

mod driver;
