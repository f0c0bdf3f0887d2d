//! Proxmox VE integration
//!
//! [`PveClient`] speaks the raw HTTP API (token auth, JSON envelope, UPID
//! task polling); [`ProxmoxAdapter`] lifts it to the domain port, adding the
//! idempotency and error-classification rules the reconciler relies on.

mod adapter;
mod client;

pub use adapter::ProxmoxAdapter;
pub use client::{PveClient, PveError};
