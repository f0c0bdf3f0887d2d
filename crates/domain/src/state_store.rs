//! State store port
//!
//! Durable mapping of groups to their desired size and VMs to their
//! lifecycle state. The store is the only shared mutable state in the
//! process; all writes to VM rows go through conditional operations keyed on
//! the expected current state, and desired sizes change only through
//! compare-and-set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use proxmox_ca_shared::{VmState, Vmid};

/// One managed VM row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub vmid: Vmid,
    pub group_id: String,
    pub hostname: String,
    pub state: VmState,
    /// Unix seconds of row insertion
    pub created_at: i64,
    /// Unix seconds of the last state change
    pub last_transition_at: i64,
    pub last_error: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Conditional VM write lost: the stored state is not the expected one
    #[error("stale state for vmid {vmid}: expected {expected}, found {actual:?}")]
    StaleState {
        vmid: Vmid,
        expected: VmState,
        actual: Option<VmState>,
    },

    /// Compare-and-set on a desired size lost against a concurrent writer
    #[error("concurrent desired-size update for group {group_id}")]
    ConcurrentUpdate { group_id: String },

    /// A row for this vmid already exists
    #[error("vm record already exists: {vmid}")]
    AlreadyExists { vmid: Vmid },

    /// Underlying engine failure
    #[error("state store backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
        }
    }

    /// Conflicts are retried in place by the caller; backend failures are not.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::StaleState { .. } | StoreError::ConcurrentUpdate { .. }
        )
    }
}

/// Durable state operations.
///
/// Implementations must survive process restart and provide read-your-writes
/// within the single owning process.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create tables on first use. Safe to call repeatedly.
    async fn init(&self) -> Result<(), StoreError>;

    /// Insert a new VM row. Fails with [`StoreError::AlreadyExists`] when the
    /// vmid is taken.
    async fn insert_vm(&self, record: &VmRecord) -> Result<(), StoreError>;

    async fn get_vm(&self, vmid: Vmid) -> Result<Option<VmRecord>, StoreError>;

    /// All rows of one group, ordered by vmid.
    async fn list_vms(&self, group_id: &str) -> Result<Vec<VmRecord>, StoreError>;

    async fn list_all_vms(&self) -> Result<Vec<VmRecord>, StoreError>;

    /// Conditionally advance a row from `from` to `to`, stamping
    /// `last_transition_at` and replacing `last_error`.
    async fn transition_vm(
        &self,
        vmid: Vmid,
        from: VmState,
        to: VmState,
        last_error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Conditionally delete a row; the terminal side of `deleting_node`.
    async fn remove_vm(&self, vmid: Vmid, from: VmState) -> Result<(), StoreError>;

    /// Record an error on a row without changing its state.
    async fn set_last_error(&self, vmid: Vmid, message: Option<&str>) -> Result<(), StoreError>;

    /// Count of rows in `pending` or `active` for the group.
    async fn count_live(&self, group_id: &str) -> Result<u32, StoreError>;

    async fn get_desired(&self, group_id: &str) -> Result<Option<u32>, StoreError>;

    /// Insert the default desired size if the group has none yet; returns the
    /// value now stored.
    async fn init_desired(&self, group_id: &str, default: u32) -> Result<u32, StoreError>;

    /// Compare-and-set the desired size.
    async fn cas_desired(&self, group_id: &str, expected: u32, new: u32)
        -> Result<(), StoreError>;
}
