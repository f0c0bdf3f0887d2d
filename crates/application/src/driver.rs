//! The single write path for VM rows.
//!
//! Both the reconciler and the scaling service mutate VM rows exclusively
//! through [`apply_event`], which pairs the pure transition table with the
//! store's conditional write. A losing writer sees `StaleState` and reloads;
//! an illegal transition is logged and leaves the row untouched.

use tracing::warn;

use proxmox_ca_domain::lifecycle::{self, NextState, VmEvent};
use proxmox_ca_domain::state_store::{StateStore, StoreError, VmRecord};
use proxmox_ca_shared::VmState;

/// Apply `event` to `record` and persist the outcome.
///
/// Returns the new state, or `None` when the row was removed. An illegal
/// transition returns the unchanged current state.
pub(crate) async fn apply_event(
    store: &dyn StateStore,
    record: &VmRecord,
    event: VmEvent,
    last_error: Option<&str>,
) -> Result<Option<VmState>, StoreError> {
    match lifecycle::transition(record.state, event) {
        Ok(NextState::Persist(next)) => {
            store
                .transition_vm(record.vmid, record.state, next, last_error)
                .await?;
            Ok(Some(next))
        }
        Ok(NextState::Remove) => {
            store.remove_vm(record.vmid, record.state).await?;
            Ok(None)
        }
        Err(illegal) => {
            warn!(
                target: "proxmox_ca::lifecycle",
                vmid = %record.vmid,
                group = %record.group_id,
                "{illegal}"
            );
            Ok(Some(record.state))
        }
    }
}
