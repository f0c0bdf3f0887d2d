//! VM lifecycle state machine
//!
//! A pure transition table over [`VmState`]. Transitions carry no side
//! effects; the reconciler executes the effect named by
//! [`cleanup_effect`] first and feeds the completion event back in. Every
//! persisted transition is a conditional write keyed on the expected `from`
//! state, so a losing writer observes `StaleState` and reloads.
//!
//! ```text
//! pending  --NodeReady-->        active
//! pending  --ProvisionFailed-->  failed
//! pending  --PendingTimedOut-->  failed
//! pending  --DeleteRequested-->  deleting_vm
//! active   --DeleteRequested-->  deleting_vm
//! active   --NodeLost-->         failed
//! failed   --DeleteRequested-->  deleting_vm
//! deleting_vm   --VmDestroyed-->  deleting_iso
//! deleting_iso  --IsoDestroyed--> deleting_node
//! deleting_node --NodeDeleted-->  (row removed)
//! ```

use std::fmt;

use proxmox_ca_shared::VmState;

/// Events that drive a VM through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEvent {
    /// The VM runs and its node registered in Kubernetes with matching labels
    NodeReady,
    /// A create-pipeline step failed permanently
    ProvisionFailed,
    /// The VM stayed in `pending` past the configured timeout
    PendingTimedOut,
    /// The node vanished from Kubernetes while the VM was active
    NodeLost,
    /// Scale-down or explicit node deletion selected this VM
    DeleteRequested,
    /// Proxmox confirmed the VM is destroyed
    VmDestroyed,
    /// The seed ISO volume is destroyed
    IsoDestroyed,
    /// The Kubernetes node object is deleted (or was already absent)
    NodeDeleted,
}

impl fmt::Display for VmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmEvent::NodeReady => "node_ready",
            VmEvent::ProvisionFailed => "provision_failed",
            VmEvent::PendingTimedOut => "pending_timed_out",
            VmEvent::NodeLost => "node_lost",
            VmEvent::DeleteRequested => "delete_requested",
            VmEvent::VmDestroyed => "vm_destroyed",
            VmEvent::IsoDestroyed => "iso_destroyed",
            VmEvent::NodeDeleted => "node_deleted",
        };
        f.write_str(name)
    }
}

/// Outcome of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Persist(VmState),
    /// Terminal side of `deleting_node`: the row is deleted
    Remove,
}

/// A transition that the table does not permit.
///
/// Attempting one is a programmer error; callers log it and leave the row
/// untouched, and the next reconcile pass recovers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal lifecycle transition: {from} on {event}")]
pub struct IllegalTransition {
    pub from: VmState,
    pub event: VmEvent,
}

/// Compute the successor of `from` under `event`.
pub fn transition(from: VmState, event: VmEvent) -> Result<NextState, IllegalTransition> {
    use NextState::{Persist, Remove};
    use VmEvent::*;
    use VmState::*;

    let next = match (from, event) {
        (Pending, NodeReady) => Persist(Active),
        (Pending, ProvisionFailed) => Persist(Failed),
        (Pending, PendingTimedOut) => Persist(Failed),
        (Pending, DeleteRequested) => Persist(DeletingVm),
        (Active, DeleteRequested) => Persist(DeletingVm),
        (Active, NodeLost) => Persist(Failed),
        (Failed, DeleteRequested) => Persist(DeletingVm),
        (DeletingVm, VmDestroyed) => Persist(DeletingIso),
        (DeletingIso, IsoDestroyed) => Persist(DeletingNode),
        (DeletingNode, NodeDeleted) => Remove,
        _ => return Err(IllegalTransition { from, event }),
    };
    Ok(next)
}

/// The side effect that must succeed before a teardown state may advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupEffect {
    DestroyVm,
    DestroyIso,
    DeleteNode,
}

impl CleanupEffect {
    /// The event fed into [`transition`] once the effect has completed.
    pub fn done_event(&self) -> VmEvent {
        match self {
            CleanupEffect::DestroyVm => VmEvent::VmDestroyed,
            CleanupEffect::DestroyIso => VmEvent::IsoDestroyed,
            CleanupEffect::DeleteNode => VmEvent::NodeDeleted,
        }
    }
}

/// The side effect required by the current state, if any.
///
/// `Failed` needs none: the reconciler requests deletion and the teardown
/// pipeline does the work.
pub fn cleanup_effect(state: VmState) -> Option<CleanupEffect> {
    match state {
        VmState::DeletingVm => Some(CleanupEffect::DestroyVm),
        VmState::DeletingIso => Some(CleanupEffect::DestroyIso),
        VmState::DeletingNode => Some(CleanupEffect::DeleteNode),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [VmState; 6] = [
        VmState::Pending,
        VmState::Active,
        VmState::Failed,
        VmState::DeletingVm,
        VmState::DeletingIso,
        VmState::DeletingNode,
    ];

    const ALL_EVENTS: [VmEvent; 8] = [
        VmEvent::NodeReady,
        VmEvent::ProvisionFailed,
        VmEvent::PendingTimedOut,
        VmEvent::NodeLost,
        VmEvent::DeleteRequested,
        VmEvent::VmDestroyed,
        VmEvent::IsoDestroyed,
        VmEvent::NodeDeleted,
    ];

    #[test]
    fn happy_path_to_active() {
        assert_eq!(
            transition(VmState::Pending, VmEvent::NodeReady),
            Ok(NextState::Persist(VmState::Active))
        );
    }

    #[test]
    fn teardown_runs_to_row_removal() {
        let mut state = VmState::Active;
        let script = [
            (VmEvent::DeleteRequested, VmState::DeletingVm),
            (VmEvent::VmDestroyed, VmState::DeletingIso),
            (VmEvent::IsoDestroyed, VmState::DeletingNode),
        ];
        for (event, expected) in script {
            match transition(state, event).unwrap() {
                NextState::Persist(next) => {
                    assert_eq!(next, expected);
                    state = next;
                }
                NextState::Remove => panic!("removed early"),
            }
        }
        assert_eq!(
            transition(state, VmEvent::NodeDeleted),
            Ok(NextState::Remove)
        );
    }

    #[test]
    fn failed_vms_are_always_torn_down() {
        assert_eq!(
            transition(VmState::Failed, VmEvent::DeleteRequested),
            Ok(NextState::Persist(VmState::DeletingVm))
        );
    }

    #[test]
    fn no_event_sequence_returns_to_pending() {
        // Exhaustive reachability check over the transition table: from any
        // state, no sequence of legal events ends in `pending`.
        for start in ALL_STATES {
            let mut reachable = vec![start];
            let mut frontier = vec![start];
            while let Some(state) = frontier.pop() {
                for event in ALL_EVENTS {
                    if let Ok(NextState::Persist(next)) = transition(state, event) {
                        if !reachable.contains(&next) {
                            reachable.push(next);
                            frontier.push(next);
                        }
                    }
                }
            }
            if start != VmState::Pending {
                assert!(
                    !reachable.contains(&VmState::Pending),
                    "pending reachable from {start}"
                );
            }
        }
    }

    #[test]
    fn transition_table_agrees_with_state_level_validation() {
        // Every persisted edge of the event table must be a valid edge of
        // `VmState::can_transition_to`, and every valid edge must be
        // reachable through some event.
        let mut event_edges = Vec::new();
        for from in ALL_STATES {
            for event in ALL_EVENTS {
                if let Ok(NextState::Persist(to)) = transition(from, event) {
                    assert!(
                        from.can_transition_to(&to),
                        "event table allows {from} -> {to}, state validation does not"
                    );
                    event_edges.push((from, to));
                }
            }
        }
        for from in ALL_STATES {
            for to in ALL_STATES {
                if from.can_transition_to(&to) {
                    assert!(
                        event_edges.contains(&(from, to)),
                        "state validation allows {from} -> {to}, no event produces it"
                    );
                }
            }
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let err = transition(VmState::Active, VmEvent::NodeReady).unwrap_err();
        assert_eq!(err.from, VmState::Active);
        assert!(transition(VmState::DeletingIso, VmEvent::VmDestroyed).is_err());
        assert!(transition(VmState::DeletingVm, VmEvent::DeleteRequested).is_err());
        assert!(transition(VmState::Failed, VmEvent::NodeReady).is_err());
    }

    #[test]
    fn cleanup_effects_match_states() {
        assert_eq!(
            cleanup_effect(VmState::DeletingVm),
            Some(CleanupEffect::DestroyVm)
        );
        assert_eq!(
            cleanup_effect(VmState::DeletingIso),
            Some(CleanupEffect::DestroyIso)
        );
        assert_eq!(
            cleanup_effect(VmState::DeletingNode),
            Some(CleanupEffect::DeleteNode)
        );
        assert_eq!(cleanup_effect(VmState::Failed), None);
        assert_eq!(cleanup_effect(VmState::Pending), None);
    }
}
