use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a managed VM.
///
/// The three `Deleting*` states form the teardown pipeline; each one names
/// the side effect that must complete before the row may advance. A row is
/// removed from the store after the `DeletingNode` step succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Pending,
    Active,
    Failed,
    DeletingVm,
    DeletingIso,
    DeletingNode,
}

impl VmState {
    /// States that count against the group's desired size.
    pub fn is_live(&self) -> bool {
        matches!(self, VmState::Pending | VmState::Active)
    }

    /// States on the teardown pipeline.
    pub fn is_deleting(&self) -> bool {
        matches!(
            self,
            VmState::DeletingVm | VmState::DeletingIso | VmState::DeletingNode
        )
    }

    /// States the reconciler's cleanup pass picks up.
    pub fn needs_cleanup(&self) -> bool {
        matches!(self, VmState::Failed) || self.is_deleting()
    }

    /// Validates a transition against the lifecycle DAG.
    ///
    /// Once a VM leaves `Pending` no sequence of valid transitions brings it
    /// back; the teardown states only ever move forward.
    pub fn can_transition_to(&self, next: &VmState) -> bool {
        matches!(
            (self, next),
            (VmState::Pending, VmState::Active)
                | (VmState::Pending, VmState::Failed)
                | (VmState::Pending, VmState::DeletingVm)
                | (VmState::Active, VmState::Failed)
                | (VmState::Active, VmState::DeletingVm)
                | (VmState::Failed, VmState::DeletingVm)
                | (VmState::DeletingVm, VmState::DeletingIso)
                | (VmState::DeletingIso, VmState::DeletingNode)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Pending => "pending",
            VmState::Active => "active",
            VmState::Failed => "failed",
            VmState::DeletingVm => "deleting_vm",
            VmState::DeletingIso => "deleting_iso",
            VmState::DeletingNode => "deleting_node",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VmState::Pending),
            "active" => Ok(VmState::Active),
            "failed" => Ok(VmState::Failed),
            "deleting_vm" => Ok(VmState::DeletingVm),
            "deleting_iso" => Ok(VmState::DeletingIso),
            "deleting_node" => Ok(VmState::DeletingNode),
            other => Err(format!("unknown vm state: {}", other)),
        }
    }
}
