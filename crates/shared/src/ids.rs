use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Proxmox-assigned integer identifier for a virtual machine.
///
/// Cluster-wide unique; chosen by Proxmox via `/cluster/nextid` and never
/// reused while the VM record exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vmid(pub u32);

impl Vmid {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Vmid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Vmid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(Self)
    }
}

impl From<u32> for Vmid {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Format a provider id the way the autoscaler expects it:
/// `proxmox://<group_id>/<vmid>`.
pub fn provider_id(group_id: &str, vmid: Vmid) -> String {
    format!("proxmox://{}/{}", group_id, vmid)
}

/// Parse a provider id back into `(group_id, vmid)`.
///
/// Returns `None` for ids produced by other providers.
pub fn parse_provider_id(id: &str) -> Option<(String, Vmid)> {
    let rest = id.strip_prefix("proxmox://")?;
    let (group_id, vmid) = rest.rsplit_once('/')?;
    if group_id.is_empty() {
        return None;
    }
    vmid.parse::<Vmid>().ok().map(|v| (group_id.to_string(), v))
}
