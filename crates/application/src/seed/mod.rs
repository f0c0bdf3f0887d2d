//! Seed builder
//!
//! Produces the cloud-init payload that turns a blank cloud image into a
//! joined k3s agent: a `meta-data` file naming the instance and a
//! `#cloud-config` `user-data` file that installs the pinned k3s release and
//! joins the cluster with the provider's node labels. The two files are
//! packed into an ISO9660 `CIDATA` volume; identical inputs produce
//! byte-identical images, so re-running the builder for a vmid is a safe
//! overwrite.

mod iso9660;

use serde::Serialize;

use proxmox_ca_domain::kube_api::{LABEL_GROUP, LABEL_VMID};
use proxmox_ca_shared::config::{GroupConfig, K3sConfig};
use proxmox_ca_shared::Vmid;

pub use iso9660::build_cidata_iso;

/// Rendered cloud-init payload for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPayload {
    pub meta_data: String,
    pub user_data: String,
}

impl SeedPayload {
    /// Pack the payload into an ISO9660 image.
    pub fn into_iso(self) -> Vec<u8> {
        build_cidata_iso(self.meta_data.as_bytes(), self.user_data.as_bytes())
    }
}

/// Deterministic name of the seed ISO volume for a vmid.
pub fn seed_iso_name(vmid: Vmid) -> String {
    format!("seed-{}.iso", vmid)
}

#[derive(Serialize)]
struct CloudConfig {
    hostname: String,
    manage_etc_hosts: bool,
    ssh_authorized_keys: Vec<String>,
    package_update: bool,
    runcmd: Vec<Vec<String>>,
}

/// Render the per-VM cloud-init files.
///
/// Pure function of its inputs; the caller decides where the bytes go.
pub fn render_seed(group: &GroupConfig, vmid: Vmid, k3s: &K3sConfig) -> SeedPayload {
    let hostname = group.hostname(vmid);

    let meta_data = format!(
        "instance-id: {hostname}\nlocal-hostname: {hostname}\n",
        hostname = hostname
    );

    let mut join = format!(
        "curl -sfL https://get.k3s.io | INSTALL_K3S_VERSION='{version}' \
         K3S_URL='{server}' K3S_TOKEN='{token}' sh -s - agent",
        version = k3s.version,
        server = k3s.server_url,
        token = k3s.cluster_token,
    );
    for label in node_labels(group, vmid) {
        join.push_str(&format!(" --node-label '{}'", label));
    }
    for taint in &group.taints {
        join.push_str(&format!(" --node-taint '{}'", taint));
    }

    let config = CloudConfig {
        hostname: hostname.clone(),
        manage_etc_hosts: true,
        ssh_authorized_keys: vec![k3s.ssh_public_key.clone()],
        package_update: false,
        runcmd: vec![vec!["sh".to_string(), "-c".to_string(), join]],
    };

    // serde_yaml serialises struct fields in declaration order, which keeps
    // the output stable across runs.
    let body = serde_yaml::to_string(&config).unwrap_or_default();
    let user_data = format!("#cloud-config\n{}", body);

    SeedPayload {
        meta_data,
        user_data,
    }
}

/// The node labels passed to the k3s agent: the two well-known provider
/// labels first, then any group-configured extras.
fn node_labels(group: &GroupConfig, vmid: Vmid) -> Vec<String> {
    let mut labels = vec![
        format!("{}={}", LABEL_GROUP, group.id),
        format!("{}={}", LABEL_VMID, vmid),
    ];
    labels.extend(group.labels.iter().cloned());
    labels
}
