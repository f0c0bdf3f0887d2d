//! Proxmox adapter
//!
//! Implements the domain's Proxmox port on top of [`PveClient`]. Two rules
//! live here: every operation is idempotent (absence is success for the
//! destroy family, presence is success for the create family), and every
//! failure is classified transient or permanent for the reconciler.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::info;

use proxmox_ca_domain::proxmox_api::{
    CreateVmSpec, ProxmoxApi, ProxmoxError, VmStatus, VmSummary,
};
use proxmox_ca_shared::config::ProxmoxConfig;
use proxmox_ca_shared::{tags, Vmid};

use super::client::{PveClient, PveError};

pub struct ProxmoxAdapter {
    client: PveClient,
    config: ProxmoxConfig,
}

impl ProxmoxAdapter {
    pub fn new(config: ProxmoxConfig) -> Result<Self, ProxmoxError> {
        let client = PveClient::new(&config).map_err(classify)?;
        Ok(Self { client, config })
    }

    fn qemu_path(&self, vmid: Vmid) -> String {
        format!("/nodes/{}/qemu/{}", self.client.node(), vmid)
    }

    fn storage_path(&self, storage: &str) -> String {
        format!("/nodes/{}/storage/{}", self.client.node(), storage)
    }

    async fn vm_config(&self, vmid: Vmid) -> Result<Option<Value>, PveError> {
        match self.client.get(&format!("{}/config", self.qemu_path(vmid))).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn vm_running(&self, vmid: Vmid) -> Result<Option<bool>, PveError> {
        match self
            .client
            .get(&format!("{}/status/current", self.qemu_path(vmid)))
            .await
        {
            Ok(value) => Ok(Some(
                value.get("status").and_then(Value::as_str) == Some("running"),
            )),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Volume id of the cloud image inside the import storage, downloading
    /// it first if the storage does not hold it yet.
    async fn ensure_import_image(
        &self,
        image_url: &str,
        target_storage: &str,
    ) -> Result<String, PveError> {
        let filename = image_filename(image_url);
        let want = format!("import/{}", filename);

        let content = self
            .client
            .get(&format!("{}/content", self.storage_path(target_storage)))
            .await?;
        if let Some(items) = content.as_array() {
            for item in items {
                let volid = item.get("volid").and_then(Value::as_str).unwrap_or("");
                if volid.ends_with(&want) {
                    return Ok(filename);
                }
            }
        }

        info!(
            target: "proxmox_ca::pve",
            %image_url, storage = %target_storage, "downloading cloud image"
        );
        let upid = self
            .client
            .post(
                &format!("{}/download-url", self.storage_path(target_storage)),
                &[
                    ("content", "import".to_string()),
                    ("filename", filename.clone()),
                    ("url", image_url.to_string()),
                ],
            )
            .await?;
        self.client.wait_if_task(&upid).await?;
        Ok(filename)
    }
}

#[async_trait]
impl ProxmoxApi for ProxmoxAdapter {
    async fn list_vms_with_tag(&self, tag: &str) -> Result<Vec<VmSummary>, ProxmoxError> {
        let listing = self
            .client
            .get(&format!("/nodes/{}/qemu", self.client.node()))
            .await
            .map_err(classify)?;

        let mut out = Vec::new();
        for item in listing.as_array().map(Vec::as_slice).unwrap_or_default() {
            let Some(vmid) = item.get("vmid").and_then(Value::as_u64) else {
                continue;
            };
            let vmid = Vmid(vmid as u32);
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let running = item.get("status").and_then(Value::as_str) == Some("running");
            let mut vm_tags = tags::parse_tags(item.get("tags").and_then(Value::as_str).unwrap_or(""));
            if vm_tags.is_empty() {
                // The cluster listing omits tags on some Proxmox versions;
                // the per-VM config always carries them.
                if let Ok(Some(config)) = self.vm_config(vmid).await {
                    vm_tags =
                        tags::parse_tags(config.get("tags").and_then(Value::as_str).unwrap_or(""));
                }
            }
            if vm_tags.iter().any(|t| t == tag) {
                out.push(VmSummary {
                    vmid,
                    name,
                    running,
                    tags: vm_tags,
                });
            }
        }
        out.sort_by_key(|vm| vm.vmid);
        Ok(out)
    }

    async fn next_vmid(&self) -> Result<Vmid, ProxmoxError> {
        let value = self.client.get("/cluster/nextid").await.map_err(classify)?;
        let raw = match &value {
            Value::String(s) => s.parse::<u32>().ok(),
            Value::Number(n) => n.as_u64().map(|v| v as u32),
            _ => None,
        };
        raw.map(Vmid).ok_or_else(|| {
            ProxmoxError::permanent(format!("unexpected nextid payload: {value}"))
        })
    }

    async fn create_vm(&self, spec: &CreateVmSpec) -> Result<(), ProxmoxError> {
        if self.vm_config(spec.vmid).await.map_err(classify)?.is_some() {
            return Ok(());
        }
        let form = [
            ("vmid", spec.vmid.to_string()),
            ("name", spec.hostname.clone()),
            ("agent", "1".to_string()),
            ("cores", spec.shape.cores.to_string()),
            ("memory", spec.shape.memory_mb.to_string()),
            ("net0", format!("virtio,bridge={}", spec.bridge)),
            ("ipconfig0", "ip=dhcp".to_string()),
            ("scsihw", "virtio-scsi-pci".to_string()),
            ("serial0", "socket".to_string()),
            ("vga", "serial0".to_string()),
            ("ostype", "l26".to_string()),
            ("boot", "order=scsi0".to_string()),
            ("tags", spec.tags.join(";")),
        ];
        let upid = self
            .client
            .post(&format!("/nodes/{}/qemu", self.client.node()), &form)
            .await
            .map_err(classify)?;
        self.client.wait_if_task(&upid).await.map_err(classify)?;
        info!(target: "proxmox_ca::pve", vmid = %spec.vmid, name = %spec.hostname, "VM shell created");
        Ok(())
    }

    async fn import_disk(
        &self,
        vmid: Vmid,
        image_url: &str,
        target_storage: &str,
        disk_gb: u32,
    ) -> Result<(), ProxmoxError> {
        let config = self
            .vm_config(vmid)
            .await
            .map_err(classify)?
            .ok_or_else(|| ProxmoxError::permanent(format!("vm {vmid} does not exist")))?;
        if config.get("scsi0").is_some() {
            return Ok(());
        }

        let filename = self
            .ensure_import_image(image_url, target_storage)
            .await
            .map_err(classify)?;
        let scsi0 = format!(
            "{}:0,import-from={}:import/{},discard=on",
            self.config.vm_storage, target_storage, filename
        );
        let upid = self
            .client
            .post(
                &format!("{}/config", self.qemu_path(vmid)),
                &[("scsi0", scsi0)],
            )
            .await
            .map_err(classify)?;
        self.client.wait_if_task(&upid).await.map_err(classify)?;

        // Growing the imported image to the group's disk size is best-effort:
        // some storages refuse online resizes and the VM still boots.
        let resize = self
            .client
            .put(
                &format!("{}/resize", self.qemu_path(vmid)),
                &[
                    ("disk", "scsi0".to_string()),
                    ("size", format!("{}G", disk_gb)),
                ],
            )
            .await;
        if let Ok(upid) = resize {
            self.client.wait_if_task(&upid).await.map_err(classify)?;
        }
        Ok(())
    }

    async fn upload_iso(&self, iso_name: &str, content: Vec<u8>) -> Result<(), ProxmoxError> {
        // Overwrite semantics: drop any previous volume of this name first.
        self.destroy_iso(iso_name).await?;
        let upid = self
            .client
            .upload(&self.config.iso_storage, "iso", iso_name, content)
            .await
            .map_err(classify)?;
        self.client.wait_if_task(&upid).await.map_err(classify)?;
        Ok(())
    }

    async fn attach_iso(&self, vmid: Vmid, iso_name: &str) -> Result<(), ProxmoxError> {
        let volid = format!("{}:iso/{}", self.config.iso_storage, iso_name);
        let config = self
            .vm_config(vmid)
            .await
            .map_err(classify)?
            .ok_or_else(|| ProxmoxError::permanent(format!("vm {vmid} does not exist")))?;
        let attached = config.get("ide2").and_then(Value::as_str).unwrap_or("");
        if attached.starts_with(&volid) {
            return Ok(());
        }
        let upid = self
            .client
            .post(
                &format!("{}/config", self.qemu_path(vmid)),
                &[("ide2", format!("{},media=cdrom", volid))],
            )
            .await
            .map_err(classify)?;
        self.client.wait_if_task(&upid).await.map_err(classify)?;
        Ok(())
    }

    async fn start_vm(&self, vmid: Vmid) -> Result<(), ProxmoxError> {
        match self.vm_running(vmid).await.map_err(classify)? {
            Some(true) => return Ok(()),
            Some(false) => {}
            None => return Err(ProxmoxError::permanent(format!("vm {vmid} does not exist"))),
        }
        let upid = self
            .client
            .post(&format!("{}/status/start", self.qemu_path(vmid)), &[])
            .await
            .map_err(classify)?;
        self.client.wait_if_task(&upid).await.map_err(classify)?;
        Ok(())
    }

    async fn stop_vm(&self, vmid: Vmid) -> Result<(), ProxmoxError> {
        match self.vm_running(vmid).await.map_err(classify)? {
            Some(true) => {}
            Some(false) | None => return Ok(()),
        }
        // Graceful shutdown; Proxmox escalates to a hard stop at the
        // deadline.
        let upid = self
            .client
            .post(
                &format!("{}/status/shutdown", self.qemu_path(vmid)),
                &[
                    ("timeout", "60".to_string()),
                    ("forceStop", "1".to_string()),
                ],
            )
            .await
            .map_err(classify)?;
        self.client.wait_if_task(&upid).await.map_err(classify)?;
        Ok(())
    }

    async fn destroy_vm(&self, vmid: Vmid) -> Result<(), ProxmoxError> {
        if self.vm_config(vmid).await.map_err(classify)?.is_none() {
            return Ok(());
        }
        self.stop_vm(vmid).await?;
        let result = self
            .client
            .delete(&format!(
                "{}?purge=1&destroy-unreferenced-disks=1",
                self.qemu_path(vmid)
            ))
            .await;
        match result {
            Ok(upid) => {
                self.client.wait_if_task(&upid).await.map_err(classify)?;
                info!(target: "proxmox_ca::pve", vmid = %vmid, "VM destroyed");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    async fn destroy_iso(&self, iso_name: &str) -> Result<(), ProxmoxError> {
        let volid = format!("iso/{}", iso_name);
        let result = self
            .client
            .delete(&format!(
                "{}/content/{}",
                self.storage_path(&self.config.iso_storage),
                volid
            ))
            .await;
        match result {
            Ok(upid) => {
                self.client.wait_if_task(&upid).await.map_err(classify)?;
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    async fn vm_status(&self, vmid: Vmid) -> Result<VmStatus, ProxmoxError> {
        let Some(config) = self.vm_config(vmid).await.map_err(classify)? else {
            return Ok(VmStatus {
                present: false,
                running: false,
                tags: Vec::new(),
            });
        };
        let running = self
            .vm_running(vmid)
            .await
            .map_err(classify)?
            .unwrap_or(false);
        Ok(VmStatus {
            present: true,
            running,
            tags: tags::parse_tags(config.get("tags").and_then(Value::as_str).unwrap_or("")),
        })
    }
}

/// Transient: the request may succeed next tick. Permanent: the request is
/// wrong and retrying cannot help.
fn classify(err: PveError) -> ProxmoxError {
    match &err {
        PveError::Transport(_) | PveError::TaskTimeout { .. } => {
            ProxmoxError::transient(err.to_string())
        }
        PveError::Status { code, .. } => {
            if code.is_server_error()
                || *code == StatusCode::TOO_MANY_REQUESTS
                || *code == StatusCode::CONFLICT
                || *code == StatusCode::LOCKED
            {
                ProxmoxError::transient(err.to_string())
            } else {
                ProxmoxError::permanent(err.to_string())
            }
        }
        PveError::TaskFailed { .. } => ProxmoxError::permanent(err.to_string()),
    }
}

/// Filename under which the cloud image is stored; Proxmox requires a known
/// image extension for `import` content.
fn image_filename(image_url: &str) -> String {
    let path = image_url.split('?').next().unwrap_or(image_url);
    let name = path.rsplit('/').next().unwrap_or("cloud-image.qcow2");
    if name.is_empty() {
        "cloud-image.qcow2".to_string()
    } else if name.ends_with(".qcow2") || name.ends_with(".img") || name.ends_with(".raw") {
        name.to_string()
    } else {
        format!("{}.qcow2", name)
    }
}
