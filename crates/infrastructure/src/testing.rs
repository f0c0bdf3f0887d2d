//! In-memory doubles for the remote ports
//!
//! `FakeProxmox` models just enough of a Proxmox node to exercise the
//! reconciler: VM presence, running state, tags, one boot disk and one
//! attached ISO per VM, plus counters that make duplicate side effects
//! visible to tests. `FakeKube` is a label registry. Both support one-shot
//! failure injection per operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use proxmox_ca_domain::kube_api::{KubeApi, KubeError, NodeAssignment};
use proxmox_ca_domain::proxmox_api::{
    CreateVmSpec, ProxmoxApi, ProxmoxError, VmStatus, VmSummary,
};
use proxmox_ca_shared::Vmid;

#[derive(Debug, Clone, Default)]
pub struct FakeVm {
    pub name: String,
    pub running: bool,
    pub tags: Vec<String>,
    pub has_disk: bool,
    pub attached_iso: Option<String>,
}

#[derive(Debug, Default)]
struct FakeProxmoxState {
    vms: BTreeMap<u32, FakeVm>,
    isos: BTreeMap<String, Vec<u8>>,
    next_vmid: u32,
    fail_next: HashMap<&'static str, ProxmoxError>,
    disk_imports: u32,
    iso_uploads: u32,
    destroyed_vms: Vec<Vmid>,
}

#[derive(Debug, Default)]
pub struct FakeProxmox {
    state: Mutex<FakeProxmoxState>,
}

impl FakeProxmox {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().next_vmid = 100;
        fake
    }

    /// Queue an error for the next call of the named operation.
    pub fn fail_next(&self, op: &'static str, err: ProxmoxError) {
        self.state.lock().unwrap().fail_next.insert(op, err);
    }

    /// Seed a VM directly, bypassing the create pipeline (orphan setups).
    pub fn seed_vm(&self, vmid: Vmid, name: &str, running: bool, tags: &[&str]) {
        self.state.lock().unwrap().vms.insert(
            vmid.0,
            FakeVm {
                name: name.to_string(),
                running,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                has_disk: true,
                attached_iso: None,
            },
        );
    }

    pub fn vm(&self, vmid: Vmid) -> Option<FakeVm> {
        self.state.lock().unwrap().vms.get(&vmid.0).cloned()
    }

    pub fn vm_count(&self) -> usize {
        self.state.lock().unwrap().vms.len()
    }

    pub fn iso_exists(&self, iso_name: &str) -> bool {
        self.state.lock().unwrap().isos.contains_key(iso_name)
    }

    pub fn iso_count(&self) -> usize {
        self.state.lock().unwrap().isos.len()
    }

    /// How many disk import operations actually ran (idempotent re-entries
    /// excluded).
    pub fn disk_imports(&self) -> u32 {
        self.state.lock().unwrap().disk_imports
    }

    /// How many ISO uploads actually ran.
    pub fn iso_uploads(&self) -> u32 {
        self.state.lock().unwrap().iso_uploads
    }

    pub fn destroyed_vms(&self) -> Vec<Vmid> {
        self.state.lock().unwrap().destroyed_vms.clone()
    }

    /// Flip a VM's running flag, as if it crashed or booted outside our
    /// control.
    pub fn set_running(&self, vmid: Vmid, running: bool) {
        if let Some(vm) = self.state.lock().unwrap().vms.get_mut(&vmid.0) {
            vm.running = running;
        }
    }

    /// Drop the VM without going through the adapter (external deletion).
    pub fn drop_vm(&self, vmid: Vmid) {
        self.state.lock().unwrap().vms.remove(&vmid.0);
    }

    fn take_failure(
        state: &mut FakeProxmoxState,
        op: &'static str,
    ) -> Result<(), ProxmoxError> {
        match state.fail_next.remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProxmoxApi for FakeProxmox {
    async fn list_vms_with_tag(&self, tag: &str) -> Result<Vec<VmSummary>, ProxmoxError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "list_vms_with_tag")?;
        Ok(state
            .vms
            .iter()
            .filter(|(_, vm)| vm.tags.iter().any(|t| t == tag))
            .map(|(vmid, vm)| VmSummary {
                vmid: Vmid(*vmid),
                name: vm.name.clone(),
                running: vm.running,
                tags: vm.tags.clone(),
            })
            .collect())
    }

    async fn next_vmid(&self) -> Result<Vmid, ProxmoxError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "next_vmid")?;
        state.next_vmid += 1;
        Ok(Vmid(state.next_vmid))
    }

    async fn create_vm(&self, spec: &CreateVmSpec) -> Result<(), ProxmoxError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "create_vm")?;
        state.vms.entry(spec.vmid.0).or_insert_with(|| FakeVm {
            name: spec.hostname.clone(),
            running: false,
            tags: spec.tags.clone(),
            has_disk: false,
            attached_iso: None,
        });
        Ok(())
    }

    async fn import_disk(
        &self,
        vmid: Vmid,
        _image_url: &str,
        _target_storage: &str,
        _disk_gb: u32,
    ) -> Result<(), ProxmoxError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        Self::take_failure(state, "import_disk")?;
        let vm = state
            .vms
            .get_mut(&vmid.0)
            .ok_or_else(|| ProxmoxError::permanent(format!("vm {vmid} does not exist")))?;
        if !vm.has_disk {
            vm.has_disk = true;
            state.disk_imports += 1;
        }
        Ok(())
    }

    async fn upload_iso(&self, iso_name: &str, content: Vec<u8>) -> Result<(), ProxmoxError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "upload_iso")?;
        state.isos.insert(iso_name.to_string(), content);
        state.iso_uploads += 1;
        Ok(())
    }

    async fn attach_iso(&self, vmid: Vmid, iso_name: &str) -> Result<(), ProxmoxError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "attach_iso")?;
        if !state.isos.contains_key(iso_name) {
            return Err(ProxmoxError::permanent(format!(
                "iso volume does not exist: {iso_name}"
            )));
        }
        let vm = state
            .vms
            .get_mut(&vmid.0)
            .ok_or_else(|| ProxmoxError::permanent(format!("vm {vmid} does not exist")))?;
        vm.attached_iso = Some(iso_name.to_string());
        Ok(())
    }

    async fn start_vm(&self, vmid: Vmid) -> Result<(), ProxmoxError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "start_vm")?;
        let vm = state
            .vms
            .get_mut(&vmid.0)
            .ok_or_else(|| ProxmoxError::permanent(format!("vm {vmid} does not exist")))?;
        vm.running = true;
        Ok(())
    }

    async fn stop_vm(&self, vmid: Vmid) -> Result<(), ProxmoxError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "stop_vm")?;
        if let Some(vm) = state.vms.get_mut(&vmid.0) {
            vm.running = false;
        }
        Ok(())
    }

    async fn destroy_vm(&self, vmid: Vmid) -> Result<(), ProxmoxError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "destroy_vm")?;
        if state.vms.remove(&vmid.0).is_some() {
            state.destroyed_vms.push(vmid);
        }
        Ok(())
    }

    async fn destroy_iso(&self, iso_name: &str) -> Result<(), ProxmoxError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "destroy_iso")?;
        state.isos.remove(iso_name);
        Ok(())
    }

    async fn vm_status(&self, vmid: Vmid) -> Result<VmStatus, ProxmoxError> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vm_status")?;
        Ok(match state.vms.get(&vmid.0) {
            Some(vm) => VmStatus {
                present: true,
                running: vm.running,
                tags: vm.tags.clone(),
            },
            None => VmStatus {
                present: false,
                running: false,
                tags: Vec::new(),
            },
        })
    }
}

#[derive(Debug, Default)]
struct FakeKubeState {
    nodes: HashMap<String, NodeAssignment>,
    deleted: Vec<String>,
    fail_next: HashMap<&'static str, KubeError>,
}

#[derive(Debug, Default)]
pub struct FakeKube {
    state: Mutex<FakeKubeState>,
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, op: &'static str, err: KubeError) {
        self.state.lock().unwrap().fail_next.insert(op, err);
    }

    /// Register a joined node with the provider labels.
    pub fn register_node(&self, name: &str, group_id: &str, vmid: Vmid) {
        self.state.lock().unwrap().nodes.insert(
            name.to_string(),
            NodeAssignment {
                group_id: group_id.to_string(),
                vmid,
            },
        );
    }

    pub fn deleted_nodes(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.state.lock().unwrap().nodes.contains_key(name)
    }
}

#[async_trait]
impl KubeApi for FakeKube {
    async fn resolve(&self, node_name: &str) -> Result<NodeAssignment, KubeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next.remove("resolve") {
            return Err(err);
        }
        state
            .nodes
            .get(node_name)
            .cloned()
            .ok_or_else(|| KubeError::NotFound {
                name: node_name.to_string(),
            })
    }

    async fn delete_node(&self, node_name: &str) -> Result<(), KubeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next.remove("delete_node") {
            return Err(err);
        }
        state.nodes.remove(node_name);
        state.deleted.push(node_name.to_string());
        Ok(())
    }
}
