use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::gateway::{
    ClusterResource, CloneRequest, ConfigChange, ConfigUpdate, DeleteOptions, DiskResize,
    HypervisorGateway, ProvisionIsoRequest, ResourceKind, TaskOutcome, Upid, VmConfig,
    VmRegistration, VmSummary, TASK_OK,
};
use crate::config::Settings;
use crate::errors::{GatewayError, GatewayResult, RetryPolicy};
use crate::provision::resources::{disk_size_bytes, parse_size};
use crate::provision::storage::GIB;

/// Knobs for making the simulated cluster misbehave.
#[derive(Debug, Clone, Default)]
struct Faults {
    clone_task_fails: HashSet<u32>,
    delete_task_fails: HashSet<u32>,
    /// Resource applies that report OK but change nothing.
    stale_resource_applies: u32,
    /// Empty config reads served right after each clone.
    empty_reads_after_clone: u32,
    iso_attach_fails: bool,
    registration_fails: bool,
    listing_fails: bool,
    /// Delete tasks that finish OK while the VM stays listed.
    lingering_after_delete: HashSet<u32>,
    /// Clone tasks that finish OK but never produce a VM.
    unlisted_clones: HashSet<u32>,
    clone_latency: Duration,
}

/// How often each mutating call was made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub clones: u32,
    pub deletes: u32,
    pub config_updates: u32,
    pub resource_updates: u32,
    pub resizes: u32,
    pub registrations: u32,
    pub iso_uploads: u32,
    pub cdrom_attaches: u32,
}

#[derive(Debug, Clone)]
struct SimVm {
    config: VmConfig,
    template: bool,
    empty_reads_left: u32,
}

impl SimVm {
    fn name(&self) -> Option<String> {
        self.config.get("name").cloned()
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    vms: BTreeMap<u32, SimVm>,
    /// Pool -> free bytes.
    pools: BTreeMap<String, u64>,
    tasks: HashMap<Upid, String>,
    task_seq: u64,
    faults: Faults,
    calls: CallCounts,
    registrations: Vec<VmRegistration>,
    isos: BTreeMap<String, usize>,
}

impl ClusterState {
    fn finish_task(&mut self, node: &str, kind: &str, vm_id: u32, exitstatus: impl Into<String>) -> Upid {
        self.task_seq += 1;
        let upid = Upid(format!(
            "UPID:{node}:{:08X}:{kind}:{vm_id}:root@pam:",
            self.task_seq
        ));
        self.tasks.insert(upid.clone(), exitstatus.into());
        upid
    }

    fn vm_mut(&mut self, vm_id: u32, node: &str) -> GatewayResult<&mut SimVm> {
        self.vms.get_mut(&vm_id).ok_or_else(|| GatewayError::VmNotFound {
            vm_id,
            node: node.to_string(),
        })
    }
}

/// In-memory hypervisor node. Tasks finish instantly; everything else
/// (exit statuses, empty configs, stale applies) can be scripted.
#[derive(Debug)]
pub struct SimulatedCluster {
    node: String,
    state: Mutex<ClusterState>,
}

impl SimulatedCluster {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            state: Mutex::new(ClusterState::default()),
        }
    }

    /// Cluster shaped by the `[simulator]` settings section.
    pub fn from_settings(settings: &Settings) -> Self {
        let sim = &settings.simulator;
        let mut cluster = Self::new(settings.hypervisor.node.clone()).with_template(
            settings.hypervisor.template_vm_id,
            sim.template_cores,
            sim.template_memory,
            sim.template_disk_gib,
        );
        for (pool, free_gib) in &sim.pools {
            cluster = cluster.with_pool(pool, *free_gib);
        }
        for vm_id in &sim.existing_vms {
            cluster = cluster.with_vm(*vm_id, &format!("existing-{vm_id}"));
        }
        cluster
    }

    fn state_mut(&mut self) -> &mut ClusterState {
        self.state.get_mut()
    }

    pub fn with_template(mut self, vm_id: u32, cores: u32, memory: u64, disk_gib: u64) -> Self {
        let config = VmConfig::from([
            ("name".to_string(), "template".to_string()),
            ("cores".to_string(), cores.to_string()),
            ("memory".to_string(), memory.to_string()),
            ("net0".to_string(), "virtio=BC:24:11:00:00:01,bridge=vmbr0".to_string()),
            (
                "scsi0".to_string(),
                format!("local-lvm:base-{vm_id}-disk-0,size={disk_gib}G"),
            ),
            (
                "scsi1".to_string(),
                format!("local-lvm:base-{vm_id}-disk-1,size=8G"),
            ),
            ("args".to_string(), "-cpu host".to_string()),
            ("template".to_string(), "1".to_string()),
        ]);
        self.state_mut().vms.insert(
            vm_id,
            SimVm {
                config,
                template: true,
                empty_reads_left: 0,
            },
        );
        self
    }

    pub fn with_vm(mut self, vm_id: u32, name: &str) -> Self {
        let config = VmConfig::from([
            ("name".to_string(), name.to_string()),
            ("cores".to_string(), "2".to_string()),
            ("memory".to_string(), "2048".to_string()),
            (
                "scsi0".to_string(),
                format!("local-lvm:vm-{vm_id}-disk-0,size=32G"),
            ),
        ]);
        self.state_mut().vms.insert(
            vm_id,
            SimVm {
                config,
                template: false,
                empty_reads_left: 0,
            },
        );
        self
    }

    pub fn with_pool(mut self, storage: &str, free_gib: u64) -> Self {
        self.state_mut()
            .pools
            .insert(storage.to_string(), free_gib.saturating_mul(GIB));
        self
    }

    pub fn failing_clone_of(mut self, vm_id: u32) -> Self {
        self.state_mut().faults.clone_task_fails.insert(vm_id);
        self
    }

    pub fn failing_delete_of(mut self, vm_id: u32) -> Self {
        self.state_mut().faults.delete_task_fails.insert(vm_id);
        self
    }

    pub fn lingering_after_delete_of(mut self, vm_id: u32) -> Self {
        self.state_mut().faults.lingering_after_delete.insert(vm_id);
        self
    }

    pub fn unlisted_clone_of(mut self, vm_id: u32) -> Self {
        self.state_mut().faults.unlisted_clones.insert(vm_id);
        self
    }

    /// Every clone call sleeps this long before touching the cluster.
    pub fn with_clone_latency(mut self, latency: Duration) -> Self {
        self.state_mut().faults.clone_latency = latency;
        self
    }

    pub fn with_stale_resource_applies(mut self, count: u32) -> Self {
        self.state_mut().faults.stale_resource_applies = count;
        self
    }

    pub fn with_empty_reads_after_clone(mut self, count: u32) -> Self {
        self.state_mut().faults.empty_reads_after_clone = count;
        self
    }

    pub fn with_failing_iso_attach(mut self) -> Self {
        self.state_mut().faults.iso_attach_fails = true;
        self
    }

    pub fn with_failing_registration(mut self) -> Self {
        self.state_mut().faults.registration_fails = true;
        self
    }

    pub fn with_failing_listing(mut self) -> Self {
        self.state_mut().faults.listing_fails = true;
        self
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    pub async fn vm_exists(&self, vm_id: u32) -> bool {
        self.state.lock().await.vms.contains_key(&vm_id)
    }

    /// Raw config, bypassing scripted empty reads.
    pub async fn vm_config(&self, vm_id: u32) -> Option<VmConfig> {
        self.state
            .lock()
            .await
            .vms
            .get(&vm_id)
            .map(|vm| vm.config.clone())
    }

    pub async fn registrations(&self) -> Vec<VmRegistration> {
        self.state.lock().await.registrations.clone()
    }

    pub async fn pool_free(&self, storage: &str) -> Option<u64> {
        self.state.lock().await.pools.get(storage).copied()
    }

    fn check_node(&self, node: &str) -> GatewayResult<()> {
        if node == self.node {
            Ok(())
        } else {
            Err(GatewayError::Request(format!("unknown node {node}")))
        }
    }
}

#[async_trait]
impl HypervisorGateway for SimulatedCluster {
    async fn clone_vm(&self, request: &CloneRequest) -> GatewayResult<Upid> {
        self.check_node(&request.node)?;
        let latency = self.state.lock().await.faults.clone_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().await;
        state.calls.clones += 1;

        if state.vms.contains_key(&request.new_id) {
            return Err(GatewayError::VmExists {
                vm_id: request.new_id,
            });
        }
        let template = state
            .vms
            .get(&request.template_id)
            .cloned()
            .ok_or_else(|| GatewayError::VmNotFound {
                vm_id: request.template_id,
                node: request.node.clone(),
            })?;

        if state.faults.clone_task_fails.contains(&request.new_id) {
            warn!(vm_id = request.new_id, "simulated clone failure");
            return Ok(state.finish_task(&self.node, "qmclone", request.new_id, "clone failed: disk copy aborted"));
        }

        let storage = request
            .storage
            .clone()
            .unwrap_or_else(|| "local-lvm".to_string());
        let mut config = template.config.clone();
        config.remove("template");
        config.insert("name".into(), request.name.clone());
        let mut footprint = 0;
        for (index, disk) in ["scsi0", "scsi1"].iter().enumerate() {
            if let Some(spec) = config.get(*disk) {
                let size = disk_size_bytes(spec).unwrap_or(0);
                footprint += size;
                config.insert(
                    disk.to_string(),
                    format!(
                        "{storage}:vm-{}-disk-{index},size={}G",
                        request.new_id,
                        size / GIB
                    ),
                );
            }
        }
        if let Some(free) = state.pools.get_mut(&storage) {
            *free = free.saturating_sub(footprint);
        }

        if state.faults.unlisted_clones.contains(&request.new_id) {
            warn!(vm_id = request.new_id, "simulated clone finished without a VM");
            return Ok(state.finish_task(&self.node, "qmclone", request.new_id, TASK_OK));
        }

        let empty_reads_left = state.faults.empty_reads_after_clone;
        state.vms.insert(
            request.new_id,
            SimVm {
                config,
                template: false,
                empty_reads_left,
            },
        );
        info!(vm_id = request.new_id, name = %request.name, %storage, "simulated clone done");
        Ok(state.finish_task(&self.node, "qmclone", request.new_id, TASK_OK))
    }

    async fn delete_vm(&self, vm_id: u32, node: &str, options: DeleteOptions) -> GatewayResult<Upid> {
        self.check_node(node)?;
        let mut state = self.state.lock().await;
        state.calls.deletes += 1;
        state.vm_mut(vm_id, node)?;

        if state.faults.delete_task_fails.contains(&vm_id) {
            warn!(vm_id, "simulated delete failure");
            return Ok(state.finish_task(&self.node, "qmdestroy", vm_id, "VM is locked (backup)"));
        }
        if state.faults.lingering_after_delete.contains(&vm_id) {
            warn!(vm_id, "simulated delete left the VM behind");
            return Ok(state.finish_task(&self.node, "qmdestroy", vm_id, TASK_OK));
        }
        state.vms.remove(&vm_id);
        debug!(vm_id, purge = options.purge, "simulated delete done");
        Ok(state.finish_task(&self.node, "qmdestroy", vm_id, TASK_OK))
    }

    async fn wait_for_task(&self, upid: &Upid, node: &str, _policy: RetryPolicy) -> GatewayResult<TaskOutcome> {
        self.check_node(node)?;
        let state = self.state.lock().await;
        state
            .tasks
            .get(upid)
            .map(|exitstatus| TaskOutcome {
                exitstatus: exitstatus.clone(),
            })
            .ok_or_else(|| GatewayError::TaskNotFound {
                upid: upid.to_string(),
            })
    }

    async fn wait_for_vm_presence(
        &self,
        vm_id: u32,
        node: &str,
        expected: bool,
        policy: RetryPolicy,
    ) -> GatewayResult<bool> {
        self.check_node(node)?;
        let settled = policy
            .poll("vm presence", |_| async move {
                let exists = self.state.lock().await.vms.contains_key(&vm_id);
                (exists == expected).then_some(exists)
            })
            .await;
        Ok(match settled {
            Some((exists, _)) => exists,
            None => !expected,
        })
    }

    async fn list_vms(&self, node: &str) -> GatewayResult<Vec<VmSummary>> {
        self.check_node(node)?;
        let state = self.state.lock().await;
        if state.faults.listing_fails {
            return Err(GatewayError::Request("listing unavailable".into()));
        }
        Ok(state
            .vms
            .iter()
            .map(|(vmid, vm)| VmSummary {
                vmid: *vmid,
                name: vm.name(),
                status: "stopped".to_string(),
                template: vm.template,
            })
            .collect())
    }

    async fn get_cluster_resources(&self, kind: ResourceKind) -> GatewayResult<Vec<ClusterResource>> {
        let state = self.state.lock().await;
        let resources = match kind {
            ResourceKind::Vm => state
                .vms
                .iter()
                .map(|(vmid, vm)| ClusterResource::Qemu {
                    node: self.node.clone(),
                    vmid: *vmid,
                    name: vm.name(),
                })
                .collect(),
            ResourceKind::Storage => state
                .pools
                .iter()
                .map(|(storage, free)| ClusterResource::Storage {
                    node: self.node.clone(),
                    storage: storage.clone(),
                    avail: Some(*free),
                    total: None,
                })
                .collect(),
        };
        Ok(resources)
    }

    async fn get_vm_config(&self, vm_id: u32, node: &str) -> GatewayResult<VmConfig> {
        self.check_node(node)?;
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(vm_id, node)?;
        if vm.empty_reads_left > 0 {
            vm.empty_reads_left -= 1;
            return Ok(VmConfig::new());
        }
        Ok(vm.config.clone())
    }

    async fn update_vm_config(&self, update: &ConfigUpdate) -> GatewayResult<Upid> {
        self.check_node(&update.node)?;
        let mut state = self.state.lock().await;
        state.vm_mut(update.vm_id, &update.node)?;

        match &update.change {
            ConfigChange::Keys(keys) => {
                state.calls.config_updates += 1;
                let vm = state.vm_mut(update.vm_id, &update.node)?;
                vm.config
                    .extend(keys.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            ConfigChange::Resources { cores, memory } => {
                state.calls.resource_updates += 1;
                if state.faults.stale_resource_applies > 0 {
                    // reports OK, changes nothing
                    state.faults.stale_resource_applies -= 1;
                    debug!(vm_id = update.vm_id, "simulated stale resource apply");
                } else {
                    let vm = state.vm_mut(update.vm_id, &update.node)?;
                    vm.config.insert("cores".into(), cores.to_string());
                    vm.config.insert("memory".into(), memory.to_string());
                }
            }
        }
        Ok(state.finish_task(&self.node, "qmconfig", update.vm_id, TASK_OK))
    }

    async fn resize_vm_disk(&self, resize: &DiskResize) -> GatewayResult<Upid> {
        self.check_node(&resize.node)?;
        let mut state = self.state.lock().await;
        state.calls.resizes += 1;

        let wanted = parse_size(&resize.size)
            .ok_or_else(|| GatewayError::Request(format!("bad size {}", resize.size)))?;
        let vm = state.vm_mut(resize.vm_id, &resize.node)?;
        let spec = vm
            .config
            .get(&resize.disk)
            .cloned()
            .ok_or_else(|| GatewayError::Request(format!("no disk {}", resize.disk)))?;
        let current = disk_size_bytes(&spec).unwrap_or(0);
        if wanted < current {
            return Ok(state.finish_task(&self.node, "resize", resize.vm_id, "shrinking disks is not supported"));
        }

        let volume = spec.split(',').next().unwrap_or_default().to_string();
        vm.config.insert(
            resize.disk.clone(),
            format!("{volume},size={}G", wanted / GIB),
        );
        Ok(state.finish_task(&self.node, "resize", resize.vm_id, TASK_OK))
    }

    async fn register_vm_resource(&self, registration: &VmRegistration) -> GatewayResult<()> {
        let mut state = self.state.lock().await;
        state.calls.registrations += 1;
        if state.faults.registration_fails {
            return Err(GatewayError::Request("inventory rejected registration".into()));
        }
        state.registrations.push(registration.clone());
        Ok(())
    }

    async fn create_provision_iso(&self, request: &ProvisionIsoRequest) -> GatewayResult<String> {
        self.check_node(&request.node)?;
        let mut state = self.state.lock().await;
        state.calls.iso_uploads += 1;
        let volume = format!("{}:iso/provision-{}.iso", request.storage, request.vm_id);
        let bytes = request.files.values().map(Vec::len).sum();
        state.isos.insert(volume.clone(), bytes);
        Ok(volume)
    }

    async fn attach_cdrom(&self, vm_id: u32, node: &str, volume: &str) -> GatewayResult<()> {
        self.check_node(node)?;
        let mut state = self.state.lock().await;
        state.calls.cdrom_attaches += 1;
        if state.faults.iso_attach_fails {
            return Err(GatewayError::Storage {
                storage: volume.to_string(),
                message: "ide2 is busy".into(),
            });
        }
        if !state.isos.contains_key(volume) {
            return Err(GatewayError::Request(format!("volume {volume} does not exist")));
        }
        let vm = state.vm_mut(vm_id, node)?;
        vm.config
            .insert("ide2".into(), format!("{volume},media=cdrom"));
        Ok(())
    }
}
