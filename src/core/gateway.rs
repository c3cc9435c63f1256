use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{GatewayResult, RetryPolicy};

/// Opaque handle for an asynchronous hypervisor task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Upid(pub String);

impl fmt::Display for Upid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exit status the hypervisor reports for a successful task.
pub const TASK_OK: &str = "OK";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub exitstatus: String,
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        self.exitstatus == TASK_OK
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneRequest {
    pub template_id: u32,
    pub new_id: u32,
    pub name: String,
    pub storage: Option<String>,
    pub format: Option<String>,
    pub full: bool,
    pub node: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub purge: bool,
    pub destroy_unreferenced_disks: bool,
}

/// A VM as listed on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub template: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Vm,
    Storage,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Vm => f.write_str("vm"),
            ResourceKind::Storage => f.write_str("storage"),
        }
    }
}

/// Cluster-wide resource entry, tagged by `type` like the hypervisor's
/// `/cluster/resources` listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClusterResource {
    Qemu {
        node: String,
        vmid: u32,
        #[serde(default)]
        name: Option<String>,
    },
    Storage {
        node: String,
        storage: String,
        #[serde(default)]
        avail: Option<u64>,
        #[serde(default)]
        total: Option<u64>,
    },
}

/// Flat key/value VM configuration (`cores`, `memory`, `net0`, `scsi0`, ...).
pub type VmConfig = BTreeMap<String, String>;

pub fn config_u32(config: &VmConfig, key: &str) -> Option<u32> {
    config.get(key).and_then(|v| v.trim().parse().ok())
}

pub fn config_u64(config: &VmConfig, key: &str) -> Option<u64> {
    config.get(key).and_then(|v| v.trim().parse().ok())
}

/// What to change in a VM's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigChange {
    /// Arbitrary key/value patch.
    Keys(VmConfig),
    /// Hardware sizing.
    Resources { cores: u32, memory: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub vm_id: u32,
    pub node: String,
    pub change: ConfigChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskResize {
    pub vm_id: u32,
    pub node: String,
    pub disk: String,
    /// Absolute size, e.g. `"160G"`.
    pub size: String,
}

/// Inventory record tying a VM's stable identity to its project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRegistration {
    pub vm_uuid: String,
    pub vm_name: String,
    pub project_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Host-side request to materialize a generated ISO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionIsoRequest {
    pub vm_id: u32,
    pub node: String,
    pub storage: String,
    pub files: BTreeMap<String, Vec<u8>>,
}

/// Remote hypervisor cluster as seen by the pipeline. Every call may block on
/// the network; implementations must be cheap to share behind an `Arc`.
#[async_trait]
pub trait HypervisorGateway: Send + Sync {
    async fn clone_vm(&self, request: &CloneRequest) -> GatewayResult<Upid>;

    async fn delete_vm(&self, vm_id: u32, node: &str, options: DeleteOptions) -> GatewayResult<Upid>;

    async fn wait_for_task(&self, upid: &Upid, node: &str, policy: RetryPolicy) -> GatewayResult<TaskOutcome>;

    /// Polls until the VM's existence equals `expected`; returns the last
    /// observed existence either way.
    async fn wait_for_vm_presence(
        &self,
        vm_id: u32,
        node: &str,
        expected: bool,
        policy: RetryPolicy,
    ) -> GatewayResult<bool>;

    async fn list_vms(&self, node: &str) -> GatewayResult<Vec<VmSummary>>;

    async fn get_cluster_resources(&self, kind: ResourceKind) -> GatewayResult<Vec<ClusterResource>>;

    async fn get_vm_config(&self, vm_id: u32, node: &str) -> GatewayResult<VmConfig>;

    async fn update_vm_config(&self, update: &ConfigUpdate) -> GatewayResult<Upid>;

    async fn resize_vm_disk(&self, resize: &DiskResize) -> GatewayResult<Upid>;

    async fn register_vm_resource(&self, registration: &VmRegistration) -> GatewayResult<()>;

    /// Writes the ISO onto host storage and returns its volume id.
    async fn create_provision_iso(&self, request: &ProvisionIsoRequest) -> GatewayResult<String>;

    async fn attach_cdrom(&self, vm_id: u32, node: &str, volume: &str) -> GatewayResult<()>;
}
