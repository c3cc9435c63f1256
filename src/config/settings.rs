/*
* Fleet provisioner configuration
* -------------------------------
*
* Layered like this (lowest to highest priority):
*   1. generate_default_config() baked into the binary
*   2. <CONFIG_PATH>/default.toml
*   3. <CONFIG_PATH>/local.toml (optional, machine specific)
*   4. FLEET_* environment variables, `__` between sections
*      e.g. FLEET_HYPERVISOR__NODE=pve2
*
* Everything the pipeline needs from the outside world that is not the queue
* itself lives here: which template to clone, which node to talk to, fleet
* hardware defaults, per-project presets, storage pools and polling budgets.
*/

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub hypervisor: HypervisorSettings,
    pub hardware: HardwareSettings,
    #[serde(default)]
    pub projects: HashMap<String, ProjectSettings>,
    pub storage: StorageSettings,
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub simulator: SimulatorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorSettings {
    pub node: String,
    pub template_vm_id: u32,
    /// Lowest id the naming allocator hands out.
    pub vm_id_floor: u32,
    /// Used when a create item arrives without a name.
    pub name_prefix: String,
    pub primary_disk: String,
    pub secondary_disk: String,
    /// Storage that receives generated provisioning ISOs.
    pub iso_storage: String,
}

/// Fleet-wide hardware defaults. Presets equal to these are considered stale
/// and get refreshed from the live template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareSettings {
    pub cores: u32,
    pub memory: u64,
    pub disk_gib: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub disk_gib: Option<u64>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub playbook_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub enabled: Vec<String>,
    pub auto_select_best: bool,
    pub default_storage: String,
    #[serde(default)]
    pub format: Option<String>,
}

/// Polling budgets, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    pub clone_task_ms: u64,
    pub delete_task_ms: u64,
    pub resize_task_ms: u64,
    pub config_task_ms: u64,
    pub presence_ms: u64,
    pub config_read_ms: u64,
    pub convergence_ms: u64,
    pub task_interval_ms: u64,
    pub config_read_interval_ms: u64,
    pub convergence_interval_ms: u64,
}

impl TimeoutSettings {
    fn policy(timeout_ms: u64, interval_ms: u64) -> RetryPolicy {
        RetryPolicy::from_timeout(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
    }

    pub fn clone_task(&self) -> RetryPolicy {
        Self::policy(self.clone_task_ms, self.task_interval_ms)
    }

    pub fn delete_task(&self) -> RetryPolicy {
        Self::policy(self.delete_task_ms, self.task_interval_ms)
    }

    pub fn resize_task(&self) -> RetryPolicy {
        Self::policy(self.resize_task_ms, self.task_interval_ms)
    }

    pub fn config_task(&self) -> RetryPolicy {
        Self::policy(self.config_task_ms, self.task_interval_ms)
    }

    pub fn presence(&self) -> RetryPolicy {
        Self::policy(self.presence_ms, self.task_interval_ms)
    }

    pub fn config_read(&self) -> RetryPolicy {
        Self::policy(self.config_read_ms, self.config_read_interval_ms)
    }

    pub fn convergence(&self) -> RetryPolicy {
        Self::policy(self.convergence_ms, self.convergence_interval_ms)
    }

    /// Millisecond-scale budgets for rehearsals and tests.
    pub fn fast() -> Self {
        Self {
            clone_task_ms: 200,
            delete_task_ms: 200,
            resize_task_ms: 200,
            config_task_ms: 200,
            presence_ms: 200,
            config_read_ms: 100,
            convergence_ms: 50,
            task_interval_ms: 2,
            config_read_interval_ms: 2,
            convergence_interval_ms: 5,
        }
    }
}

/// Shape of the in-memory cluster used by `run --simulate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSettings {
    /// Pool name -> free GiB.
    pub pools: HashMap<String, u64>,
    pub template_cores: u32,
    pub template_memory: u64,
    pub template_disk_gib: u64,
    /// Ids of VMs that already exist besides the template.
    #[serde(default)]
    pub existing_vms: Vec<u32>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            pools: HashMap::from([
                ("local-lvm".to_string(), 500),
                ("fast-nvme".to_string(), 1000),
            ]),
            template_cores: 2,
            template_memory: 4096,
            template_disk_gib: 64,
            existing_vms: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads settings from `$CONFIG_PATH` (default `config/`).
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(dir: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from path: {}", dir.display());

        let config = Config::builder()
            .add_source(Config::try_from(&generate_default_config())?)
            .add_source(File::with_name(&dir.join("default").to_string_lossy()).required(false))
            .add_source(File::with_name(&dir.join("local").to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("FLEET").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn project(&self, project_id: Option<&str>) -> Option<&ProjectSettings> {
        project_id.and_then(|id| self.projects.get(id))
    }

    /// Renders the settings as TOML, for `init`.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

pub fn default_config_file(dir: &Path) -> PathBuf {
    dir.join("default.toml")
}

pub fn generate_default_config() -> Settings {
    Settings {
        server: ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 3000,
            api_prefix: "/api/v1".to_string(),
        },
        hypervisor: HypervisorSettings {
            node: "pve".to_string(),
            template_vm_id: 9000,
            vm_id_floor: 100,
            name_prefix: "bot".to_string(),
            primary_disk: "scsi0".to_string(),
            secondary_disk: "scsi1".to_string(),
            iso_storage: "local".to_string(),
        },
        hardware: HardwareSettings {
            cores: 2,
            memory: 4096,
            disk_gib: 64,
        },
        projects: HashMap::new(),
        storage: StorageSettings {
            enabled: vec!["local-lvm".to_string()],
            auto_select_best: true,
            default_storage: "local-lvm".to_string(),
            format: None,
        },
        timeouts: TimeoutSettings {
            clone_task_ms: 600_000,
            delete_task_ms: 300_000,
            resize_task_ms: 300_000,
            config_task_ms: 120_000,
            presence_ms: 120_000,
            config_read_ms: 30_000,
            convergence_ms: 60_000,
            task_interval_ms: 2000,
            config_read_interval_ms: 1000,
            convergence_interval_ms: 2000,
        },
        simulator: SimulatorSettings::default(),
    }
}
