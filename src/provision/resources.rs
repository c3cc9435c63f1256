use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::convergence::ConvergenceTarget;
use super::storage::GIB;
use crate::config::{HardwareSettings, ProjectSettings, Settings};
use crate::core::gateway::{config_u32, config_u64, VmConfig};
use crate::core::queue::{QueueItem, ResourceMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePreset {
    pub cores: u32,
    pub memory: u64,
}

impl From<ResourcePreset> for ConvergenceTarget {
    fn from(preset: ResourcePreset) -> Self {
        ConvergenceTarget {
            cores: preset.cores,
            memory: preset.memory,
        }
    }
}

/// What the template VM looks like right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemplateSnapshot {
    pub cores: Option<u32>,
    pub memory: Option<u64>,
    pub disk_bytes: Option<u64>,
}

impl TemplateSnapshot {
    pub fn from_config(config: &VmConfig, primary_disk: &str) -> Self {
        Self {
            cores: config_u32(config, "cores"),
            memory: config_u64(config, "memory"),
            disk_bytes: config.get(primary_disk).and_then(|spec| disk_size_bytes(spec)),
        }
    }
}

/// Resource presets frozen for one run: live template values plus the
/// project table as it was when the run started.
#[derive(Debug, Clone)]
pub struct ResourcePlanner {
    template: TemplateSnapshot,
    hardware: HardwareSettings,
    projects: HashMap<String, ProjectSettings>,
}

impl ResourcePlanner {
    pub fn new(template: TemplateSnapshot, settings: &Settings) -> Self {
        Self {
            template,
            hardware: settings.hardware,
            projects: settings.projects.clone(),
        }
    }

    pub fn template_preset(&self) -> ResourcePreset {
        ResourcePreset {
            cores: self.template.cores.unwrap_or(self.hardware.cores),
            memory: self.template.memory.unwrap_or(self.hardware.memory),
        }
    }

    fn project(&self, project_id: Option<&str>) -> Option<&ProjectSettings> {
        project_id.and_then(|id| self.projects.get(id))
    }

    /// The project's preset, with holes filled from the live template. A
    /// preset that still equals the fleet-wide defaults was never really
    /// configured and is refreshed from the template as well.
    pub fn project_preset(&self, project_id: Option<&str>) -> ResourcePreset {
        let live = self.template_preset();
        let Some(project) = self.project(project_id) else {
            return live;
        };
        let preset = ResourcePreset {
            cores: project.cores.unwrap_or(live.cores),
            memory: project.memory.unwrap_or(live.memory),
        };
        if preset.cores == self.hardware.cores && preset.memory == self.hardware.memory {
            debug!(?project_id, "project preset equals fleet defaults, using live template values");
            return live;
        }
        preset
    }

    pub fn resolve(&self, item: &QueueItem) -> ResourcePreset {
        let project_id = item.project_id.as_deref();
        match item.resource_mode() {
            ResourceMode::Original => self.template_preset(),
            ResourceMode::Project => self.project_preset(project_id),
            ResourceMode::Custom => {
                let fallback = self.project_preset(project_id);
                ResourcePreset {
                    cores: item.cores.filter(|c| *c > 0).unwrap_or(fallback.cores),
                    memory: item.memory.filter(|m| *m > 0).unwrap_or(fallback.memory),
                }
            }
        }
    }

    /// Disk size explicitly asked for, by the item or its project.
    pub fn desired_disk_gib(&self, item: &QueueItem) -> Option<u64> {
        item.disk_gib
            .or_else(|| self.project(item.project_id.as_deref()).and_then(|p| p.disk_gib))
            .filter(|gib| *gib > 0)
    }

    /// Footprint used for storage bookkeeping.
    pub fn estimate_bytes(&self, item: &QueueItem) -> u64 {
        match self.desired_disk_gib(item) {
            Some(gib) => gib.saturating_mul(GIB),
            None => self
                .template
                .disk_bytes
                .unwrap_or_else(|| self.hardware.disk_gib.saturating_mul(GIB)),
        }
    }
}

/// Reads `size=` out of a disk spec like `local-lvm:vm-101-disk-0,size=64G`.
pub fn disk_size_bytes(spec: &str) -> Option<u64> {
    let size = spec
        .split(',')
        .find_map(|part| part.trim().strip_prefix("size="))?;
    parse_size(size)
}

/// `64G`, `512M`, `1T`, `1048576` (bytes).
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (number, unit) = match raw.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => raw.split_at(idx),
        None => (raw, ""),
    };
    let value: u64 = number.parse().ok()?;
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "" => 1,
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => GIB,
        "T" => GIB * 1024,
        _ => return None,
    };
    value.checked_mul(multiplier)
}
