use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::ProvisioningPipeline;
use crate::core::gateway::{ConfigChange, ConfigUpdate, DiskResize, VmConfig, VmRegistration};
use crate::core::queue::{ItemUpdate, QueueItem, QueueStatus};
use crate::errors::{ProvisionError, ProvisionResult, QueueError};
use crate::monitoring::{LogLevel, Phase, TaskStatus};
use crate::provision::convergence::{ConvergenceTarget, ConvergenceVerifier};
use crate::provision::identity::{changed_mutable_keys, diff_fields, verified_fields};
use crate::provision::resources::{disk_size_bytes, ResourcePlanner};
use crate::provision::storage::GIB;

/// How many times cores/memory are applied before giving up.
const RESOURCE_APPLY_CYCLES: u32 = 2;

/// Result of a successful resource apply + verify.
#[derive(Debug, Clone, Copy)]
struct Converged {
    cycles: u32,
    reads: u32,
}

impl ProvisioningPipeline {
    /// Returns the items that reached `provisioning`.
    pub(super) async fn configure_phase(&mut self, items: &[QueueItem]) -> Vec<QueueItem> {
        self.ctx.events.phase(Phase::Configure, items.len());
        self.ctx
            .events
            .step(format!("Configuring {} VM(s)", items.len()));

        let planner = self.resource_planner();
        let mut configured = Vec::new();
        for item in items {
            if self.ctx.cancel.is_cancelled() {
                self.cancelled = true;
                break;
            }
            self.ctx
                .events
                .start_task(&item.id, format!("Configure {}", item.name));
            match self.configure_item(item, &planner).await {
                Ok(updated) => {
                    self.ctx
                        .events
                        .finish_task(&item.id, TaskStatus::Success, "VM configured");
                    configured.push(updated);
                }
                Err(e) => self.fail_item(item, e).await,
            }
        }
        configured
    }

    async fn configure_item(
        &mut self,
        item: &QueueItem,
        planner: &ResourcePlanner,
    ) -> ProvisionResult<QueueItem> {
        self.checkpoint()?;
        let vm_id = item.vm_id.ok_or_else(|| {
            QueueError::Invalid(format!("cloned item {} has no vm id", item.id))
        })?;
        self.set_status(&item.id, QueueStatus::Configuring).await?;

        let before = self.read_config(vm_id).await?;
        self.ctx.events.table(
            &item.id,
            "Cloned config",
            before
                .iter()
                .filter(|(key, _)| ["cores", "memory", "net0", "name"].contains(&key.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        // identity, keyed by vm id
        let patch = self.ctx.identity.patch(&item.name, vm_id, &before)?;
        let changes = changed_mutable_keys(&before, &patch.config);
        if changes.is_empty() {
            debug!(vm_id, "identity already in place");
        } else {
            self.task_log(
                &item.id,
                LogLevel::Info,
                format!("patching {} identity key(s)", changes.len()),
            );
            self.apply_config(vm_id, ConfigChange::Keys(changes)).await?;
        }
        self.checkpoint()?;

        // disk
        let disk_gib = self.grow_disk(item, vm_id, &before, planner).await?;
        self.checkpoint()?;

        // cores / memory
        let preset = planner.resolve(item);
        let converged = self.converge(item, vm_id, preset.into()).await?;
        self.ctx.events.table(
            &item.id,
            "Resources",
            vec![
                ("cores".into(), preset.cores.to_string()),
                ("memory".into(), preset.memory.to_string()),
                ("apply cycles".into(), converged.cycles.to_string()),
                ("verify reads".into(), converged.reads.to_string()),
            ],
        );

        let after = self.read_config(vm_id).await?;
        let diffs = diff_fields(
            &before,
            &after,
            &verified_fields(&self.ctx.settings.hypervisor.secondary_disk),
        );
        self.ctx.events.diff_table(&item.id, "Before / after", diffs);

        let ip = patch.ip.map(|ip| ip.to_string());
        let uuid = patch.uuid.clone();
        self.register(item, vm_id, ip.as_deref(), uuid.as_deref()).await?;

        let mut update = ItemUpdate::status(QueueStatus::Provisioning)
            .with_resources(preset.cores, preset.memory)
            .with_identity(ip, uuid);
        if let Some(gib) = disk_gib {
            update = update.with_disk(gib);
        }
        self.update(&item.id, update).await
    }

    /// Reads a VM's config, retrying while it comes back empty or errors.
    /// Freshly cloned VMs often report nothing for a moment.
    async fn read_config(&self, vm_id: u32) -> ProvisionResult<VmConfig> {
        let policy = self.ctx.settings.timeouts.config_read();
        let gateway = self.ctx.gateway.clone();
        let node = self.ctx.node().to_string();

        let read = policy
            .poll("vm config", |attempt| {
                let gateway = gateway.clone();
                let node = node.clone();
                async move {
                    match gateway.get_vm_config(vm_id, &node).await {
                        Ok(config) if !config.is_empty() => Some(config),
                        Ok(_) => None,
                        Err(e) => {
                            debug!(vm_id, attempt, error = %e, "config read failed");
                            None
                        }
                    }
                }
            })
            .await;

        read.map(|(config, _)| config)
            .ok_or(ProvisionError::EmptyConfig {
                vm_id,
                attempts: policy.max_attempts,
            })
    }

    async fn apply_config(&self, vm_id: u32, change: ConfigChange) -> ProvisionResult<()> {
        let update = ConfigUpdate {
            vm_id,
            node: self.ctx.node().to_string(),
            change,
        };
        let upid = self.ctx.gateway.update_vm_config(&update).await?;
        self.await_task(&upid, self.ctx.settings.timeouts.config_task())
            .await
    }

    /// Grows the primary disk to the requested size. Never shrinks: a
    /// smaller request keeps the current size and leaves a warning. Returns
    /// the size the disk really has afterwards, when it is known.
    async fn grow_disk(
        &mut self,
        item: &QueueItem,
        vm_id: u32,
        before: &VmConfig,
        planner: &ResourcePlanner,
    ) -> ProvisionResult<Option<u64>> {
        let Some(desired_gib) = planner.desired_disk_gib(item) else {
            return Ok(None);
        };
        let disk = self.ctx.settings.hypervisor.primary_disk.clone();
        let desired = desired_gib.saturating_mul(GIB);

        let current = match before.get(&disk).and_then(|spec| disk_size_bytes(spec)) {
            Some(current) => current,
            None => {
                self.warn_item(
                    item,
                    format!("size of {disk} unknown, skipping resize to {desired_gib}G"),
                );
                return Ok(None);
            }
        };
        if desired < current {
            self.warn_item(
                item,
                format!(
                    "{disk} is {}G, refusing to shrink to {desired_gib}G",
                    current / GIB
                ),
            );
            return Ok(Some(current / GIB));
        }
        if desired == current {
            return Ok(Some(desired_gib));
        }

        info!(vm_id, %disk, from = current / GIB, to = desired_gib, "growing disk");
        let upid = self
            .ctx
            .gateway
            .resize_vm_disk(&DiskResize {
                vm_id,
                node: self.ctx.node().to_string(),
                disk,
                size: format!("{desired_gib}G"),
            })
            .await?;
        self.await_task(&upid, self.ctx.settings.timeouts.resize_task())
            .await?;
        Ok(Some(desired_gib))
    }

    /// Applies cores/memory and waits for the VM to report them. A stale
    /// read after the first apply earns exactly one re-apply.
    async fn converge(
        &self,
        item: &QueueItem,
        vm_id: u32,
        target: ConvergenceTarget,
    ) -> ProvisionResult<Converged> {
        let verifier = ConvergenceVerifier::new(self.ctx.settings.timeouts.convergence());
        let gateway = self.ctx.gateway.clone();
        let node = self.ctx.node().to_string();
        let mut reads = 0;
        let mut last = None;

        for cycle in 1..=RESOURCE_APPLY_CYCLES {
            self.checkpoint()?;
            self.apply_config(
                vm_id,
                ConfigChange::Resources {
                    cores: target.cores,
                    memory: target.memory,
                },
            )
            .await?;

            let report = verifier
                .verify(target, || gateway.get_vm_config(vm_id, &node))
                .await;
            reads += report.attempts;
            if report.ok {
                return Ok(Converged {
                    cycles: cycle,
                    reads,
                });
            }
            if cycle < RESOURCE_APPLY_CYCLES {
                self.task_log(
                    &item.id,
                    LogLevel::Warn,
                    format!(
                        "VM reports {:?}c/{:?}MB, re-applying {}c/{}MB",
                        report.observed_cores, report.observed_memory, target.cores, target.memory
                    ),
                );
            }
            last = Some(report);
        }

        Err(ProvisionError::ConvergenceFailed {
            vm_id,
            want_cores: target.cores,
            want_memory: target.memory,
            observed_cores: last.and_then(|r| r.observed_cores),
            observed_memory: last.and_then(|r| r.observed_memory),
        })
    }

    /// Records the VM with the inventory. Without a uuid and ip there is
    /// nothing to register; that is a warning, not a failure.
    async fn register(
        &mut self,
        item: &QueueItem,
        vm_id: u32,
        ip: Option<&str>,
        uuid: Option<&str>,
    ) -> ProvisionResult<()> {
        let (Some(ip), Some(uuid)) = (ip, uuid) else {
            warn!(item_id = %item.id, vm_id, "no identity to register");
            self.warn_item(item, "identity patch produced no uuid/ip, registration skipped");
            return Ok(());
        };

        let registration = VmRegistration {
            vm_uuid: uuid.to_string(),
            vm_name: item.name.clone(),
            project_id: item.project_id.clone(),
            metadata: HashMap::from([
                ("ip".to_string(), ip.to_string()),
                ("vm_id".to_string(), vm_id.to_string()),
                ("node".to_string(), self.ctx.node().to_string()),
            ]),
        };
        self.ctx.gateway.register_vm_resource(&registration).await?;
        self.task_log(&item.id, LogLevel::Info, format!("registered {uuid} at {ip}"));
        Ok(())
    }
}
