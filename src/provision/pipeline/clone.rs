use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::ProvisioningPipeline;
use crate::core::gateway::{CloneRequest, ResourceKind};
use crate::core::queue::{ItemUpdate, QueueItem, QueueStatus};
use crate::errors::{GatewayError, ProvisionError, ProvisionResult};
use crate::monitoring::{LogLevel, Phase, TaskStatus};
use crate::provision::naming::NamingAllocator;
use crate::provision::resources::{ResourcePlanner, TemplateSnapshot};
use crate::provision::storage::{StorageAllocator, StorageRequest, StorageStats};

impl ProvisioningPipeline {
    /// Returns the items that reached `cloned`, as stored after the clone.
    pub(super) async fn clone_phase(&mut self, items: &[QueueItem]) -> Vec<QueueItem> {
        self.ctx.events.phase(Phase::Clone, items.len());
        if self.ctx.cancel.is_cancelled() {
            self.cancelled = true;
            return Vec::new();
        }

        self.capture_template().await;

        let mut naming = match self.observe_cluster().await {
            Ok(naming) => naming,
            Err(e) => {
                self.ctx
                    .events
                    .error(format!("cannot list VMs on {}: {e}", self.ctx.node()));
                for item in items {
                    self.fail_item(item, e.clone().into()).await;
                }
                return Vec::new();
            }
        };

        let storage = self.assign_storage(items).await;

        self.ctx
            .events
            .step(format!("Cloning {} VM(s)", items.len()));
        let mut cloned = Vec::new();
        for item in items {
            if self.ctx.cancel.is_cancelled() {
                self.cancelled = true;
                break;
            }
            self.ctx
                .events
                .start_task(&item.id, format!("Clone {}", display_name(item)));
            let pool = storage.get(&item.id).cloned();
            match self.clone_item(item, &mut naming, pool).await {
                Ok(updated) => {
                    self.ctx
                        .events
                        .finish_task(&item.id, TaskStatus::Success, "VM cloned");
                    cloned.push(updated);
                }
                Err(e) => self.fail_item(item, e).await,
            }
        }
        cloned
    }

    /// Freezes template values and project presets for the rest of the run.
    async fn capture_template(&mut self) {
        let hypervisor = &self.ctx.settings.hypervisor;
        let snapshot = match self
            .ctx
            .gateway
            .get_vm_config(hypervisor.template_vm_id, &hypervisor.node)
            .await
        {
            Ok(config) => TemplateSnapshot::from_config(&config, &hypervisor.primary_disk),
            Err(e) => {
                self.ctx.events.warn(format!(
                    "template {} unreadable, using fleet defaults: {e}",
                    hypervisor.template_vm_id
                ));
                TemplateSnapshot::default()
            }
        };
        debug!(?snapshot, "template captured");
        self.planner = Some(ResourcePlanner::new(snapshot, &self.ctx.settings));
    }

    /// The planner captured at the start of the clone phase, or one built
    /// from fleet defaults if the capture never happened.
    pub(super) fn resource_planner(&self) -> ResourcePlanner {
        self.planner.clone().unwrap_or_else(|| {
            ResourcePlanner::new(TemplateSnapshot::default(), &self.ctx.settings)
        })
    }

    async fn observe_cluster(&self) -> Result<NamingAllocator, GatewayError> {
        let hypervisor = &self.ctx.settings.hypervisor;
        let mut naming = NamingAllocator::new(hypervisor.vm_id_floor);
        naming.reserve_id(hypervisor.template_vm_id);

        let vms = self.ctx.gateway.list_vms(&hypervisor.node).await?;
        naming.observe_vms(&vms);

        // other nodes share the id space
        match self.ctx.gateway.get_cluster_resources(ResourceKind::Vm).await {
            Ok(resources) => naming.observe_resources(&resources),
            Err(e) => warn!(error = %e, "cluster-wide VM listing failed, using node listing only"),
        }

        naming.observe_queue(&self.ctx.store.snapshot().await);
        Ok(naming)
    }

    /// Runs the allocator over every create item and writes the picks back
    /// to the queue. Returns item id -> pool.
    async fn assign_storage(&self, items: &[QueueItem]) -> HashMap<String, String> {
        let stats = match self
            .ctx
            .gateway
            .get_cluster_resources(ResourceKind::Storage)
            .await
        {
            Ok(resources) => StorageStats::from_resources(&resources, self.ctx.node()),
            Err(e) => {
                self.ctx
                    .events
                    .warn(format!("storage telemetry unavailable: {e}"));
                StorageStats::default()
            }
        };

        let planner = self.resource_planner();
        let requests: Vec<StorageRequest> = items
            .iter()
            .map(|item| StorageRequest {
                item_id: item.id.clone(),
                mode: item.storage_mode(),
                storage: item.storage.clone(),
                estimate_bytes: planner.estimate_bytes(item),
            })
            .collect();

        let mut allocator = StorageAllocator::new(&self.ctx.settings.storage, stats);
        let assignments = allocator.allocate(&requests);

        let mut picks = HashMap::new();
        for assignment in assignments {
            let persisted = self
                .update(
                    &assignment.item_id,
                    ItemUpdate::default().with_storage(assignment.storage.clone()),
                )
                .await;
            if let Err(e) = persisted {
                warn!(item_id = %assignment.item_id, error = %e, "storage assignment not persisted");
            }
            self.task_log(
                &assignment.item_id,
                LogLevel::Debug,
                format!("storage {} ({:?})", assignment.storage, assignment.mode),
            );
            picks.insert(assignment.item_id, assignment.storage);
        }
        picks
    }

    async fn clone_item(
        &self,
        item: &QueueItem,
        naming: &mut NamingAllocator,
        storage: Option<String>,
    ) -> ProvisionResult<QueueItem> {
        self.checkpoint()?;
        self.set_status(&item.id, QueueStatus::Cloning).await?;

        let hypervisor = &self.ctx.settings.hypervisor;
        let requested = match item.name.trim() {
            "" => format!("{}-01", hypervisor.name_prefix),
            name => name.to_string(),
        };
        let allocation = naming.allocate(&requested)?;
        if allocation.name != requested {
            self.task_log(
                &item.id,
                LogLevel::Info,
                format!("{requested} is taken, using {}", allocation.name),
            );
        }

        let format = item
            .format
            .clone()
            .or_else(|| self.ctx.settings.storage.format.clone());
        let mut update = ItemUpdate::default()
            .with_vm_id(allocation.vm_id)
            .with_name(allocation.name.clone());
        if let Some(pool) = &storage {
            update = update.with_storage(pool.clone());
        }
        if let Some(format) = &format {
            update = update.with_format(format.clone());
        }
        self.update(&item.id, update).await?;

        let request = CloneRequest {
            template_id: hypervisor.template_vm_id,
            new_id: allocation.vm_id,
            name: allocation.name.clone(),
            storage,
            format,
            full: true,
            node: hypervisor.node.clone(),
        };
        info!(
            item_id = %item.id,
            vm_id = allocation.vm_id,
            name = %allocation.name,
            storage = ?request.storage,
            "cloning template"
        );
        let upid = self.ctx.gateway.clone_vm(&request).await?;
        self.task_log(&item.id, LogLevel::Info, format!("clone task {upid} started"));
        self.await_task(&upid, self.ctx.settings.timeouts.clone_task())
            .await?;

        let present = self
            .ctx
            .gateway
            .wait_for_vm_presence(
                allocation.vm_id,
                &hypervisor.node,
                true,
                self.ctx.settings.timeouts.presence(),
            )
            .await?;
        if !present {
            return Err(ProvisionError::PresenceTimeout {
                vm_id: allocation.vm_id,
                expected: true,
            });
        }

        self.set_status(&item.id, QueueStatus::Cloned).await
    }
}

fn display_name(item: &QueueItem) -> &str {
    if item.name.is_empty() {
        "unnamed VM"
    } else {
        &item.name
    }
}
