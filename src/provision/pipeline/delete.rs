use tracing::{debug, info};

use super::ProvisioningPipeline;
use crate::core::gateway::DeleteOptions;
use crate::core::queue::{ItemUpdate, QueueItem, QueueStatus};
use crate::errors::{ProvisionError, ProvisionResult};
use crate::monitoring::{LogLevel, Phase, TaskStatus};

impl ProvisioningPipeline {
    pub(super) async fn delete_phase(&mut self, items: &[QueueItem]) {
        self.ctx.events.phase(Phase::Delete, items.len());
        self.ctx
            .events
            .step(format!("Deleting {} VM(s)", items.len()));

        for item in items {
            if self.ctx.cancel.is_cancelled() {
                self.cancelled = true;
                break;
            }
            self.ctx
                .events
                .start_task(&item.id, format!("Delete {}", item.name));
            match self.delete_item(item).await {
                Ok(()) => self
                    .ctx
                    .events
                    .finish_task(&item.id, TaskStatus::Success, "VM deleted"),
                Err(e) => self.fail_item(item, e).await,
            }
        }
    }

    async fn delete_item(&self, item: &QueueItem) -> ProvisionResult<()> {
        let target = item.valid_target().ok_or_else(|| {
            ProvisionError::InvalidTarget(format!("{:?}", item.target_vm_id))
        })?;
        if target == self.ctx.settings.hypervisor.template_vm_id {
            return Err(ProvisionError::InvalidTarget(format!(
                "{target} is the template VM"
            )));
        }

        self.update(
            &item.id,
            ItemUpdate::status(QueueStatus::Deleting).with_vm_id(target),
        )
        .await?;

        let node = self.ctx.node().to_string();
        let timeouts = &self.ctx.settings.timeouts;
        let (task_policy, presence_policy) = (timeouts.delete_task(), timeouts.presence());

        info!(item_id = %item.id, vm_id = target, %node, "deleting VM");
        let upid = self
            .ctx
            .gateway
            .delete_vm(
                target,
                &node,
                DeleteOptions {
                    purge: true,
                    destroy_unreferenced_disks: true,
                },
            )
            .await?;
        self.task_log(&item.id, LogLevel::Info, format!("delete task {upid} started"));
        self.await_task(&upid, task_policy).await?;

        let still_there = self
            .ctx
            .gateway
            .wait_for_vm_presence(target, &node, false, presence_policy)
            .await?;
        if still_there {
            return Err(ProvisionError::PresenceTimeout {
                vm_id: target,
                expected: false,
            });
        }
        debug!(vm_id = target, "VM gone from the cluster");

        self.set_status(&item.id, QueueStatus::Done).await?;
        Ok(())
    }
}
