use tracing::info;

use super::ProvisioningPipeline;
use crate::core::gateway::ProvisionIsoRequest;
use crate::core::queue::{QueueItem, QueueStatus};
use crate::errors::{ProvisionError, ProvisionResult};
use crate::monitoring::{LogLevel, Phase, TaskStatus};
use crate::provision::iso::{gateway_for, IsoRequest};

impl ProvisioningPipeline {
    /// Attaches a provisioning ISO to every configured VM. ISO trouble is
    /// only a warning; each item still ends `done`.
    pub(super) async fn provision_phase(&mut self, items: &[QueueItem]) {
        self.ctx.events.phase(Phase::Provision, items.len());
        self.ctx
            .events
            .step(format!("Provisioning {} VM(s)", items.len()));

        for item in items {
            if self.ctx.cancel.is_cancelled() {
                self.cancelled = true;
                break;
            }
            self.ctx
                .events
                .start_task(&item.id, format!("Provision {}", item.name));

            let outcome = match (item.ip.as_deref(), item.uuid.as_deref()) {
                (Some(ip), Some(uuid)) => self.attach_iso(item, ip, uuid).await,
                _ => Err(ProvisionError::Iso("item has no ip/uuid".into())),
            };
            let (status, message) = match outcome {
                Ok(volume) => (TaskStatus::Success, format!("ISO {volume} attached")),
                Err(e) => {
                    let message = format!("provisioning ISO skipped: {e}");
                    self.warn_item(item, message.clone());
                    (TaskStatus::Warning, message)
                }
            };

            match self.set_status(&item.id, QueueStatus::Done).await {
                Ok(_) => self.ctx.events.finish_task(&item.id, status, message),
                Err(e) => self.fail_item(item, e).await,
            }
        }
    }

    async fn attach_iso(&self, item: &QueueItem, ip: &str, uuid: &str) -> ProvisionResult<String> {
        let vm_id = item
            .vm_id
            .ok_or_else(|| ProvisionError::Iso("item has no vm id".into()))?;
        let gateway = gateway_for(ip)
            .ok_or_else(|| ProvisionError::Iso(format!("cannot derive a gateway from {ip}")))?;
        let project = self.ctx.settings.project(item.project_id.as_deref());

        let request = IsoRequest {
            vm_uuid: uuid.to_string(),
            ip: ip.to_string(),
            gateway,
            vm_name: item.name.clone(),
            profile_id: project.and_then(|p| p.profile_id.clone()),
            playbook_id: project.and_then(|p| p.playbook_id.clone()),
        };
        let payload = self.ctx.iso.generate_iso_payload(&request).await?;
        self.task_log(
            &item.id,
            LogLevel::Debug,
            format!("ISO payload with {} file(s)", payload.files.len()),
        );

        let node = self.ctx.node().to_string();
        let volume = self
            .ctx
            .gateway
            .create_provision_iso(&ProvisionIsoRequest {
                vm_id,
                node: node.clone(),
                storage: self.ctx.settings.hypervisor.iso_storage.clone(),
                files: payload.files,
            })
            .await?;
        self.ctx.gateway.attach_cdrom(vm_id, &node, &volume).await?;
        info!(item_id = %item.id, vm_id, %volume, "provisioning ISO attached");
        Ok(volume)
    }
}
