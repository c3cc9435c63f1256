//! The four-phase queue run: Delete, Clone, Configure, Provision.
//!
//! Phases run strictly in order and items inside a phase run one after the
//! other. Every per-item failure is caught at the item boundary and turned
//! into an `error` status; only cancellation stops the run early.

mod clone;
mod configure;
mod delete;
mod provision;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::context::RunContext;
use super::resources::ResourcePlanner;
use crate::core::gateway::Upid;
use crate::core::queue::{ItemUpdate, QueueAction, QueueItem, QueueStatus};
use crate::errors::{ProvisionError, ProvisionResult, RetryPolicy};
use crate::monitoring::{LogLevel, PipelineEvent, RunState, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub name: String,
    pub message: String,
}

/// Aggregate outcome of one run, computed from the store after the last
/// phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub state: RunState,
    pub cancelled: bool,
    /// Items that were pending when the run started.
    pub total: usize,
    pub done: usize,
    pub errors: usize,
    /// Items never touched by this run.
    pub pending: usize,
    /// Items stopped mid-lifecycle by a cancellation.
    pub interrupted: usize,
    pub failures: Vec<ItemFailure>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            state: RunState::Idle,
            cancelled: false,
            total: 0,
            done: 0,
            errors: 0,
            pending: 0,
            interrupted: 0,
            failures: Vec::new(),
            warnings: Vec::new(),
            started_at,
            finished_at: started_at,
        }
    }
}

pub struct ProvisioningPipeline {
    ctx: RunContext,
    planner: Option<ResourcePlanner>,
    cancelled: bool,
    failures: Vec<ItemFailure>,
    warnings: Vec<String>,
}

impl ProvisioningPipeline {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            planner: None,
            cancelled: false,
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Processes every pending item once. Never returns an error: partial
    /// failures show up per item and in the summary.
    pub async fn run(mut self) -> RunSummary {
        let started_at = Utc::now();
        let pending = self.ctx.store.pending().await;

        if pending.is_empty() {
            self.ctx.events.info("queue has no pending items");
            self.ctx.events.state(RunState::Idle);
            let summary = RunSummary::empty(started_at);
            self.ctx.events.emit(PipelineEvent::RunFinished {
                summary: summary.clone(),
            });
            return summary;
        }

        let (deletes, creates): (Vec<QueueItem>, Vec<QueueItem>) = pending
            .iter()
            .cloned()
            .partition(|item| item.action == QueueAction::Delete);

        info!(
            deletes = deletes.len(),
            creates = creates.len(),
            node = self.ctx.node(),
            "queue run starting"
        );
        self.ctx.events.state(RunState::Running);

        if !deletes.is_empty() {
            self.delete_phase(&deletes).await;
        }

        if !self.cancelled && !creates.is_empty() {
            let cloned = self.clone_phase(&creates).await;
            if cloned.is_empty() && !self.cancelled {
                self.ctx.events.error("no VM was cloned, nothing to configure");
            } else if !self.cancelled {
                let configured = self.configure_phase(&cloned).await;
                if !self.cancelled && !configured.is_empty() {
                    self.provision_phase(&configured).await;
                }
            }
        }

        if self.cancelled {
            self.ctx.events.warn("run cancelled, unprocessed items keep their status");
        }

        let summary = self.summarize(&pending, started_at).await;
        self.ctx.events.state(summary.state);
        self.ctx.events.emit(PipelineEvent::RunFinished {
            summary: summary.clone(),
        });
        summary
    }

    async fn summarize(&mut self, started: &[QueueItem], started_at: DateTime<Utc>) -> RunSummary {
        let mut summary = RunSummary::empty(started_at);
        summary.total = started.len();
        summary.cancelled = self.cancelled;

        for original in started {
            let status = match self.ctx.store.get(&original.id).await {
                Some(item) => item.status,
                None => {
                    warn!(item_id = %original.id, "item vanished from the queue during the run");
                    continue;
                }
            };
            match status {
                QueueStatus::Done => summary.done += 1,
                QueueStatus::Error => summary.errors += 1,
                QueueStatus::Pending => summary.pending += 1,
                _ => summary.interrupted += 1,
            }
        }

        summary.state = if self.cancelled || summary.errors > 0 {
            RunState::Error
        } else if summary.done > 0 {
            RunState::Success
        } else {
            RunState::Idle
        };
        summary.failures = std::mem::take(&mut self.failures);
        summary.warnings = std::mem::take(&mut self.warnings);
        summary.finished_at = Utc::now();
        summary
    }

    fn checkpoint(&self) -> ProvisionResult<()> {
        if self.ctx.cancel.is_cancelled() {
            Err(ProvisionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Applies `update` through the store and announces status changes.
    async fn update(&self, item_id: &str, update: ItemUpdate) -> ProvisionResult<QueueItem> {
        let status = update.status;
        let item = self.ctx.store.update_item(item_id, update).await?;
        if let Some(status) = status {
            self.ctx.events.status(item_id, status);
        }
        Ok(item)
    }

    async fn set_status(&self, item_id: &str, status: QueueStatus) -> ProvisionResult<QueueItem> {
        self.update(item_id, ItemUpdate::status(status)).await
    }

    /// Waits for a hypervisor task and insists on an `OK` exit status.
    async fn await_task(&self, upid: &Upid, policy: RetryPolicy) -> ProvisionResult<()> {
        let outcome = self
            .ctx
            .gateway
            .wait_for_task(upid, self.ctx.node(), policy)
            .await?;
        if outcome.is_ok() {
            Ok(())
        } else {
            Err(ProvisionError::TaskFailed {
                upid: upid.to_string(),
                exitstatus: outcome.exitstatus,
            })
        }
    }

    fn task_log(&self, item_id: &str, level: LogLevel, message: impl Into<String>) {
        self.ctx.events.task_log(item_id, level, message);
    }

    fn warn_item(&mut self, item: &QueueItem, message: impl Into<String>) {
        let message = message.into();
        self.task_log(&item.id, LogLevel::Warn, message.clone());
        self.warnings.push(format!("{}: {message}", item.name));
    }

    /// Item boundary. Cancellation leaves the item where it is; anything
    /// else marks it `error` and the batch moves on.
    async fn fail_item(&mut self, item: &QueueItem, error: ProvisionError) {
        if error == ProvisionError::Cancelled {
            self.cancelled = true;
            self.ctx
                .events
                .finish_task(&item.id, TaskStatus::Warning, "cancelled");
            return;
        }

        let message = error.to_string();
        warn!(item_id = %item.id, name = %item.name, error = %message, "item failed");
        if let Err(e) = self.update(&item.id, ItemUpdate::failed(message.clone())).await {
            warn!(item_id = %item.id, error = %e, "could not record item failure");
        }
        self.ctx
            .events
            .finish_task(&item.id, TaskStatus::Error, message.clone());
        self.failures.push(ItemFailure {
            item_id: item.id.clone(),
            name: item.name.clone(),
            message,
        });
    }
}
