use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{EventSink, FieldDiff, LogLevel, PipelineEvent, RunState, TaskStatus};
use crate::core::queue::QueueStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEntry {
    Log {
        at: DateTime<Utc>,
        level: LogLevel,
        message: String,
    },
    Table {
        at: DateTime<Utc>,
        title: String,
        rows: Vec<(String, String)>,
    },
    Diff {
        at: DateTime<Utc>,
        title: String,
        diffs: Vec<FieldDiff>,
    },
}

/// Append-only log of everything that happened to one queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub item_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub item_status: Option<QueueStatus>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub entries: Vec<TaskEntry>,
}

impl TaskRecord {
    fn new(item_id: &str, title: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            title: title.to_string(),
            status: TaskStatus::Running,
            item_status: None,
            started_at: Utc::now(),
            finished_at: None,
            message: None,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Default)]
struct TrackerState {
    tasks: HashMap<String, TaskRecord>,
    order: Vec<String>,
    batch: Vec<BatchEntry>,
    run_state: RunState,
}

/// In-memory task log fed from pipeline events. Keeps a bounded number of
/// batch lines; per-item logs live until `clear`.
#[derive(Debug)]
pub struct TaskTracker {
    state: Mutex<TrackerState>,
    batch_retention: usize,
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl TaskTracker {
    pub fn new(batch_retention: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            batch_retention,
        }
    }

    pub fn task(&self, item_id: &str) -> Option<TaskRecord> {
        self.lock().tasks.get(item_id).cloned()
    }

    /// Tasks in the order they were started.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    pub fn batch_log(&self) -> Vec<BatchEntry> {
        self.lock().batch.clone()
    }

    pub fn run_state(&self) -> RunState {
        self.lock().run_state
    }

    pub fn clear(&self) {
        *self.lock() = TrackerState::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        // a poisoned tracker still holds useful log lines
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TrackerState {
    fn record(&mut self, item_id: &str) -> &mut TaskRecord {
        if !self.tasks.contains_key(item_id) {
            self.order.push(item_id.to_string());
        }
        self.tasks
            .entry(item_id.to_string())
            .or_insert_with(|| TaskRecord::new(item_id, item_id))
    }
}

impl EventSink for TaskTracker {
    fn emit(&self, event: &PipelineEvent) {
        let mut state = self.lock();
        let now = Utc::now();
        match event {
            PipelineEvent::RunStateChanged { state: run_state } => state.run_state = *run_state,
            PipelineEvent::PhaseStarted { .. } | PipelineEvent::RunFinished { .. } => {}
            PipelineEvent::ItemStatusChanged { item_id, status } => {
                state.record(item_id).item_status = Some(*status);
            }
            PipelineEvent::TaskStarted { item_id, title } => {
                let record = state.record(item_id);
                record.title = title.clone();
                record.status = TaskStatus::Running;
                record.finished_at = None;
            }
            PipelineEvent::TaskLog { item_id, level, message } => {
                state.record(item_id).entries.push(TaskEntry::Log {
                    at: now,
                    level: *level,
                    message: message.clone(),
                });
            }
            PipelineEvent::Table { item_id, title, rows } => {
                state.record(item_id).entries.push(TaskEntry::Table {
                    at: now,
                    title: title.clone(),
                    rows: rows.clone(),
                });
            }
            PipelineEvent::DiffTable { item_id, title, diffs } => {
                state.record(item_id).entries.push(TaskEntry::Diff {
                    at: now,
                    title: title.clone(),
                    diffs: diffs.clone(),
                });
            }
            PipelineEvent::TaskFinished { item_id, status, message } => {
                let record = state.record(item_id);
                record.status = *status;
                record.message = Some(message.clone());
                record.finished_at = Some(now);
            }
            PipelineEvent::Batch { level, message } => {
                state.batch.push(BatchEntry {
                    at: now,
                    level: *level,
                    message: message.clone(),
                });
                let overflow = state.batch.len().saturating_sub(self.batch_retention);
                if overflow > 0 {
                    state.batch.drain(..overflow);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::events::EventBus;
    use std::sync::Arc;

    #[test]
    fn tracker_builds_per_item_records() {
        let tracker = Arc::new(TaskTracker::default());
        let bus = EventBus::new().with_sink(tracker.clone());

        bus.start_task("q1", "clone bot-01");
        bus.task_log("q1", LogLevel::Info, "cloning from template");
        bus.status("q1", QueueStatus::Cloned);
        bus.finish_task("q1", TaskStatus::Success, "cloned");

        let record = tracker.task("q1").unwrap();
        assert_eq!(record.title, "clone bot-01");
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(record.item_status, Some(QueueStatus::Cloned));
        assert_eq!(record.entries.len(), 1);
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn batch_log_is_bounded() {
        let tracker = Arc::new(TaskTracker::new(2));
        let bus = EventBus::new().with_sink(tracker.clone());
        bus.info("one");
        bus.info("two");
        bus.warn("three");

        let log = tracker.batch_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "two");
        assert_eq!(log[1].level, LogLevel::Warn);
    }
}
