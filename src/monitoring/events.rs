use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::queue::QueueStatus;
use crate::provision::RunSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Delete,
    Clone,
    Configure,
    Provision,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Delete => "delete",
            Phase::Clone => "clone",
            Phase::Configure => "configure",
            Phase::Provision => "provision",
        };
        f.write_str(s)
    }
}

/// What the UI shows for the run as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Step,
    Info,
    Warn,
    Error,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Success,
    Warning,
    Error,
}

/// One row of a before/after comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl FieldDiff {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Everything the pipeline says about itself. Consumers render or log these;
/// the pipeline never reads anything back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStateChanged {
        state: RunState,
    },
    PhaseStarted {
        phase: Phase,
        items: usize,
    },
    ItemStatusChanged {
        item_id: String,
        status: QueueStatus,
    },
    TaskStarted {
        item_id: String,
        title: String,
    },
    TaskLog {
        item_id: String,
        level: LogLevel,
        message: String,
    },
    Table {
        item_id: String,
        title: String,
        rows: Vec<(String, String)>,
    },
    DiffTable {
        item_id: String,
        title: String,
        diffs: Vec<FieldDiff>,
    },
    TaskFinished {
        item_id: String,
        status: TaskStatus,
        message: String,
    },
    Batch {
        level: LogLevel,
        message: String,
    },
    RunFinished {
        summary: RunSummary,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Fan-out list of sinks handed to a run.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn emit(&self, event: PipelineEvent) {
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }

    pub fn state(&self, state: RunState) {
        self.emit(PipelineEvent::RunStateChanged { state });
    }

    pub fn phase(&self, phase: Phase, items: usize) {
        self.emit(PipelineEvent::PhaseStarted { phase, items });
    }

    pub fn status(&self, item_id: &str, status: QueueStatus) {
        self.emit(PipelineEvent::ItemStatusChanged {
            item_id: item_id.to_string(),
            status,
        });
    }

    fn batch(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(PipelineEvent::Batch {
            level,
            message: message.into(),
        });
    }

    pub fn step(&self, message: impl Into<String>) {
        self.batch(LogLevel::Step, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.batch(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.batch(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.batch(LogLevel::Error, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.batch(LogLevel::Debug, message);
    }

    pub fn start_task(&self, item_id: &str, title: impl Into<String>) {
        self.emit(PipelineEvent::TaskStarted {
            item_id: item_id.to_string(),
            title: title.into(),
        });
    }

    pub fn task_log(&self, item_id: &str, level: LogLevel, message: impl Into<String>) {
        self.emit(PipelineEvent::TaskLog {
            item_id: item_id.to_string(),
            level,
            message: message.into(),
        });
    }

    pub fn table(&self, item_id: &str, title: impl Into<String>, rows: Vec<(String, String)>) {
        self.emit(PipelineEvent::Table {
            item_id: item_id.to_string(),
            title: title.into(),
            rows,
        });
    }

    pub fn diff_table(&self, item_id: &str, title: impl Into<String>, diffs: Vec<FieldDiff>) {
        self.emit(PipelineEvent::DiffTable {
            item_id: item_id.to_string(),
            title: title.into(),
            diffs,
        });
    }

    pub fn finish_task(&self, item_id: &str, status: TaskStatus, message: impl Into<String>) {
        self.emit(PipelineEvent::TaskFinished {
            item_id: item_id.to_string(),
            status,
            message: message.into(),
        });
    }
}

/// Mirrors every event into `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::RunStateChanged { state } => info!(?state, "run state changed"),
            PipelineEvent::PhaseStarted { phase, items } => info!(%phase, items, "phase started"),
            PipelineEvent::ItemStatusChanged { item_id, status } => {
                debug!(item_id = %item_id, %status, "item status changed")
            }
            PipelineEvent::TaskStarted { item_id, title } => info!(item_id = %item_id, "{title}"),
            PipelineEvent::TaskLog { item_id, level, message } => match level {
                LogLevel::Error => error!(item_id = %item_id, "{message}"),
                LogLevel::Warn => warn!(item_id = %item_id, "{message}"),
                LogLevel::Debug => debug!(item_id = %item_id, "{message}"),
                LogLevel::Step | LogLevel::Info => info!(item_id = %item_id, "{message}"),
            },
            PipelineEvent::Table { item_id, title, rows } => {
                debug!(item_id = %item_id, rows = rows.len(), "{title}")
            }
            PipelineEvent::DiffTable { item_id, title, diffs } => {
                let changed = diffs.iter().filter(|d| d.changed()).count();
                info!(item_id = %item_id, changed, "{title}")
            }
            PipelineEvent::TaskFinished { item_id, status, message } => match status {
                TaskStatus::Error => error!(item_id = %item_id, "{message}"),
                TaskStatus::Warning => warn!(item_id = %item_id, "{message}"),
                _ => info!(item_id = %item_id, "{message}"),
            },
            PipelineEvent::Batch { level, message } => match level {
                LogLevel::Error => error!("{message}"),
                LogLevel::Warn => warn!("{message}"),
                LogLevel::Debug => debug!("{message}"),
                LogLevel::Step | LogLevel::Info => info!("{message}"),
            },
            PipelineEvent::RunFinished { summary } => info!(
                state = ?summary.state,
                done = summary.done,
                errors = summary.errors,
                pending = summary.pending,
                cancelled = summary.cancelled,
                "run finished"
            ),
        }
    }
}

/// Forwards events into an unbounded channel, for consumers living on
/// another task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &PipelineEvent) {
        // a dropped receiver just means nobody is watching any more
        let _ = self.tx.send(event.clone());
    }
}
