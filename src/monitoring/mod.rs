pub mod events;
pub mod tracker;

pub use events::{
    ChannelSink, EventBus, EventSink, FieldDiff, LogLevel, Phase, PipelineEvent, RunState,
    TaskStatus, TracingSink,
};
pub use tracker::{TaskRecord, TaskTracker};
