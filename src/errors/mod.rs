pub mod handlers;

use thiserror::Error;

use crate::core::queue::QueueStatus;

pub use handlers::RetryPolicy;

/// Top-level error for anything the provisioner does outside the per-item
/// boundary (startup, config, API plumbing).
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Gateway Error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Queue Error: {0}")]
    Queue(#[from] QueueError),

    #[error("Provisioning Error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by a hypervisor gateway implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("VM {vm_id} not found on node {node}")]
    VmNotFound { vm_id: u32, node: String },

    #[error("VM id {vm_id} already exists")]
    VmExists { vm_id: u32 },

    #[error("task {upid} not found")]
    TaskNotFound { upid: String },

    #[error("timed out waiting for {what} after {waited_ms}ms")]
    Timeout { what: String, waited_ms: u64 },

    #[error("storage {storage} unavailable: {message}")]
    Storage { storage: String, message: String },
}

/// Violations of the queue item invariants.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("queue item not found: {id}")]
    NotFound { id: String },

    #[error("queue item {id} already exists")]
    Duplicate { id: String },

    #[error("illegal status transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: QueueStatus,
        to: QueueStatus,
    },

    #[error("queue item {id} already owns vm {current}, refusing to reassign to {requested}")]
    VmIdReassigned {
        id: String,
        current: u32,
        requested: u32,
    },

    #[error("delete item {id} cannot carry {field}")]
    DeleteItemField { id: String, field: &'static str },

    #[error("invalid queue item: {0}")]
    Invalid(String),
}

/// Per-item failures inside the pipeline. These never escape a run; they
/// are converted into an `error` status plus message on the item.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProvisionError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("task {upid} finished with status {exitstatus}")]
    TaskFailed { upid: String, exitstatus: String },

    #[error("VM {vm_id} presence did not become {expected} in time")]
    PresenceTimeout { vm_id: u32, expected: bool },

    #[error("config of VM {vm_id} stayed empty after {attempts} reads")]
    EmptyConfig { vm_id: u32, attempts: u32 },

    #[error(
        "resources did not converge on VM {vm_id}: wanted {want_cores}c/{want_memory}MB, \
         observed {observed_cores:?}c/{observed_memory:?}MB"
    )]
    ConvergenceFailed {
        vm_id: u32,
        want_cores: u32,
        want_memory: u64,
        observed_cores: Option<u32>,
        observed_memory: Option<u64>,
    },

    #[error("invalid target VM id for delete: {0}")]
    InvalidTarget(String),

    #[error("identity patch failed: {0}")]
    Identity(String),

    #[error("ISO provisioning failed: {0}")]
    Iso(String),

    #[error("no name/id could be allocated: {0}")]
    Naming(String),

    #[error("run cancelled")]
    Cancelled,
}

pub type FleetResult<T> = Result<T, FleetError>;
pub type GatewayResult<T> = Result<T, GatewayError>;
pub type ProvisionResult<T> = Result<T, ProvisionError>;
