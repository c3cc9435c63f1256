pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod monitoring;
pub mod provision;

// Re-exports
pub use api::{create_router, AppState};
pub use core::{HypervisorGateway, InMemoryQueueStore, QueueItem, QueueStore, SimulatedCluster};
pub use errors::{FleetError, FleetResult};
pub use provision::{ProvisioningPipeline, RunContext, RunSummary};
