pub mod gateway;
pub mod queue;
pub mod simulator;

// exports for the common stuff
pub use gateway::{HypervisorGateway, Upid, VmConfig};
pub use queue::{InMemoryQueueStore, ItemUpdate, QueueAction, QueueItem, QueueStatus, QueueStore};
pub use simulator::{CallCounts, SimulatedCluster};
