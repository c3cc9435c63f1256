pub mod context;
pub mod convergence;
pub mod identity;
pub mod iso;
pub mod naming;
pub mod pipeline;
pub mod resources;
pub mod storage;

pub use context::{CancellationFlag, RunContext};
pub use convergence::{ConvergenceReport, ConvergenceTarget, ConvergenceVerifier};
pub use identity::{IdentityPatch, IdentityPatcher, SequentialIdentityPatcher};
pub use iso::{CloudInitPayloadBuilder, IsoPayload, IsoProvisioner, IsoRequest};
pub use naming::{Allocation, NamingAllocator};
pub use pipeline::{ItemFailure, ProvisioningPipeline, RunSummary};
pub use resources::{ResourcePlanner, ResourcePreset, TemplateSnapshot};
pub use storage::{StorageAllocator, StorageAssignment, StorageRequest, StorageStats, GIB};
