use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Settings;
use crate::core::gateway::HypervisorGateway;
use crate::core::queue::QueueStore;
use crate::monitoring::EventBus;

use super::identity::IdentityPatcher;
use super::iso::IsoProvisioner;

/// Shared stop request. Checked before every item and between sub-steps;
/// a remote call already in flight always finishes first.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears a previous request so the next run starts fresh.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Everything one pipeline run works with. Built once per run and owned by
/// the pipeline; nothing here is global.
#[derive(Clone)]
pub struct RunContext {
    pub store: Arc<dyn QueueStore>,
    pub gateway: Arc<dyn HypervisorGateway>,
    pub settings: Arc<Settings>,
    pub cancel: CancellationFlag,
    pub events: EventBus,
    pub identity: Arc<dyn IdentityPatcher>,
    pub iso: Arc<dyn IsoProvisioner>,
}

impl RunContext {
    pub fn node(&self) -> &str {
        &self.settings.hypervisor.node
    }
}
