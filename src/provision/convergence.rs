use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::gateway::{config_u32, config_u64, VmConfig};
use crate::errors::{GatewayResult, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceTarget {
    pub cores: u32,
    pub memory: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub ok: bool,
    pub observed_cores: Option<u32>,
    pub observed_memory: Option<u64>,
    pub attempts: u32,
}

/// Polls a VM's config until cores and memory both match, or the budget
/// runs out. A timeout is a `ok: false` report, not an error.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceVerifier {
    policy: RetryPolicy,
}

impl ConvergenceVerifier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn verify<F, Fut>(&self, target: ConvergenceTarget, mut read: F) -> ConvergenceReport
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<VmConfig>>,
    {
        let mut report = ConvergenceReport {
            ok: false,
            observed_cores: None,
            observed_memory: None,
            attempts: 0,
        };

        for attempt in 1..=self.policy.max_attempts {
            report.attempts = attempt;
            match read().await {
                Ok(config) => {
                    report.observed_cores = config_u32(&config, "cores");
                    report.observed_memory = config_u64(&config, "memory");
                    if report.observed_cores == Some(target.cores)
                        && report.observed_memory == Some(target.memory)
                    {
                        report.ok = true;
                        debug!(attempt, "resources converged");
                        return report;
                    }
                }
                Err(e) => debug!(attempt, error = %e, "config read failed during convergence check"),
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        warn!(
            want_cores = target.cores,
            want_memory = target.memory,
            observed_cores = ?report.observed_cores,
            observed_memory = ?report.observed_memory,
            attempts = report.attempts,
            "resources did not converge"
        );
        report
    }
}
