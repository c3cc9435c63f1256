use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Fixed-interval retry budget used by every polling loop in the pipeline
/// (config reads, convergence checks, presence and task waits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Budget that polls every `interval` until `timeout` has elapsed.
    pub fn from_timeout(timeout: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let attempts = (timeout.as_millis() / interval_ms).max(1);
        Self::new(u32::try_from(attempts).unwrap_or(u32::MAX), interval)
    }

    /// A single attempt, no waiting.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn timeout(&self) -> Duration {
        self.interval * self.max_attempts
    }

    /// Polls `probe` until it yields `Some`, sleeping `interval` between
    /// attempts. Returns the value and the attempt count that produced it,
    /// or `None` once the budget is spent.
    pub async fn poll<T, F, Fut>(&self, what: &str, mut probe: F) -> Option<(T, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in 1..=self.max_attempts {
            if let Some(value) = probe(attempt).await {
                if attempt > 1 {
                    debug!(what, attempt, "poll settled after retries");
                }
                return Some((value, attempt));
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        warn!(what, attempts = self.max_attempts, "poll budget exhausted");
        None
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(1))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
