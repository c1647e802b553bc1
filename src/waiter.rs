//! Bounded-retry wait primitive
//!
//! Every navigation and element wait in the pipeline goes through one
//! primitive: check a condition up to `max_attempts` times with a finite
//! per-attempt timeout and a non-zero delay between attempts. Exhaustion is
//! an outcome value, not an error, so callers decide what a miss means.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::driver::DriverError;

/// Retry budget for a wait: attempts, per-attempt timeout, delay between
/// attempts.
///
/// Per-attempt timeouts are deliberately single-digit seconds; a wait that
/// needs more than `max_attempts * (per_attempt_timeout + inter_attempt_delay)`
/// is treated as failed rather than blocking the session.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub per_attempt_timeout_ms: u64,
    pub inter_attempt_delay_ms: u64,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            per_attempt_timeout_ms: 5_000,
            inter_attempt_delay_ms: 2_000,
        }
    }
}

impl RetryBudget {
    pub fn new(max_attempts: u32, per_attempt_timeout: Duration, inter_attempt_delay: Duration) -> Self {
        Self {
            max_attempts,
            per_attempt_timeout_ms: per_attempt_timeout.as_millis() as u64,
            inter_attempt_delay_ms: inter_attempt_delay.as_millis() as u64,
        }
    }

    /// Short budget for probes that should answer quickly (login-proof
    /// marker, second-factor prompt).
    pub fn probe() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout_ms: 2_000,
            inter_attempt_delay_ms: 1_000,
        }
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    /// Zero delay would hammer the target; clamp to at least 1ms.
    pub fn inter_attempt_delay(&self) -> Duration {
        Duration::from_millis(self.inter_attempt_delay_ms.max(1))
    }
}

/// Result of a bounded wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition held on some attempt
    Satisfied,
    /// All attempts spent without the condition holding
    Exhausted,
    /// The run-level cancel flag was set between attempts
    Cancelled,
}

impl WaitOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, WaitOutcome::Satisfied)
    }
}

/// Bounded-retry waiter tied to a run-level cancel flag
pub struct PageLoadWaiter {
    budget: RetryBudget,
    cancel: Arc<AtomicBool>,
}

impl PageLoadWaiter {
    pub fn new(budget: RetryBudget, cancel: Arc<AtomicBool>) -> Self {
        Self { budget, cancel }
    }

    /// Run `check` up to the budget's attempt count, returning on the first
    /// satisfied attempt. A check that errors or times out counts as an
    /// unsatisfied attempt; the error never propagates past this boundary.
    pub async fn wait_until<F, Fut>(&self, what: &str, mut check: F) -> WaitOutcome
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<bool, DriverError>> + Send,
    {
        for attempt in 1..=self.budget.max_attempts {
            if self.cancel.load(Ordering::Relaxed) {
                debug!("Wait for {} cancelled on attempt {}", what, attempt);
                return WaitOutcome::Cancelled;
            }

            match tokio::time::timeout(self.budget.per_attempt_timeout(), check()).await {
                Ok(Ok(true)) => {
                    debug!("Wait for {} satisfied on attempt {}/{}", what, attempt, self.budget.max_attempts);
                    return WaitOutcome::Satisfied;
                }
                Ok(Ok(false)) => {
                    debug!("Attempt {}/{} for {}: condition not met", attempt, self.budget.max_attempts, what);
                }
                Ok(Err(e)) => {
                    debug!("Attempt {}/{} for {} errored: {}", attempt, self.budget.max_attempts, what, e);
                }
                Err(_) => {
                    debug!(
                        "Attempt {}/{} for {} timed out after {}ms",
                        attempt, self.budget.max_attempts, what, self.budget.per_attempt_timeout_ms
                    );
                }
            }

            if attempt < self.budget.max_attempts {
                tokio::time::sleep(self.budget.inter_attempt_delay()).await;
            }
        }

        WaitOutcome::Exhausted
    }
}
