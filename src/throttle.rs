//! Paced side-effecting actions
//!
//! Sends at most N invitations per run, spacing them with a randomized
//! delay so the traffic never shows a burst pattern. One failed action is
//! recorded and skipped, never fatal to the batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::driver::PageDriver;
use crate::waiter::{PageLoadWaiter, RetryBudget, WaitOutcome};

/// A pending side-effecting action: the control to open, and a label for
/// reporting.
#[derive(Debug, Clone)]
pub struct InviteTarget {
    pub label: String,
    pub open_selector: String,
}

impl InviteTarget {
    pub fn new(label: impl Into<String>, open_selector: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            open_selector: open_selector.into(),
        }
    }
}

/// Outcome of one action. Append-only once processing starts; an action is
/// attempted at most once per run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InviteOutcome {
    Pending,
    Sent,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct InviteResult {
    pub label: String,
    pub outcome: InviteOutcome,
}

/// Throttler configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleConfig {
    /// Process at most this many candidates per run
    pub max_actions: usize,
    /// Confirm control that appears asynchronously after opening an action
    pub confirm_selector: String,
    /// Retry budget for the confirm control's visibility
    pub confirm_budget: RetryBudget,
    /// Randomized pause between actions, drawn uniformly from this range
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_actions: 10,
            confirm_selector: r#"button[aria-label*="Send now"]"#.to_string(),
            confirm_budget: RetryBudget::new(
                5,
                Duration::from_secs(2),
                Duration::from_millis(500),
            ),
            delay_min_ms: 5_000,
            delay_max_ms: 15_000,
        }
    }
}

impl ThrottleConfig {
    fn pacing_delay(&self) -> Duration {
        let lo = self.delay_min_ms.min(self.delay_max_ms);
        let hi = self.delay_min_ms.max(self.delay_max_ms);
        let ms = if lo == hi {
            lo
        } else {
            rand::thread_rng().gen_range(lo..=hi)
        };
        Duration::from_millis(ms)
    }
}

/// Executes a bounded list of invite actions against live targets
pub struct ActionThrottler {
    config: ThrottleConfig,
    cancel: Arc<AtomicBool>,
}

impl ActionThrottler {
    pub fn new(config: ThrottleConfig, cancel: Arc<AtomicBool>) -> Self {
        Self { config, cancel }
    }

    /// Process at most `max_actions` candidates in input order. Every
    /// candidate gets exactly one attempt; failures are recorded and the
    /// batch continues. Candidates past the cap, or remaining when the
    /// cancel flag goes up, stay `Pending`.
    pub async fn run(&self, driver: &dyn PageDriver, targets: &[InviteTarget]) -> Vec<InviteResult> {
        let mut results: Vec<InviteResult> = targets
            .iter()
            .map(|t| InviteResult {
                label: t.label.clone(),
                outcome: InviteOutcome::Pending,
            })
            .collect();

        let cap = self.config.max_actions.min(targets.len());
        info!("Processing {} of {} invite candidates", cap, targets.len());

        for (idx, target) in targets.iter().take(cap).enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Invite batch cancelled after {} actions", idx);
                break;
            }

            match self.send_one(driver, target).await {
                Ok(()) => {
                    info!("Invite sent: {}", target.label);
                    results[idx].outcome = InviteOutcome::Sent;
                }
                Err(reason) => {
                    warn!("Invite failed for {}: {}", target.label, reason);
                    results[idx].outcome = InviteOutcome::Failed(reason);
                }
            }

            // Pace before the next candidate, even after a failure
            if idx + 1 < cap && !self.cancel.load(Ordering::Relaxed) {
                let delay = self.config.pacing_delay();
                debug!("Pacing {}ms before next invite", delay.as_millis());
                tokio::time::sleep(delay).await;
            }
        }

        results
    }

    /// Two-step interaction: open the action control, wait for the confirm
    /// control to become visible, confirm.
    async fn send_one(&self, driver: &dyn PageDriver, target: &InviteTarget) -> Result<(), String> {
        driver
            .click(&target.open_selector)
            .await
            .map_err(|e| format!("open control: {}", e))?;

        let waiter = PageLoadWaiter::new(self.config.confirm_budget.clone(), self.cancel.clone());
        let confirm = self.config.confirm_selector.clone();
        let outcome = waiter
            .wait_until("confirm control", || driver.is_present(&confirm))
            .await;

        match outcome {
            WaitOutcome::Satisfied => {}
            WaitOutcome::Exhausted => return Err("confirm control never appeared".to_string()),
            WaitOutcome::Cancelled => return Err("cancelled before confirmation".to_string()),
        }

        driver
            .click(&self.config.confirm_selector)
            .await
            .map_err(|e| format!("confirm control: {}", e))?;

        Ok(())
    }
}
