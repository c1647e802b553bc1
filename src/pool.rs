//! Concurrent session pool
//!
//! Runs one pipeline per account with bounded parallelism. Sessions are
//! fully isolated: each gets its own browser, and one session failing (or
//! panicking) never blocks its siblings.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::driver::{ChromiumDriver, DriverConfig, DriverError, PageDriver};
use crate::inbox::SecondFactorSource;
use crate::runner::{Account, RunnerConfig, SessionOutcome, SessionReport, SessionRunner};
use crate::store::SessionStore;

/// Creates one browser session per account
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self, session_id: &str) -> Result<Box<dyn PageDriver>, DriverError>;
}

/// Launches real Chrome instances, one isolated profile per session
pub struct ChromiumFactory {
    headless: bool,
    chrome_path: Option<String>,
}

impl ChromiumFactory {
    pub fn new(headless: bool, chrome_path: Option<String>) -> Self {
        Self { headless, chrome_path }
    }
}

#[async_trait]
impl DriverFactory for ChromiumFactory {
    async fn create(&self, session_id: &str) -> Result<Box<dyn PageDriver>, DriverError> {
        let config = DriverConfig::for_session(session_id)
            .headless(self.headless)
            .chrome_path(self.chrome_path.clone());
        let driver = ChromiumDriver::launch(session_id, config).await?;
        Ok(Box::new(driver))
    }
}

/// Pool configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// At most this many sessions run at once
    pub concurrent_sessions: usize,
    pub runner: RunnerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrent_sessions: 2,
            runner: RunnerConfig::default(),
        }
    }
}

/// Runs a batch of accounts with bounded concurrency and aggregates their
/// reports.
pub struct WorkerPool {
    config: PoolConfig,
    cancel: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, cancel: Arc<AtomicBool>) -> Self {
        Self { config, cancel }
    }

    /// Run every account to completion and return one report per account
    /// started. Duplicate identities within the batch are skipped with a
    /// warning; only the first occurrence runs.
    pub async fn run(
        &self,
        factory: Arc<dyn DriverFactory>,
        store: Arc<dyn SessionStore>,
        accounts: Vec<Account>,
        code_source: Option<Arc<dyn SecondFactorSource>>,
    ) -> Vec<SessionReport> {
        let mut seen = HashSet::new();
        let accounts: Vec<Account> = accounts
            .into_iter()
            .filter(|a| {
                if seen.insert(a.email.clone()) {
                    true
                } else {
                    warn!("Duplicate account {} in batch, skipping", a.email);
                    false
                }
            })
            .collect();

        let permits = self.config.concurrent_sessions.max(1);
        info!("Starting {} sessions ({} at a time)", accounts.len(), permits);

        let semaphore = Arc::new(Semaphore::new(permits));
        let mut handles = Vec::with_capacity(accounts.len());

        for account in accounts {
            let semaphore = semaphore.clone();
            let factory = factory.clone();
            let store = store.clone();
            let code_source = code_source.clone();
            let runner_config = self.config.runner.clone();
            let cancel = self.cancel.clone();

            handles.push(tokio::spawn(async move {
                // Closing the semaphore is not part of this flow, so acquire
                // cannot fail while the pool is running.
                let _permit = match semaphore.acquire().await {
                    Ok(p) => p,
                    Err(_) => {
                        return SessionReport {
                            identity: account.email.clone(),
                            outcome: SessionOutcome::PipelineError("pool shut down".to_string()),
                            invites: Vec::new(),
                        }
                    }
                };

                if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                    return SessionReport {
                        identity: account.email.clone(),
                        outcome: SessionOutcome::PipelineError("cancelled before start".to_string()),
                        invites: Vec::new(),
                    };
                }

                let driver = match factory.create(&account.email).await {
                    Ok(d) => d,
                    Err(e) => {
                        error!("Session {} could not launch a browser: {}", account.email, e);
                        return SessionReport {
                            identity: account.email.clone(),
                            outcome: SessionOutcome::PipelineError(format!("browser launch: {}", e)),
                            invites: Vec::new(),
                        };
                    }
                };

                let runner = SessionRunner::new(runner_config, cancel);
                runner
                    .run(
                        driver.as_ref(),
                        store.as_ref(),
                        &account,
                        code_source.as_deref(),
                    )
                    .await
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for result in join_all(handles).await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    // A panicked session must not take the batch down
                    error!("Session task panicked: {}", e);
                    reports.push(SessionReport {
                        identity: "<unknown>".to_string(),
                        outcome: SessionOutcome::PipelineError(format!("session task panicked: {}", e)),
                        invites: Vec::new(),
                    });
                }
            }
        }

        let succeeded = reports.iter().filter(|r| r.is_success()).count();
        info!("Batch finished: {}/{} sessions succeeded", succeeded, reports.len());

        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::login::LoginConfig;
    use crate::store::MemorySessionStore;
    use crate::throttle::ThrottleConfig;
    use crate::waiter::RetryBudget;
    use std::sync::Mutex;

    const PROOF: &str = "#global-nav-search";
    const CONTAINER: &str = "div.search-results-container";

    fn fast_budget() -> RetryBudget {
        RetryBudget {
            max_attempts: 2,
            per_attempt_timeout_ms: 50,
            inter_attempt_delay_ms: 1,
        }
    }

    fn pool_config(output_dir: std::path::PathBuf, concurrent: usize) -> PoolConfig {
        let mut login = LoginConfig::default();
        login.proof_budget = fast_budget();
        login.probe_budget = fast_budget();
        login.per_char_delay_ms = 0;

        let mut throttle = ThrottleConfig::default();
        throttle.confirm_budget = fast_budget();
        throttle.delay_min_ms = 1;
        throttle.delay_max_ms = 2;

        PoolConfig {
            concurrent_sessions: concurrent,
            runner: RunnerConfig {
                login,
                throttle,
                page_load_budget: fast_budget(),
                output_dir,
                ..RunnerConfig::default()
            },
        }
    }

    fn account(email: &str) -> Account {
        Account {
            email: email.to_string(),
            password: "pw".to_string(),
            search_url: "https://example.com/search".to_string(),
        }
    }

    fn results_page(name: &str) -> String {
        format!(
            r#"<html><body><div class="search-results-container">
               <ul class="reusable-search__entity-result-list">
                 <li><span class="entity-result__title-text">{}</span></li>
               </ul></div></body></html>"#,
            name
        )
    }

    /// Hands each session a pre-scripted mock, in order; identities with no
    /// script get a launch failure.
    struct ScriptedFactory {
        drivers: Mutex<std::collections::HashMap<String, MockDriver>>,
    }

    impl ScriptedFactory {
        fn new(drivers: Vec<(&str, MockDriver)>) -> Self {
            Self {
                drivers: Mutex::new(
                    drivers.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl DriverFactory for ScriptedFactory {
        async fn create(&self, session_id: &str) -> Result<Box<dyn PageDriver>, DriverError> {
            self.drivers
                .lock()
                .unwrap()
                .remove(session_id)
                .map(|d| Box::new(d) as Box<dyn PageDriver>)
                .ok_or_else(|| DriverError::LaunchFailed(format!("no driver for {}", session_id)))
        }
    }

    fn working_driver(name: &str) -> MockDriver {
        MockDriver::new()
            .with_present(&[PROOF, CONTAINER, "input#username", "input#password"])
            .with_html(&results_page(name))
    }

    #[tokio::test]
    async fn test_failed_session_does_not_block_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::new(vec![
            ("a@example.com", working_driver("Alice")),
            // No login form, no proof: this session fails at login
            ("b@example.com", MockDriver::new()),
            ("c@example.com", working_driver("Carol")),
        ]));
        let store = Arc::new(MemorySessionStore::new("linkreach"));

        let pool = WorkerPool::new(
            pool_config(dir.path().to_path_buf(), 3),
            Arc::new(AtomicBool::new(false)),
        );
        let reports = pool
            .run(
                factory,
                store,
                vec![account("a@example.com"), account("b@example.com"), account("c@example.com")],
                None,
            )
            .await;

        assert_eq!(reports.len(), 3);
        let by_identity: std::collections::HashMap<&str, &SessionReport> =
            reports.iter().map(|r| (r.identity.as_str(), r)).collect();

        assert!(by_identity["a@example.com"].is_success());
        assert!(by_identity["c@example.com"].is_success());
        assert_eq!(
            by_identity["b@example.com"].outcome,
            SessionOutcome::LoginFailed("login-timeout".to_string())
        );
    }

    #[tokio::test]
    async fn test_duplicate_identity_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        // Only one scripted driver: a second create() for the same identity
        // would fail, so a passing run proves the duplicate never started.
        let factory = Arc::new(ScriptedFactory::new(vec![(
            "a@example.com",
            working_driver("Alice"),
        )]));
        let store = Arc::new(MemorySessionStore::new("linkreach"));

        let pool = WorkerPool::new(
            pool_config(dir.path().to_path_buf(), 2),
            Arc::new(AtomicBool::new(false)),
        );
        let reports = pool
            .run(
                factory,
                store,
                vec![account("a@example.com"), account("a@example.com")],
                None,
            )
            .await;

        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_success());
    }

    #[tokio::test]
    async fn test_launch_failure_is_a_report_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::new(vec![]));
        let store = Arc::new(MemorySessionStore::new("linkreach"));

        let pool = WorkerPool::new(
            pool_config(dir.path().to_path_buf(), 1),
            Arc::new(AtomicBool::new(false)),
        );
        let reports = pool.run(factory, store, vec![account("a@example.com")], None).await;

        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].outcome, SessionOutcome::PipelineError(_)));
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(ScriptedFactory::new(vec![(
            "a@example.com",
            working_driver("Alice"),
        )]));
        let store = Arc::new(MemorySessionStore::new("linkreach"));

        let pool = WorkerPool::new(
            pool_config(dir.path().to_path_buf(), 1),
            Arc::new(AtomicBool::new(true)),
        );
        let reports = pool.run(factory, store, vec![account("a@example.com")], None).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].outcome,
            SessionOutcome::PipelineError("cancelled before start".to_string())
        );
    }
}
