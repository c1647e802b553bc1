//! Per-session pipeline
//!
//! One account's full run: authenticate, load the search page, snapshot and
//! extract records, write the batch to CSV, then optionally send a bounded
//! invite batch. The browser is torn down on every exit path, including
//! failures.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::driver::PageDriver;
use crate::extract::{ExtractorConfig, RecordExtractor};
use crate::inbox::SecondFactorSource;
use crate::login::{LoginConfig, LoginState, LoginStateMachine};
use crate::output::write_records;
use crate::store::SessionStore;
use crate::throttle::{ActionThrottler, InviteResult, InviteTarget, ThrottleConfig};
use crate::waiter::{PageLoadWaiter, RetryBudget, WaitOutcome};

/// One account to run: identity (login email), password and the search page
/// to harvest.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    pub password: String,
    pub search_url: String,
}

/// Terminal outcome of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Pipeline ran to completion; the count covers records written to CSV
    Completed { records_written: usize },
    /// Authentication ended in a `Failed` state
    LoginFailed(String),
    /// Authenticated, but a later pipeline step failed
    PipelineError(String),
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub identity: String,
    pub outcome: SessionOutcome,
    pub invites: Vec<InviteResult>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Completed { .. })
    }
}

/// Everything a session run needs besides the account itself
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    pub login: LoginConfig,
    pub extractor: ExtractorConfig,
    pub throttle: ThrottleConfig,
    /// Budget for the search page settling after navigation
    pub page_load_budget: RetryBudget,
    /// Directory receiving one CSV per identity
    pub output_dir: PathBuf,
    /// Whether to run the invite batch after extraction
    pub send_invites: bool,
    /// Invite control within the n-th result item; `{index}` is replaced
    /// with the 1-based item position
    pub invite_open_template: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            login: LoginConfig::default(),
            extractor: ExtractorConfig::default(),
            throttle: ThrottleConfig::default(),
            page_load_budget: RetryBudget::default(),
            output_dir: PathBuf::from("output"),
            send_invites: false,
            invite_open_template:
                "ul.reusable-search__entity-result-list > li:nth-child({index}) button.artdeco-button"
                    .to_string(),
        }
    }
}

impl RunnerConfig {
    fn csv_path(&self, identity: &str) -> PathBuf {
        let sanitized: String = identity
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.output_dir.join(format!("{}.csv", sanitized))
    }
}

/// Runs the authenticate-extract-invite pipeline for one account
pub struct SessionRunner {
    config: RunnerConfig,
    cancel: Arc<AtomicBool>,
}

impl SessionRunner {
    pub fn new(config: RunnerConfig, cancel: Arc<AtomicBool>) -> Self {
        Self { config, cancel }
    }

    /// Run the pipeline to a [`SessionReport`]. The driver is closed before
    /// returning, whatever the outcome.
    pub async fn run(
        &self,
        driver: &dyn PageDriver,
        store: &dyn SessionStore,
        account: &Account,
        code_source: Option<&dyn SecondFactorSource>,
    ) -> SessionReport {
        let report = self.run_inner(driver, store, account, code_source).await;

        if let Err(e) = driver.close().await {
            warn!("Session {}: browser teardown failed: {}", account.email, e);
        }

        match &report.outcome {
            SessionOutcome::Completed { records_written } => {
                info!("Session {} completed, {} records", account.email, records_written)
            }
            SessionOutcome::LoginFailed(reason) => {
                error!("Session {} login failed: {}", account.email, reason)
            }
            SessionOutcome::PipelineError(reason) => {
                error!("Session {} pipeline failed: {}", account.email, reason)
            }
        }

        report
    }

    async fn run_inner(
        &self,
        driver: &dyn PageDriver,
        store: &dyn SessionStore,
        account: &Account,
        code_source: Option<&dyn SecondFactorSource>,
    ) -> SessionReport {
        let mut machine =
            LoginStateMachine::new(self.config.login.clone(), &account.email, self.cancel.clone());
        let state = machine.run(driver, store, &account.password, code_source).await;

        match state {
            LoginState::Authenticated => {}
            LoginState::Failed(reason) => {
                return SessionReport {
                    identity: account.email.clone(),
                    outcome: SessionOutcome::LoginFailed(reason),
                    invites: Vec::new(),
                };
            }
            other => {
                // The state machine only returns terminal states; anything
                // else is a bug worth surfacing loudly.
                return SessionReport {
                    identity: account.email.clone(),
                    outcome: SessionOutcome::LoginFailed(format!("non-terminal state {}", other)),
                    invites: Vec::new(),
                };
            }
        }

        match self.extract_and_invite(driver, account).await {
            Ok((records_written, invites)) => SessionReport {
                identity: account.email.clone(),
                outcome: SessionOutcome::Completed { records_written },
                invites,
            },
            Err(reason) => SessionReport {
                identity: account.email.clone(),
                outcome: SessionOutcome::PipelineError(reason),
                invites: Vec::new(),
            },
        }
    }

    async fn extract_and_invite(
        &self,
        driver: &dyn PageDriver,
        account: &Account,
    ) -> Result<(usize, Vec<InviteResult>), String> {
        driver
            .navigate(&account.search_url)
            .await
            .map_err(|e| format!("search navigation: {}", e))?;

        // Let the navigation settle; a timeout here only means the results
        // probe below starts against a still-loading page.
        if let Err(e) = driver
            .wait_for_load(self.config.page_load_budget.per_attempt_timeout())
            .await
        {
            warn!("Session {}: search page load wait: {}", account.email, e);
        }

        // A slow page is snapshotted anyway once the budget runs out; the
        // extractor copes with whatever rendered.
        let waiter = PageLoadWaiter::new(self.config.page_load_budget.clone(), self.cancel.clone());
        let container = self.config.extractor.container_selector.clone();
        let loaded = waiter
            .wait_until("search results", || driver.is_present(&container))
            .await;
        if loaded == WaitOutcome::Cancelled {
            return Err("cancelled while loading search results".to_string());
        }
        if loaded == WaitOutcome::Exhausted {
            warn!("Session {}: results container not seen, snapshotting anyway", account.email);
        }

        if let Err(e) = driver.scroll_to_bottom().await {
            warn!("Session {}: scroll failed: {}", account.email, e);
        }

        let html = driver.content().await.map_err(|e| format!("snapshot: {}", e))?;

        let extractor = RecordExtractor::new(&self.config.extractor)
            .map_err(|e| format!("extractor config: {}", e))?;
        let records = extractor.extract(&html);
        info!("Session {}: extracted {} records", account.email, records.len());

        let csv_path = self.config.csv_path(&account.email);
        write_records(&csv_path, &records).map_err(|e| format!("csv output: {}", e))?;

        let invites = if self.config.send_invites && !records.is_empty() {
            // Address invite buttons by the record's DOM slot, not its
            // position in the compressed record list: a dropped nameless
            // item shifts the two apart.
            let targets: Vec<InviteTarget> = records
                .iter()
                .map(|r| {
                    let open = self
                        .config
                        .invite_open_template
                        .replace("{index}", &r.item_index.to_string());
                    InviteTarget::new(r.name.clone(), open)
                })
                .collect();

            let throttler = ActionThrottler::new(self.config.throttle.clone(), self.cancel.clone());
            throttler.run(driver, &targets).await
        } else {
            Vec::new()
        };

        Ok((records.len(), invites))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::store::MemorySessionStore;
    use crate::throttle::InviteOutcome;

    const PROOF: &str = "#global-nav-search";
    const CONTAINER: &str = "div.search-results-container";

    fn account() -> Account {
        Account {
            email: "jane@example.com".to_string(),
            password: "pw".to_string(),
            search_url: "https://www.linkedin.com/search/results/people/?keywords=rust".to_string(),
        }
    }

    fn fast_budget() -> RetryBudget {
        RetryBudget {
            max_attempts: 2,
            per_attempt_timeout_ms: 50,
            inter_attempt_delay_ms: 1,
        }
    }

    fn fast_config(output_dir: PathBuf) -> RunnerConfig {
        let mut login = LoginConfig::default();
        login.proof_budget = fast_budget();
        login.probe_budget = fast_budget();
        login.per_char_delay_ms = 0;

        let mut throttle = ThrottleConfig::default();
        throttle.confirm_budget = fast_budget();
        throttle.delay_min_ms = 1;
        throttle.delay_max_ms = 2;

        RunnerConfig {
            login,
            throttle,
            page_load_budget: fast_budget(),
            output_dir,
            ..RunnerConfig::default()
        }
    }

    fn results_page() -> String {
        r#"<html><body><div class="search-results-container">
           <ul class="reusable-search__entity-result-list">
             <li><span class="entity-result__title-text">Jane Doe</span>
                 <div class="entity-result__primary-subtitle">Engineer</div>
                 <div class="entity-result__secondary-subtitle">Berlin</div>
                 <a class="app-aware-link" href="/in/jane">p</a></li>
             <li><span class="entity-result__title-text">John Roe</span>
                 <div class="entity-result__primary-subtitle">Designer</div>
                 <div class="entity-result__secondary-subtitle">Lisbon</div>
                 <a class="app-aware-link" href="/in/john">p</a></li>
           </ul></div></body></html>"#
            .to_string()
    }

    fn authenticated_driver() -> MockDriver {
        MockDriver::new()
            .with_present(&[PROOF, CONTAINER])
            .with_html(&results_page())
    }

    async fn store_with_session() -> MemorySessionStore {
        use crate::driver::Cookie;
        use crate::store::{SessionCredential, SessionStore};
        let store = MemorySessionStore::new("linkreach");
        let cred = SessionCredential::new(
            vec![Cookie::new("li_at", "cached", ".linkedin.com")],
            std::time::Duration::from_secs(3600),
        );
        store.set("jane@example.com", cred).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_full_pipeline_writes_csv_and_closes_driver() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_session().await;
        let driver = authenticated_driver();

        let runner = SessionRunner::new(
            fast_config(dir.path().to_path_buf()),
            Arc::new(AtomicBool::new(false)),
        );
        let report = runner.run(&driver, &store, &account(), None).await;

        assert_eq!(report.outcome, SessionOutcome::Completed { records_written: 2 });
        assert!(driver.is_closed());

        let csv = std::fs::read_to_string(dir.path().join("jane_example.com.csv")).unwrap();
        assert!(csv.starts_with("name,headline,location,profile_link"));
        assert!(csv.contains("Jane Doe,Engineer,Berlin,/in/jane"));
    }

    #[tokio::test]
    async fn test_login_failure_closes_driver_and_skips_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemorySessionStore::new("linkreach");
        // No login form, no proof: login cannot progress
        let driver = MockDriver::new();

        let runner = SessionRunner::new(
            fast_config(dir.path().to_path_buf()),
            Arc::new(AtomicBool::new(false)),
        );
        let report = runner.run(&driver, &store, &account(), None).await;

        assert_eq!(
            report.outcome,
            SessionOutcome::LoginFailed("login-timeout".to_string())
        );
        assert!(driver.is_closed());
        assert!(!dir.path().join("jane_example.com.csv").exists());
    }

    #[tokio::test]
    async fn test_slow_results_page_is_snapshotted_anyway() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_session().await;
        // Proof present but no results container; the snapshot has no
        // records either.
        let driver = MockDriver::new()
            .with_present(&[PROOF])
            .with_html("<html><body></body></html>");

        let runner = SessionRunner::new(
            fast_config(dir.path().to_path_buf()),
            Arc::new(AtomicBool::new(false)),
        );
        let report = runner.run(&driver, &store, &account(), None).await;

        assert_eq!(report.outcome, SessionOutcome::Completed { records_written: 0 });
        // Empty batch still produced a well-formed file
        let csv = std::fs::read_to_string(dir.path().join("jane_example.com.csv")).unwrap();
        assert_eq!(csv.trim(), "name,headline,location,profile_link");
    }

    #[tokio::test]
    async fn test_invite_batch_runs_after_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_session().await;

        let mut config = fast_config(dir.path().to_path_buf());
        config.send_invites = true;
        config.invite_open_template = "li:nth-child({index}) button.invite".to_string();

        let confirm = config.throttle.confirm_selector.clone();
        let driver = authenticated_driver()
            .appear_on_click("li:nth-child(1) button.invite", &[confirm.as_str()])
            .appear_on_click("li:nth-child(2) button.invite", &[confirm.as_str()])
            .vanish_on_click(&confirm, &[confirm.as_str()]);

        let runner = SessionRunner::new(config, Arc::new(AtomicBool::new(false)));
        let report = runner.run(&driver, &store, &account(), None).await;

        assert_eq!(report.outcome, SessionOutcome::Completed { records_written: 2 });
        assert_eq!(report.invites.len(), 2);
        assert!(report.invites.iter().all(|r| r.outcome == InviteOutcome::Sent));
        assert_eq!(report.invites[0].label, "Jane Doe");
    }

    #[tokio::test]
    async fn test_invites_follow_dom_slots_past_a_dropped_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_session().await;

        let mut config = fast_config(dir.path().to_path_buf());
        config.send_invites = true;
        config.invite_open_template = "li:nth-child({index}) button.invite".to_string();

        // Middle item has no name and is dropped by the extractor, but its
        // <li> still exists; Carol's invite button lives in slot 3.
        let html = r#"<html><body><div class="search-results-container">
           <ul class="reusable-search__entity-result-list">
             <li><span class="entity-result__title-text">Jane Doe</span></li>
             <li><div class="entity-result__primary-subtitle">Ghost</div></li>
             <li><span class="entity-result__title-text">Carol Poe</span></li>
           </ul></div></body></html>"#;

        let confirm = config.throttle.confirm_selector.clone();
        let driver = MockDriver::new()
            .with_present(&[PROOF, CONTAINER])
            .with_html(html)
            .appear_on_click("li:nth-child(1) button.invite", &[confirm.as_str()])
            .appear_on_click("li:nth-child(3) button.invite", &[confirm.as_str()])
            .vanish_on_click(&confirm, &[confirm.as_str()]);

        let runner = SessionRunner::new(config, Arc::new(AtomicBool::new(false)));
        let report = runner.run(&driver, &store, &account(), None).await;

        assert_eq!(report.outcome, SessionOutcome::Completed { records_written: 2 });
        assert_eq!(report.invites.len(), 2);
        assert!(report.invites.iter().all(|r| r.outcome == InviteOutcome::Sent));
        assert_eq!(report.invites[1].label, "Carol Poe");

        let clicks = driver.clicks();
        assert!(clicks.contains(&"li:nth-child(1) button.invite".to_string()));
        assert!(clicks.contains(&"li:nth-child(3) button.invite".to_string()));
        // The dropped item's slot is never touched
        assert!(!clicks.iter().any(|c| c.contains("nth-child(2)")));
    }
}
