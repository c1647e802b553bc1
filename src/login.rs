//! Login state machine
//!
//! Reaches `Authenticated` for one account, preferring a cached session
//! over interactive credential submission. Transitions are forward-only:
//!
//! ```text
//! Unauthenticated -> RestoringSession ----------> Authenticated
//!        |                  |                          ^
//!        v                  v (stale/invalid)          |
//! SubmittingCredentials -> AwaitingSecondFactor -------+
//!        |                  |
//!        v                  v
//!     Failed(reason)     Failed(reason)
//! ```
//!
//! A restored session is only trusted after the login-proof marker is
//! observed; a page that loads without it falls back to a fresh credential
//! login and evicts the stale cookie set. `Authenticated` is never set
//! except after a passing proof check.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::driver::PageDriver;
use crate::inbox::SecondFactorSource;
use crate::store::{SessionCredential, SessionStore, DEFAULT_SESSION_TTL};
use crate::waiter::{PageLoadWaiter, RetryBudget, WaitOutcome};

/// Authentication state of one account session. Exactly one is active at a
/// time; `Authenticated` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Unauthenticated,
    RestoringSession,
    SubmittingCredentials,
    AwaitingSecondFactor,
    Authenticated,
    Failed(String),
}

impl LoginState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoginState::Authenticated | LoginState::Failed(_))
    }
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginState::Unauthenticated => write!(f, "unauthenticated"),
            LoginState::RestoringSession => write!(f, "restoring-session"),
            LoginState::SubmittingCredentials => write!(f, "submitting-credentials"),
            LoginState::AwaitingSecondFactor => write!(f, "awaiting-second-factor"),
            LoginState::Authenticated => write!(f, "authenticated"),
            LoginState::Failed(reason) => write!(f, "failed({})", reason),
        }
    }
}

/// Locators for the credential form
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginSelectors {
    pub username: String,
    pub password: String,
    pub submit: String,
}

/// Locators for the emailed-PIN challenge
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondFactorSelectors {
    /// Present only when the site asks for a code
    pub prompt: String,
    pub input: String,
    pub submit: String,
}

/// One login flow definition: URLs, form locators and the login-proof
/// marker. All call sites share this one parameterized flow.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginConfig {
    /// Site root, navigated to before applying cached cookies
    pub base_url: String,
    pub login_url: String,
    /// Known post-authentication destination
    pub landmark_url: String,
    pub selectors: LoginSelectors,
    /// Element only present when authenticated; gates both fresh and
    /// restored sessions
    pub proof_selector: String,
    pub second_factor: SecondFactorSelectors,
    /// Per-character typing delay in milliseconds (human-plausible input;
    /// a pacing option, not a correctness requirement)
    pub per_char_delay_ms: u64,
    /// TTL stamped on a freshly persisted session
    pub session_ttl_secs: u64,
    /// Budget for landmark/proof waits
    pub proof_budget: RetryBudget,
    /// Short budget for probing whether the second-factor prompt appeared
    pub probe_budget: RetryBudget,
    /// Poll attempts for the second-factor code before giving up
    pub second_factor_attempts: u32,
    pub second_factor_poll_delay_ms: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.linkedin.com".to_string(),
            login_url: "https://www.linkedin.com/login".to_string(),
            landmark_url: "https://www.linkedin.com/feed/".to_string(),
            selectors: LoginSelectors {
                username: "input#username".to_string(),
                password: "input#password".to_string(),
                submit: r#"button[type="submit"]"#.to_string(),
            },
            proof_selector: "#global-nav-search".to_string(),
            second_factor: SecondFactorSelectors {
                prompt: "#input__email_verification_pin".to_string(),
                input: "#input__email_verification_pin".to_string(),
                submit: "#email-pin-submit-button".to_string(),
            },
            per_char_delay_ms: 120,
            session_ttl_secs: DEFAULT_SESSION_TTL.as_secs(),
            proof_budget: RetryBudget::default(),
            probe_budget: RetryBudget::probe(),
            second_factor_attempts: 10,
            second_factor_poll_delay_ms: 3_000,
        }
    }
}

impl LoginConfig {
    fn per_char_delay(&self) -> Duration {
        Duration::from_millis(self.per_char_delay_ms)
    }

    fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Drives one account from `Unauthenticated` to a terminal state.
pub struct LoginStateMachine {
    config: LoginConfig,
    identity: String,
    state: LoginState,
    cancel: Arc<AtomicBool>,
}

impl LoginStateMachine {
    pub fn new(config: LoginConfig, identity: &str, cancel: Arc<AtomicBool>) -> Self {
        Self {
            config,
            identity: identity.to_string(),
            state: LoginState::Unauthenticated,
            cancel,
        }
    }

    pub fn state(&self) -> &LoginState {
        &self.state
    }

    fn transition(&mut self, next: LoginState) {
        info!("Session {}: {} -> {}", self.identity, self.state, next);
        self.state = next;
    }

    /// Run the full authentication sequence. Returns the terminal state;
    /// the caller must not retry a `Failed` outcome within the same run.
    pub async fn run(
        &mut self,
        driver: &dyn PageDriver,
        store: &dyn SessionStore,
        password: &str,
        code_source: Option<&dyn SecondFactorSource>,
    ) -> LoginState {
        let cached = match store.get(&self.identity).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Session store read failed for {}: {} (treating as no session)", self.identity, e);
                None
            }
        };

        if let Some(credential) = cached {
            self.transition(LoginState::RestoringSession);
            if self.try_restore(driver, &credential).await {
                self.finish_authenticated(driver, store).await;
                return self.state.clone();
            }

            // Stale or invalid session: never trusted, never fatal
            info!("Session {}: cached session invalid, falling back to credential login", self.identity);
            if let Err(e) = store.invalidate(&self.identity).await {
                warn!("Failed to evict stale session for {}: {}", self.identity, e);
            }
        }

        self.transition(LoginState::SubmittingCredentials);
        match self.submit_credentials(driver, password).await {
            Ok(CredentialStep::LandmarkReached) => {
                self.finish_authenticated(driver, store).await;
            }
            Ok(CredentialStep::SecondFactorPrompt) => {
                self.transition(LoginState::AwaitingSecondFactor);
                self.handle_second_factor(driver, code_source).await;
                if self.state == LoginState::Authenticated {
                    self.persist_session(driver, store).await;
                }
            }
            Ok(CredentialStep::Timeout) => {
                // The page we got stuck on is the most useful clue here
                if let Ok(url) = driver.current_url().await {
                    warn!("Session {}: login never verified, stuck at {}", self.identity, url);
                }
                self.transition(LoginState::Failed("login-timeout".to_string()));
            }
            Err(reason) => {
                self.transition(LoginState::Failed(reason));
            }
        }

        self.state.clone()
    }

    /// Apply a cached cookie set and verify it against the login-proof
    /// marker. Any driver error here means "session not usable", identical
    /// to a failed proof check.
    async fn try_restore(&self, driver: &dyn PageDriver, credential: &SessionCredential) -> bool {
        let restored: Result<(), crate::driver::DriverError> = async {
            driver.navigate(&self.config.base_url).await?;
            driver.apply_cookies(&credential.cookies).await?;
            driver.navigate(&self.config.landmark_url).await?;
            Ok(())
        }
        .await;

        if let Err(e) = restored {
            warn!("Session {}: restore navigation failed: {}", self.identity, e);
            return false;
        }

        self.wait_for_proof(driver).await == WaitOutcome::Satisfied
    }

    async fn wait_for_proof(&self, driver: &dyn PageDriver) -> WaitOutcome {
        let waiter = PageLoadWaiter::new(self.config.proof_budget.clone(), self.cancel.clone());
        let proof = self.config.proof_selector.clone();
        waiter
            .wait_until("login-proof marker", || driver.is_present(&proof))
            .await
    }

    async fn submit_credentials(
        &self,
        driver: &dyn PageDriver,
        password: &str,
    ) -> Result<CredentialStep, String> {
        driver
            .navigate(&self.config.login_url)
            .await
            .map_err(|e| format!("login-page: {}", e))?;

        let waiter = PageLoadWaiter::new(self.config.proof_budget.clone(), self.cancel.clone());
        let username_sel = self.config.selectors.username.clone();
        let form_ready = waiter
            .wait_until("login form", || driver.is_present(&username_sel))
            .await;
        if !form_ready.is_satisfied() {
            return Ok(CredentialStep::Timeout);
        }

        let delay = self.config.per_char_delay();
        driver
            .type_text(&self.config.selectors.username, &self.identity, delay)
            .await
            .map_err(|e| format!("username field: {}", e))?;
        driver
            .type_text(&self.config.selectors.password, password, delay)
            .await
            .map_err(|e| format!("password field: {}", e))?;
        driver
            .click(&self.config.selectors.submit)
            .await
            .map_err(|e| format!("submit: {}", e))?;

        // The challenge page renders quickly when it is going to appear at
        // all, so a short probe is enough to tell the flows apart.
        let probe = PageLoadWaiter::new(self.config.probe_budget.clone(), self.cancel.clone());
        let prompt_sel = self.config.second_factor.prompt.clone();
        if probe
            .wait_until("second-factor prompt", || driver.is_present(&prompt_sel))
            .await
            .is_satisfied()
        {
            return Ok(CredentialStep::SecondFactorPrompt);
        }

        match self.wait_for_proof(driver).await {
            WaitOutcome::Satisfied => Ok(CredentialStep::LandmarkReached),
            WaitOutcome::Exhausted | WaitOutcome::Cancelled => Ok(CredentialStep::Timeout),
        }
    }

    async fn handle_second_factor(
        &mut self,
        driver: &dyn PageDriver,
        code_source: Option<&dyn SecondFactorSource>,
    ) {
        let source = match code_source {
            Some(s) => s,
            None => {
                self.transition(LoginState::Failed("second-factor-unavailable".to_string()));
                return;
            }
        };

        let poll_delay = Duration::from_millis(self.config.second_factor_poll_delay_ms.max(1));

        for attempt in 1..=self.config.second_factor_attempts {
            if self.cancel.load(std::sync::atomic::Ordering::Relaxed) {
                self.transition(LoginState::Failed("second-factor-timeout".to_string()));
                return;
            }

            let code = match source.fetch_latest_code().await {
                Ok(Some(code)) => code,
                Ok(None) => {
                    tokio::time::sleep(poll_delay).await;
                    continue;
                }
                Err(e) => {
                    warn!(
                        "Session {}: inbox poll {}/{} failed: {}",
                        self.identity, attempt, self.config.second_factor_attempts, e
                    );
                    tokio::time::sleep(poll_delay).await;
                    continue;
                }
            };

            let submitted: Result<(), crate::driver::DriverError> = async {
                driver
                    .type_text(&self.config.second_factor.input, &code, self.config.per_char_delay())
                    .await?;
                driver.click(&self.config.second_factor.submit).await?;
                Ok(())
            }
            .await;

            if let Err(e) = submitted {
                self.transition(LoginState::Failed(format!("second-factor-submit: {}", e)));
                return;
            }

            if self.wait_for_proof(driver).await == WaitOutcome::Satisfied {
                self.transition(LoginState::Authenticated);
            } else {
                self.transition(LoginState::Failed("second-factor-timeout".to_string()));
            }
            return;
        }

        self.transition(LoginState::Failed("second-factor-timeout".to_string()));
    }

    /// Proof has already been verified on every path that reaches here.
    async fn finish_authenticated(&mut self, driver: &dyn PageDriver, store: &dyn SessionStore) {
        self.transition(LoginState::Authenticated);
        self.persist_session(driver, store).await;
    }

    /// Persist the live cookie set with a fresh TTL, overwriting any prior
    /// credential. A store failure downgrades persistence, not the login.
    async fn persist_session(&self, driver: &dyn PageDriver, store: &dyn SessionStore) {
        let cookies = match driver.cookies().await {
            Ok(c) if !c.is_empty() => c,
            Ok(_) => {
                warn!("Session {}: no cookies to persist", self.identity);
                return;
            }
            Err(e) => {
                warn!("Session {}: could not read cookies: {}", self.identity, e);
                return;
            }
        };

        let credential = SessionCredential::new(cookies, self.config.session_ttl());
        if let Err(e) = store.set(&self.identity, credential).await {
            warn!("Session {}: could not persist session: {}", self.identity, e);
        }
    }
}

enum CredentialStep {
    LandmarkReached,
    SecondFactorPrompt,
    Timeout,
}
