//! linkreach
//!
//! Session-persistent LinkedIn outreach automation: multi-account browser
//! sessions with cached logins, resilient search-result extraction to CSV,
//! and a rate-limited invitation pipeline.

pub mod driver;
pub mod store;
pub mod waiter;
pub mod extract;
pub mod throttle;
pub mod inbox;
pub mod output;
pub mod login;
pub mod runner;
pub mod pool;

use std::path::PathBuf;
use tracing::{error, info, warn};

use inbox::InboxConfig;
use login::LoginConfig;
use pool::PoolConfig;
use runner::{Account, RunnerConfig};
use throttle::ThrottleConfig;
use waiter::RetryBudget;

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Accounts to run, each with its own search page
    #[serde(default)]
    pub accounts: Vec<Account>,

    /// Session configuration
    pub concurrent_sessions: usize,
    pub headless: bool,
    /// Path to Chrome/Chromium executable (autodetected when `None`)
    #[serde(default)]
    pub chrome_path: Option<String>,

    /// How long a cached login stays trusted
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: u64,

    /// Per-character typing delay in milliseconds
    #[serde(default = "default_per_char_delay_ms")]
    pub per_char_delay_ms: u64,

    /// Retry budget applied to page and element waits
    #[serde(default)]
    pub wait_budget: RetryBudget,

    /// Invitation pipeline
    #[serde(default)]
    pub send_invites: bool,
    #[serde(default = "default_max_invites")]
    pub max_invites: usize,
    #[serde(default = "default_invite_delay_min_ms")]
    pub invite_delay_min_ms: u64,
    #[serde(default = "default_invite_delay_max_ms")]
    pub invite_delay_max_ms: u64,

    /// Directory receiving one CSV per account
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Mail-inbox API for second-factor codes (optional)
    #[serde(default)]
    pub inbox: Option<InboxConfig>,
}

fn default_session_ttl_days() -> u64 { 20 }
fn default_per_char_delay_ms() -> u64 { 120 }
fn default_max_invites() -> usize { 10 }
fn default_invite_delay_min_ms() -> u64 { 5_000 }
fn default_invite_delay_max_ms() -> u64 { 15_000 }
fn default_output_dir() -> PathBuf { PathBuf::from("output") }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            accounts: vec![],
            concurrent_sessions: 2,
            headless: true,
            chrome_path: None,
            session_ttl_days: default_session_ttl_days(),
            per_char_delay_ms: default_per_char_delay_ms(),
            wait_budget: RetryBudget::default(),
            send_invites: false,
            max_invites: default_max_invites(),
            invite_delay_min_ms: default_invite_delay_min_ms(),
            invite_delay_max_ms: default_invite_delay_max_ms(),
            output_dir: default_output_dir(),
            inbox: None,
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("linkreach").join("logs"))
}

impl AppConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("linkreach").join("config.json"))
    }

    /// Load config from file
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            self.save_to(&path);
        }
    }

    fn save_to(&self, path: &std::path::Path) {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!("Failed to create config directory: {}", e);
                return;
            }
        }

        match serde_json::to_string_pretty(self) {
            Ok(content) => {
                if let Err(e) = std::fs::write(path, content) {
                    error!("Failed to save config: {}", e);
                } else {
                    info!("Config saved to {:?}", path);
                }
            }
            Err(e) => {
                error!("Failed to serialize config: {}", e);
            }
        }
    }

    /// Drop accounts whose search URL does not parse, logging each one.
    /// A typo in one account's URL should not take the batch down later.
    pub fn valid_accounts(&self) -> Vec<Account> {
        self.accounts
            .iter()
            .filter(|a| match url::Url::parse(&a.search_url) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Skipping account {}: bad search URL ({})", a.email, e);
                    false
                }
            })
            .cloned()
            .collect()
    }

    /// Project the flat app settings onto the pool's nested configuration
    pub fn pool_config(&self) -> PoolConfig {
        let login = LoginConfig {
            per_char_delay_ms: self.per_char_delay_ms,
            session_ttl_secs: self.session_ttl_days * 24 * 60 * 60,
            proof_budget: self.wait_budget.clone(),
            probe_budget: self.wait_budget.clone(),
            ..LoginConfig::default()
        };

        let throttle = ThrottleConfig {
            max_actions: self.max_invites,
            confirm_budget: self.wait_budget.clone(),
            delay_min_ms: self.invite_delay_min_ms,
            delay_max_ms: self.invite_delay_max_ms,
            ..ThrottleConfig::default()
        };

        PoolConfig {
            concurrent_sessions: self.concurrent_sessions,
            runner: RunnerConfig {
                login,
                throttle,
                page_load_budget: self.wait_budget.clone(),
                output_dir: self.output_dir.clone(),
                send_invites: self.send_invites,
                ..RunnerConfig::default()
            },
        }
    }
}

/// Initialize logging: console plus a daily rolling file when a log
/// directory is available.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "linkreach.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
