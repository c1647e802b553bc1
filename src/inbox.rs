//! Second-factor code retrieval
//!
//! When the site challenges a fresh login with an emailed PIN, the code is
//! pulled from a mail-inbox HTTP API. Absence of a code is a normal value;
//! the login state machine polls until its budget runs out.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response: {0}")]
    BadResponse(String),
}

/// Source of one-time login codes
#[async_trait]
pub trait SecondFactorSource: Send + Sync {
    /// Latest verification code for the account's mailbox, if one has
    /// arrived yet.
    async fn fetch_latest_code(&self) -> Result<Option<String>, InboxError>;
}

/// Mail-inbox API configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxConfig {
    /// Endpoint returning `{"code": "123456"}` or `{"code": null}`
    pub api_url: String,
    /// Bearer token for the inbox API
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

/// HTTP client over a mail-inbox API
pub struct HttpInboxClient {
    client: reqwest::Client,
    config: InboxConfig,
}

impl HttpInboxClient {
    pub fn new(config: InboxConfig) -> Result<Self, InboxError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| InboxError::Network(e.to_string()))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl SecondFactorSource for HttpInboxClient {
    async fn fetch_latest_code(&self) -> Result<Option<String>, InboxError> {
        let mut request = self.client.get(&self.config.api_url);
        if !self.config.api_token.is_empty() {
            request = request.bearer_auth(&self.config.api_token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| InboxError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(InboxError::BadResponse(format!("HTTP {}", response.status())));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| InboxError::BadResponse(e.to_string()))?;

        let code = data
            .get("code")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        debug!("Inbox poll: code {}", if code.is_some() { "available" } else { "not yet arrived" });
        Ok(code)
    }
}
