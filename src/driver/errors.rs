//! Driver error types

use thiserror::Error;

/// Errors surfaced by the browser-automation boundary
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Protocol command failed: {0}")]
    CommandFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<DriverError> for String {
    fn from(err: DriverError) -> String {
        err.to_string()
    }
}
