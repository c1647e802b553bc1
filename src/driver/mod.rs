//! Browser-automation boundary
//!
//! The rest of the crate only depends on the narrow [`PageDriver`] surface:
//! navigate, wait, probe, click, type, cookies, markup snapshot. Production
//! drives a real Chrome instance ([`ChromiumDriver`]); tests use a scripted
//! mock.

mod errors;
mod chromium;

pub use errors::DriverError;
pub use chromium::{ChromiumDriver, DriverConfig};

use std::time::Duration;

use async_trait::async_trait;

/// Transportable cookie state, the unit of a persisted session.
///
/// A live browser holds a copy applied to its own context; mutating one side
/// does not affect the other until the session is re-persisted.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// Expiry as seconds since the Unix epoch; `None` for session cookies.
    #[serde(default)]
    pub expires: Option<f64>,
}

fn default_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_path(),
            secure: true,
            http_only: false,
            expires: None,
        }
    }
}

/// Narrow surface over the underlying browser-automation engine.
///
/// Absent lookups are normal values (`Ok(false)`), never errors; every wait
/// accepts a finite timeout.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate the page to `url`.
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// Wait until the current navigation settles, bounded by `timeout`.
    async fn wait_for_load(&self, timeout: Duration) -> Result<(), DriverError>;

    /// Probe whether an element matching `selector` currently exists.
    async fn is_present(&self, selector: &str) -> Result<bool, DriverError>;

    /// Click the first element matching `selector`.
    async fn click(&self, selector: &str) -> Result<(), DriverError>;

    /// Focus `selector` and type `text` one character at a time, pausing
    /// `per_char_delay` (plus jitter) between characters.
    async fn type_text(
        &self,
        selector: &str,
        text: &str,
        per_char_delay: Duration,
    ) -> Result<(), DriverError>;

    /// Read the cookies visible to the current browser context.
    async fn cookies(&self) -> Result<Vec<Cookie>, DriverError>;

    /// Apply a cookie set to the browser context.
    async fn apply_cookies(&self, cookies: &[Cookie]) -> Result<(), DriverError>;

    /// Snapshot the current markup as a raw HTML string.
    async fn content(&self) -> Result<String, DriverError>;

    /// The page's current URL.
    async fn current_url(&self) -> Result<String, DriverError>;

    /// Scroll to the bottom of the document (forces lazy result lists).
    async fn scroll_to_bottom(&self) -> Result<(), DriverError>;

    /// Tear the browser session down. Must be safe to call on every exit
    /// path, including after earlier failures.
    async fn close(&self) -> Result<(), DriverError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory driver for exercising the login, throttle and
    //! pool pipelines without a browser.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockState {
        /// Selectors currently present on the "page".
        present: HashSet<String>,
        /// Clicking the key selector makes the listed selectors present.
        appear_on_click: HashMap<String, Vec<String>>,
        /// Clicking the key selector makes the listed selectors absent.
        vanish_on_click: HashMap<String, Vec<String>>,
        /// Selectors whose click always errors.
        failing_clicks: HashSet<String>,
        navigations: Vec<String>,
        clicks: Vec<String>,
        typed: Vec<(String, String)>,
        applied: Vec<Vec<Cookie>>,
    }

    pub struct MockDriver {
        state: Mutex<MockState>,
        html: String,
        cookies: Vec<Cookie>,
        closed: AtomicBool,
    }

    impl MockDriver {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(MockState::default()),
                html: String::new(),
                cookies: vec![Cookie::new("li_at", "tok", ".example.com")],
                closed: AtomicBool::new(false),
            }
        }

        pub fn with_html(mut self, html: &str) -> Self {
            self.html = html.to_string();
            self
        }

        pub fn with_present(self, selectors: &[&str]) -> Self {
            {
                let mut s = self.state.lock().unwrap();
                for sel in selectors {
                    s.present.insert(sel.to_string());
                }
            }
            self
        }

        pub fn appear_on_click(self, click: &str, appears: &[&str]) -> Self {
            self.state
                .lock()
                .unwrap()
                .appear_on_click
                .insert(click.to_string(), appears.iter().map(|s| s.to_string()).collect());
            self
        }

        pub fn vanish_on_click(self, click: &str, vanishes: &[&str]) -> Self {
            self.state
                .lock()
                .unwrap()
                .vanish_on_click
                .insert(click.to_string(), vanishes.iter().map(|s| s.to_string()).collect());
            self
        }

        pub fn failing_click(self, selector: &str) -> Self {
            self.state.lock().unwrap().failing_clicks.insert(selector.to_string());
            self
        }

        pub fn navigations(&self) -> Vec<String> {
            self.state.lock().unwrap().navigations.clone()
        }

        pub fn clicks(&self) -> Vec<String> {
            self.state.lock().unwrap().clicks.clone()
        }

        pub fn typed(&self) -> Vec<(String, String)> {
            self.state.lock().unwrap().typed.clone()
        }

        pub fn applied_cookie_sets(&self) -> usize {
            self.state.lock().unwrap().applied.len()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl PageDriver for MockDriver {
        async fn navigate(&self, url: &str) -> Result<(), DriverError> {
            self.state.lock().unwrap().navigations.push(url.to_string());
            Ok(())
        }

        async fn wait_for_load(&self, _timeout: Duration) -> Result<(), DriverError> {
            Ok(())
        }

        async fn is_present(&self, selector: &str) -> Result<bool, DriverError> {
            Ok(self.state.lock().unwrap().present.contains(selector))
        }

        async fn click(&self, selector: &str) -> Result<(), DriverError> {
            let mut s = self.state.lock().unwrap();
            if s.failing_clicks.contains(selector) {
                return Err(DriverError::ElementNotFound(selector.to_string()));
            }
            s.clicks.push(selector.to_string());
            if let Some(appears) = s.appear_on_click.get(selector).cloned() {
                for sel in appears {
                    s.present.insert(sel);
                }
            }
            if let Some(vanishes) = s.vanish_on_click.get(selector).cloned() {
                for sel in vanishes {
                    s.present.remove(&sel);
                }
            }
            Ok(())
        }

        async fn type_text(
            &self,
            selector: &str,
            text: &str,
            _per_char_delay: Duration,
        ) -> Result<(), DriverError> {
            let mut s = self.state.lock().unwrap();
            if !s.present.contains(selector) {
                return Err(DriverError::ElementNotFound(selector.to_string()));
            }
            s.typed.push((selector.to_string(), text.to_string()));
            Ok(())
        }

        async fn cookies(&self) -> Result<Vec<Cookie>, DriverError> {
            Ok(self.cookies.clone())
        }

        async fn apply_cookies(&self, cookies: &[Cookie]) -> Result<(), DriverError> {
            self.state.lock().unwrap().applied.push(cookies.to_vec());
            Ok(())
        }

        async fn content(&self) -> Result<String, DriverError> {
            Ok(self.html.clone())
        }

        async fn current_url(&self) -> Result<String, DriverError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .navigations
                .last()
                .cloned()
                .unwrap_or_else(|| "about:blank".to_string()))
        }

        async fn scroll_to_bottom(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), DriverError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }
}
