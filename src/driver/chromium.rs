//! Chrome-backed [`PageDriver`] implementation
//!
//! Launches and controls one Chrome instance per account session over the
//! DevTools protocol. Typing goes through raw CDP key events so the
//! per-character pacing is real input, not JavaScript value assignment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::HeadlessMode;
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetCookiesParams, TimeSinceEpoch};
use chromiumoxide::cdp::browser_protocol::storage::GetCookiesParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Cookie, DriverError, PageDriver};

/// Find a Chrome/Chromium executable on the system
fn find_chrome() -> Option<std::path::PathBuf> {
    let candidates: Vec<std::path::PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            std::path::PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            std::path::PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(std::path::PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![std::path::PathBuf::from(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        )]
    } else {
        vec![
            std::path::PathBuf::from("/usr/bin/google-chrome"),
            std::path::PathBuf::from("/usr/bin/google-chrome-stable"),
            std::path::PathBuf::from("/usr/bin/chromium"),
            std::path::PathBuf::from("/usr/bin/chromium-browser"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// Configuration for one browser session
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    /// Path to Chrome/Chromium executable (autodetected when `None`)
    pub chrome_path: Option<String>,
    /// Run in headless mode
    pub headless: bool,
    /// User data directory (unique per session)
    pub user_data_dir: Option<String>,
    /// Window width
    pub window_width: u32,
    /// Window height
    pub window_height: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            user_data_dir: None,
            window_width: 1920,
            window_height: 1080,
        }
    }
}

impl DriverConfig {
    /// Config with an isolated data directory for one account session
    pub fn for_session(session_id: &str) -> Self {
        let user_data_dir = std::env::temp_dir()
            .join("linkreach")
            .join("browser_data")
            .join(session_id)
            .to_string_lossy()
            .to_string();

        Self {
            user_data_dir: Some(user_data_dir),
            ..Default::default()
        }
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn chrome_path(mut self, path: Option<String>) -> Self {
        self.chrome_path = path;
        self
    }
}

/// Map transportable cookies onto CDP set-cookie parameters. Expiry is
/// carried through so a restored cookie keeps its original lifetime instead
/// of degrading to a session cookie.
fn cookie_params(cookies: &[Cookie]) -> Vec<CookieParam> {
    cookies
        .iter()
        .filter_map(|c| {
            let mut builder = CookieParam::builder()
                .name(&c.name)
                .value(&c.value)
                .domain(&c.domain)
                .path(&c.path)
                .secure(c.secure)
                .http_only(c.http_only);
            if let Some(expires) = c.expires {
                builder = builder.expires(TimeSinceEpoch::new(expires));
            }
            builder.build().ok()
        })
        .collect()
}

/// A Chrome session driving one account
pub struct ChromiumDriver {
    /// Display name, e.g. the account identity this session serves
    pub id: String,
    browser: Arc<RwLock<Option<Browser>>>,
    page: Arc<RwLock<Option<Page>>>,
    alive: Arc<AtomicBool>,
}

impl ChromiumDriver {
    /// Launch a new browser session with the given config
    pub async fn launch(id: &str, config: DriverConfig) -> Result<Self, DriverError> {
        info!("Launching browser session {} (headless: {})", id, config.headless);

        if config.chrome_path.is_none() && find_chrome().is_none() {
            return Err(DriverError::LaunchFailed(
                "Chrome not found; install Chrome/Chromium or set chromePath in the config".to_string(),
            ));
        }

        let mut builder = BrowserConfig::builder();

        if config.headless {
            builder = builder.headless_mode(HeadlessMode::New);
        } else {
            builder = builder.with_head();
        }

        if let Some(ref path) = config.chrome_path {
            builder = builder.chrome_executable(path);
        } else if let Some(chrome_path) = find_chrome() {
            debug!("Auto-detected Chrome at: {}", chrome_path.display());
            builder = builder.chrome_executable(chrome_path);
        }

        if let Some(ref dir) = config.user_data_dir {
            let _ = std::fs::create_dir_all(dir);
            builder = builder.user_data_dir(dir);
        }

        builder = builder
            .window_size(config.window_width, config.window_height)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--no-default-browser-check")
            .arg("--disable-notifications")
            .arg("--disable-session-crashed-bubble")
            .arg("--disable-restore-session-state")
            // Required when running as root (e.g. in Docker or on a VPS)
            .arg("--no-sandbox");

        let browser_config = builder
            .build()
            .map_err(DriverError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

        // When the handler stream ends, Chrome has disconnected or crashed.
        let alive = Arc::new(AtomicBool::new(true));
        let alive_for_handler = alive.clone();
        let id_for_handler = id.to_string();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            warn!("Session {} Chrome disconnected (event handler ended)", id_for_handler);
            alive_for_handler.store(false, Ordering::Relaxed);
        });

        // Chrome opens with a blank tab; take it and close any extras.
        let page = {
            let mut pages = browser
                .pages()
                .await
                .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

            let main_page = if !pages.is_empty() {
                pages.remove(0)
            } else {
                browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| DriverError::LaunchFailed(e.to_string()))?
            };

            for extra in pages {
                let _ = extra.close().await;
            }

            main_page
        };

        info!("Browser session {} created", id);

        Ok(Self {
            id: id.to_string(),
            browser: Arc::new(RwLock::new(Some(browser))),
            page: Arc::new(RwLock::new(Some(page))),
            alive,
        })
    }

    /// Whether Chrome is still connected
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn with_page<T, F, Fut>(&self, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(Page) -> Fut,
        Fut: std::future::Future<Output = Result<T, DriverError>>,
    {
        if !self.is_alive() {
            return Err(DriverError::ConnectionLost("Chrome disconnected".into()));
        }
        let guard = self.page.read().await;
        let page = guard
            .as_ref()
            .ok_or_else(|| DriverError::ConnectionLost("No active page".into()))?
            .clone();
        drop(guard);
        f(page).await
    }
}

#[async_trait]
impl PageDriver for ChromiumDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        debug!("Session {} navigating to: {}", self.id, url);
        self.with_page(|page| async move {
            page.goto(url)
                .await
                .map_err(|e| DriverError::NavigationFailed(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn wait_for_load(&self, timeout: Duration) -> Result<(), DriverError> {
        self.with_page(|page| async move {
            tokio::time::timeout(timeout, page.wait_for_navigation())
                .await
                .map_err(|_| DriverError::Timeout("Navigation timeout".into()))?
                .map_err(|e| DriverError::NavigationFailed(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn is_present(&self, selector: &str) -> Result<bool, DriverError> {
        let sel = selector.to_string();
        self.with_page(|page| async move { Ok(page.find_element(sel).await.is_ok()) })
            .await
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        let sel = selector.to_string();
        self.with_page(|page| async move {
            let element = page
                .find_element(sel.clone())
                .await
                .map_err(|e| DriverError::ElementNotFound(format!("{}: {}", sel, e)))?;
            element
                .click()
                .await
                .map_err(|e| DriverError::CommandFailed(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn type_text(
        &self,
        selector: &str,
        text: &str,
        per_char_delay: Duration,
    ) -> Result<(), DriverError> {
        let sel = selector.to_string();
        let text = text.to_string();
        self.with_page(|page| async move {
            // Click to focus the field first
            let element = page
                .find_element(sel.clone())
                .await
                .map_err(|e| DriverError::ElementNotFound(format!("{}: {}", sel, e)))?;
            element.click().await.ok();

            let base_ms = per_char_delay.as_millis() as u64;
            for c in text.chars() {
                let key_down = DispatchKeyEventParams::builder()
                    .r#type(DispatchKeyEventType::KeyDown)
                    .text(c.to_string())
                    .build()
                    .unwrap();
                page.execute(key_down)
                    .await
                    .map_err(|e| DriverError::CommandFailed(format!("CDP keyDown failed: {}", e)))?;

                let key_up = DispatchKeyEventParams::builder()
                    .r#type(DispatchKeyEventType::KeyUp)
                    .build()
                    .unwrap();
                page.execute(key_up)
                    .await
                    .map_err(|e| DriverError::CommandFailed(format!("CDP keyUp failed: {}", e)))?;

                // Humans do not type on a metronome
                let jitter = rand::thread_rng().gen_range(0..(base_ms / 2).max(1));
                tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
            }
            Ok(())
        })
        .await
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, DriverError> {
        self.with_page(|page| async move {
            let resp = page
                .execute(GetCookiesParams::default())
                .await
                .map_err(|e| DriverError::CommandFailed(format!("Storage.getCookies failed: {}", e)))?;

            // Go through JSON rather than the generated structs so the cookie
            // shape stays decoupled from protocol type details.
            let raw = serde_json::to_value(&resp.result.cookies)
                .map_err(|e| DriverError::CommandFailed(e.to_string()))?;

            let mut cookies = Vec::new();
            if let Some(items) = raw.as_array() {
                for item in items {
                    let name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                    let value = item.get("value").and_then(|v| v.as_str()).unwrap_or_default();
                    if name.is_empty() {
                        continue;
                    }
                    cookies.push(Cookie {
                        name: name.to_string(),
                        value: value.to_string(),
                        domain: item
                            .get("domain")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        path: item
                            .get("path")
                            .and_then(|v| v.as_str())
                            .unwrap_or("/")
                            .to_string(),
                        secure: item.get("secure").and_then(|v| v.as_bool()).unwrap_or(false),
                        http_only: item.get("httpOnly").and_then(|v| v.as_bool()).unwrap_or(false),
                        expires: item.get("expires").and_then(|v| v.as_f64()).filter(|e| *e > 0.0),
                    });
                }
            }
            Ok(cookies)
        })
        .await
    }

    async fn apply_cookies(&self, cookies: &[Cookie]) -> Result<(), DriverError> {
        let params = cookie_params(cookies);

        if params.is_empty() {
            return Ok(());
        }

        debug!("Session {} applying {} cookies", self.id, params.len());
        self.with_page(|page| async move {
            page.execute(SetCookiesParams::new(params))
                .await
                .map_err(|e| DriverError::CommandFailed(format!("Network.setCookies failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn content(&self) -> Result<String, DriverError> {
        self.with_page(|page| async move {
            page.content()
                .await
                .map_err(|e| DriverError::CommandFailed(e.to_string()))
        })
        .await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.with_page(|page| async move {
            page.url()
                .await
                .map_err(|e| DriverError::ConnectionLost(e.to_string()))?
                .ok_or_else(|| DriverError::ConnectionLost("No URL".into()))
        })
        .await
    }

    async fn scroll_to_bottom(&self) -> Result<(), DriverError> {
        self.with_page(|page| async move {
            page.evaluate("window.scrollTo(0, document.body.scrollHeight)")
                .await
                .map_err(|e| DriverError::CommandFailed(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.alive.store(false, Ordering::Relaxed);

        {
            let mut page = self.page.write().await;
            if let Some(p) = page.take() {
                let _ = p.close().await;
            }
        }

        {
            let mut browser = self.browser.write().await;
            if let Some(mut b) = browser.take() {
                // Graceful close first, then force kill so no orphaned Chrome
                // processes survive the run
                let _ = b.close().await;
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = b.kill().await;
            }
        }

        info!("Browser session {} closed", self.id);
        Ok(())
    }
}
