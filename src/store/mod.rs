//! Session persistence
//!
//! Cookie sets captured at successful login are persisted per account
//! identity and restored on the next run instead of resubmitting
//! credentials. Keys are namespaced (`"<namespace>:<identity>"`), TTL is
//! advisory, and absence is always "no cached session", never an error.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::driver::Cookie;

/// Default session lifetime: 20 days, matching how long the target site
/// keeps an auth cookie usable in practice.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 20);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A transportable authentication state: the cookie set captured from a
/// live session plus issue time and TTL.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredential {
    pub cookies: Vec<Cookie>,
    pub issued_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl SessionCredential {
    pub fn new(cookies: Vec<Cookie>, ttl: Duration) -> Self {
        Self {
            cookies,
            issued_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
        }
    }

    /// Whether the TTL has elapsed since issue time
    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.issued_at);
        age.num_seconds() < 0 || age.num_seconds() as u64 >= self.ttl_secs
    }
}

/// Key-value persistence of serialized sessions, one credential per identity
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch the cached credential for `identity`, if any. Expired entries
    /// are reported as absent.
    async fn get(&self, identity: &str) -> Result<Option<SessionCredential>, StoreError>;

    /// Persist `credential` for `identity`, replacing any prior one.
    async fn set(&self, identity: &str, credential: SessionCredential) -> Result<(), StoreError>;

    /// Drop the cached credential for `identity` (stale/invalid session).
    async fn invalidate(&self, identity: &str) -> Result<(), StoreError>;
}

fn namespaced_key(namespace: &str, identity: &str) -> String {
    format!("{}:{}", namespace, identity)
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

struct CredentialExpiry;

impl moka::Expiry<String, SessionCredential> for CredentialExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &SessionCredential,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(Duration::from_secs(value.ttl_secs))
    }
}

/// Process-local store; sessions survive across worker sessions within one
/// run but not across runs.
pub struct MemorySessionStore {
    namespace: String,
    cache: moka::future::Cache<String, SessionCredential>,
}

impl MemorySessionStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            cache: moka::future::Cache::builder()
                .expire_after(CredentialExpiry)
                .build(),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, identity: &str) -> Result<Option<SessionCredential>, StoreError> {
        let key = namespaced_key(&self.namespace, identity);
        let cred = self.cache.get(&key).await;
        Ok(cred.filter(|c| !c.is_expired()))
    }

    async fn set(&self, identity: &str, credential: SessionCredential) -> Result<(), StoreError> {
        let key = namespaced_key(&self.namespace, identity);
        self.cache.insert(key, credential).await;
        Ok(())
    }

    async fn invalidate(&self, identity: &str) -> Result<(), StoreError> {
        let key = namespaced_key(&self.namespace, identity);
        self.cache.invalidate(&key).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// Durable store: one JSON file per namespaced key under a data directory.
/// This is what lets a fresh process reuse yesterday's login.
pub struct FileSessionStore {
    namespace: String,
    dir: PathBuf,
}

impl FileSessionStore {
    /// Store rooted at the app data directory
    pub fn open(namespace: &str) -> Result<Self, StoreError> {
        let dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("linkreach")
            .join("sessions");
        Self::open_at(namespace, dir)
    }

    /// Store rooted at an explicit directory
    pub fn open_at(namespace: &str, dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            namespace: namespace.to_string(),
            dir,
        })
    }

    fn path_for(&self, identity: &str) -> PathBuf {
        // Keys contain '@' and ':'; keep filenames portable
        let key = namespaced_key(&self.namespace, identity);
        let sanitized: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", sanitized))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, identity: &str) -> Result<Option<SessionCredential>, StoreError> {
        let path = self.path_for(identity);

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!("Failed to read session file {:?}: {}", path, e);
                return Ok(None);
            }
        };

        let credential: SessionCredential = match serde_json::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                // Corrupt cache entry: treat as absent and clean it up
                warn!("Discarding unreadable session file {:?}: {}", path, e);
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(None);
            }
        };

        if credential.is_expired() {
            debug!("Cached session for {} expired, evicting", identity);
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }

        Ok(Some(credential))
    }

    async fn set(&self, identity: &str, credential: SessionCredential) -> Result<(), StoreError> {
        let path = self.path_for(identity);
        let content = serde_json::to_string_pretty(&credential)?;
        tokio::fs::write(&path, content).await?;
        info!("Session for {} persisted ({} cookies)", identity, credential.cookies.len());
        Ok(())
    }

    async fn invalidate(&self, identity: &str) -> Result<(), StoreError> {
        let path = self.path_for(identity);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Session for {} invalidated", identity),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(ttl: Duration) -> SessionCredential {
        SessionCredential::new(vec![Cookie::new("li_at", "tok", ".example.com")], ttl)
    }

    #[test]
    fn test_expiry_check() {
        let fresh = credential(Duration::from_secs(60));
        assert!(!fresh.is_expired());

        let mut stale = credential(Duration::from_secs(60));
        stale.issued_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(stale.is_expired());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemorySessionStore::new("linkreach");
        assert!(store.get("a@example.com").await.unwrap().is_none());

        store
            .set("a@example.com", credential(Duration::from_secs(60)))
            .await
            .unwrap();

        let got = store.get("a@example.com").await.unwrap().unwrap();
        assert_eq!(got.cookies[0].name, "li_at");

        // Identities do not share entries
        assert!(store.get("b@example.com").await.unwrap().is_none());

        store.invalidate("a@example.com").await.unwrap();
        assert!(store.get("a@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_expired_entry_is_absent() {
        let store = MemorySessionStore::new("linkreach");
        let mut cred = credential(Duration::from_secs(30));
        cred.issued_at = Utc::now() - chrono::Duration::seconds(60);
        store.set("a@example.com", cred).await.unwrap();
        assert!(store.get("a@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open_at("linkreach", dir.path().to_path_buf()).unwrap();

        store
            .set("a@example.com", credential(Duration::from_secs(60)))
            .await
            .unwrap();

        let got = store.get("a@example.com").await.unwrap().unwrap();
        assert_eq!(got.cookies[0].value, "tok");

        store.invalidate("a@example.com").await.unwrap();
        assert!(store.get("a@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_expired_entry_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open_at("linkreach", dir.path().to_path_buf()).unwrap();

        let mut stale = credential(Duration::from_secs(60));
        stale.issued_at = Utc::now() - chrono::Duration::seconds(3600);
        store.set("a@example.com", stale).await.unwrap();

        assert!(store.get("a@example.com").await.unwrap().is_none());
        // The file itself was removed
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_file_store_corrupt_entry_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open_at("linkreach", dir.path().to_path_buf()).unwrap();

        std::fs::write(store.path_for("a@example.com"), "not json").unwrap();
        assert!(store.get("a@example.com").await.unwrap().is_none());
    }
}
