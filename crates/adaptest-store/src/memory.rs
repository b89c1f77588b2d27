//! In-process cache and snapshot fallback.
//!
//! [`InMemoryCache`] keeps real expiration times on the tokio clock, so tests
//! can pause time and advance past a TTL. It can also be switched off or made
//! slow to exercise the store's outage handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use adaptest_core::error::CacheError;
use adaptest_core::model::{SessionId, SessionState};
use adaptest_core::traits::{CacheBackend, SnapshotFallback};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// A [`CacheBackend`] backed by a mutex-guarded map.
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    latency: Option<Duration>,
    call_count: AtomicU32,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency: None,
            call_count: AtomicU32::new(0),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Number of calls made, including failed ones.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self) -> Result<(), CacheError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::Relaxed) {
            return Err(CacheError::Unavailable("in-memory cache is switched off".into()));
        }
        Ok(())
    }

    /// The live value at `key`, dropping it if it has expired.
    fn live_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.enter().await?;
        Ok(Self::live_value(&mut self.lock(), key, Instant::now()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.enter().await?;
        let expires_at = Instant::now() + ttl;
        self.lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.enter().await?;
        let now = Instant::now();
        Ok(self
            .lock()
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.enter().await?;
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.enter().await?;
        let now = Instant::now();
        Ok(self
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.enter().await?;
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.enter().await?;
        let now = Instant::now();
        let mut entries = self.lock();
        let current = Self::live_value(&mut entries, key, now);
        if current.as_deref() != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }
}

/// A [`SnapshotFallback`] that keeps the latest snapshot per session.
#[derive(Default)]
pub struct InMemorySnapshotFallback {
    snapshots: Mutex<HashMap<SessionId, SessionState>>,
}

impl InMemorySnapshotFallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotFallback for InMemorySnapshotFallback {
    async fn load(&self, session_id: &SessionId) -> anyhow::Result<Option<SessionState>> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| anyhow::anyhow!("snapshot fallback lock poisoned"))?;
        Ok(snapshots.get(session_id).cloned())
    }

    async fn store(&self, state: &SessionState) -> anyhow::Result<()> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| anyhow::anyhow!("snapshot fallback lock poisoned"))?;
        snapshots.insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> anyhow::Result<()> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| anyhow::anyhow!("snapshot fallback lock poisoned"))?;
        snapshots.remove(session_id);
        Ok(())
    }
}
