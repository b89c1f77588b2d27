//! In-crate test doubles for the async collaborator traits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::model::{SessionId, SessionState};
use crate::traits::{CacheBackend, FinalResult, ResultsStore, SnapshotFallback};

/// HashMap cache. TTLs are recorded but never expire.
#[derive(Default)]
pub struct MapCache {
    entries: Mutex<HashMap<String, (String, Duration)>>,
}

impl MapCache {
    pub fn insert(&self, key: &str, value: &str) {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            (value.to_string(), Duration::from_secs(3600)),
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }
}

#[async_trait]
impl CacheBackend for MapCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.lock().unwrap().remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        Ok(match self.entries.lock().unwrap().get_mut(key) {
            Some(entry) => {
                entry.1 = ttl;
                true
            }
            None => false,
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        Ok(self.entries.lock().unwrap().get(key).map(|(_, ttl)| *ttl))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
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
        let mut entries = self.entries.lock().unwrap();
        let current = entries.get(key).map(|(v, _)| v.as_str());
        if current != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value, ttl));
        Ok(true)
    }
}

/// A cache that is either down or too slow.
pub struct FlakyCache {
    delay: Option<Duration>,
}

impl FlakyCache {
    pub fn unavailable() -> Self {
        Self { delay: None }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }

    async fn fail<T>(&self) -> Result<T, CacheError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

#[async_trait]
impl CacheBackend for FlakyCache {
    async fn get(&self, _: &str) -> Result<Option<String>, CacheError> {
        self.fail().await
    }

    async fn set(&self, _: &str, _: String, _: Duration) -> Result<(), CacheError> {
        self.fail().await
    }

    async fn delete(&self, _: &str) -> Result<bool, CacheError> {
        self.fail().await
    }

    async fn expire(&self, _: &str, _: Duration) -> Result<bool, CacheError> {
        self.fail().await
    }

    async fn ttl(&self, _: &str) -> Result<Option<Duration>, CacheError> {
        self.fail().await
    }

    async fn keys(&self, _: &str) -> Result<Vec<String>, CacheError> {
        self.fail().await
    }

    async fn compare_and_set(
        &self,
        _: &str,
        _: Option<&str>,
        _: String,
        _: Duration,
    ) -> Result<bool, CacheError> {
        self.fail().await
    }
}

#[derive(Default)]
pub struct MemoryFallback {
    snapshots: Mutex<HashMap<SessionId, SessionState>>,
}

#[async_trait]
impl SnapshotFallback for MemoryFallback {
    async fn load(&self, session_id: &SessionId) -> anyhow::Result<Option<SessionState>> {
        Ok(self.snapshots.lock().unwrap().get(session_id).cloned())
    }

    async fn store(&self, state: &SessionState) -> anyhow::Result<()> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> anyhow::Result<()> {
        self.snapshots.lock().unwrap().remove(session_id);
        Ok(())
    }
}

impl MemoryFallback {
    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }
}

#[derive(Default)]
pub struct MemoryResults {
    results: Mutex<HashMap<SessionId, FinalResult>>,
}

impl MemoryResults {
    pub fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }
}

#[async_trait]
impl ResultsStore for MemoryResults {
    async fn record_final(&self, result: &FinalResult) -> anyhow::Result<bool> {
        let mut results = self.results.lock().unwrap();
        if results.contains_key(&result.state.session_id) {
            return Ok(false);
        }
        results.insert(result.state.session_id.clone(), result.clone());
        Ok(true)
    }

    async fn get(&self, session_id: &SessionId) -> anyhow::Result<Option<FinalResult>> {
        Ok(self.results.lock().unwrap().get(session_id).cloned())
    }
}
