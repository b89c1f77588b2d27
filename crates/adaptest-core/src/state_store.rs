//! Session state store: engine snapshots in a shared cache.
//!
//! Every request loads an engine, mutates it, and writes it back. Snapshots
//! are stored in a versioned envelope under `<prefix><session_id>` with a
//! TTL so abandoned sessions expire on their own.
//!
//! The cache is an accelerator, not the source of truth for a test-taker's
//! progress: outages and timeouts become a miss on load and a skipped write on
//! save. The one error callers must handle is [`StoreError::VersionConflict`]
//! from [`SessionStateStore::commit`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{AdaptiveEngine, EngineConfig};
use crate::error::{CacheError, StoreError};
use crate::model::{SessionId, SessionState, SessionStatus};
use crate::traits::{CacheBackend, SnapshotFallback};

pub const DEFAULT_KEY_PREFIX: &str = "adaptive_engine:";

/// Store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub key_prefix: String,
    pub session_ttl_secs: u64,
    /// Upper bound on any single cache call.
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            session_ttl_secs: 3600,
            request_timeout_ms: 250,
        }
    }
}

impl StoreConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// What is actually written to the cache.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u64,
    written_at: chrono::DateTime<chrono::Utc>,
    snapshot: SessionState,
}

/// Where a loaded engine came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Cache,
    Fallback,
    /// Nothing stored; built from the configured priors.
    Fresh,
}

/// An engine together with the cache value it was loaded from.
#[derive(Debug)]
pub struct SessionHandle {
    pub engine: AdaptiveEngine,
    version: u64,
    raw: Option<String>,
    source: LoadSource,
}

impl SessionHandle {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn source(&self) -> LoadSource {
        self.source
    }
}

/// Lightweight view of a stored session, read without building an engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSessionSummary {
    pub session_id: SessionId,
    pub theta: f64,
    pub standard_error: f64,
    pub items: usize,
    pub status: SessionStatus,
    pub version: u64,
    pub ttl_secs: Option<u64>,
}

/// Loads and saves engines through an injected [`CacheBackend`].
#[derive(Clone)]
pub struct SessionStateStore {
    cache: Arc<dyn CacheBackend>,
    fallback: Option<Arc<dyn SnapshotFallback>>,
    engine_config: EngineConfig,
    config: StoreConfig,
}

impl SessionStateStore {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        engine_config: EngineConfig,
        config: StoreConfig,
    ) -> Self {
        Self {
            cache,
            fallback: None,
            engine_config,
            config,
        }
    }

    /// Consult `fallback` on a cache miss and mirror writes into it.
    pub fn with_fallback(mut self, fallback: Arc<dyn SnapshotFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    fn key(&self, session_id: &SessionId) -> String {
        format!("{}{}", self.config.key_prefix, session_id)
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Load the engine for `session_id`.
    ///
    /// Falls back to the durable snapshot, then to a fresh engine. Cache
    /// outages and unreadable entries are logged and treated as a miss.
    pub async fn load(&self, session_id: &SessionId) -> SessionHandle {
        let key = self.key(session_id);
        let raw = match self.call(self.cache.get(&key)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(session = %session_id, "cache read failed, treating as miss: {e}");
                None
            }
        };

        if let Some(raw) = raw {
            match self.decode(&raw) {
                Ok((version, engine)) => {
                    tracing::debug!(session = %session_id, version, "loaded from cache");
                    return SessionHandle {
                        engine,
                        version,
                        raw: Some(raw),
                        source: LoadSource::Cache,
                    };
                }
                Err(reason) => {
                    tracing::warn!(session = %session_id, "discarding unreadable snapshot: {reason}");
                    // Keep the raw value so a commit can replace the bad entry.
                    let mut handle = self.from_fallback_or_fresh(session_id).await;
                    handle.raw = Some(raw);
                    return handle;
                }
            }
        }

        self.from_fallback_or_fresh(session_id).await
    }

    fn decode(&self, raw: &str) -> Result<(u64, AdaptiveEngine), String> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        let engine = AdaptiveEngine::restore(envelope.snapshot, self.engine_config.clone())
            .map_err(|e| e.to_string())?;
        Ok((envelope.version, engine))
    }

    async fn from_fallback_or_fresh(&self, session_id: &SessionId) -> SessionHandle {
        if let Some(fallback) = &self.fallback {
            match fallback.load(session_id).await {
                Ok(Some(state)) => {
                    match AdaptiveEngine::restore(state, self.engine_config.clone()) {
                        Ok(engine) => {
                            tracing::info!(session = %session_id, "restored from durable fallback");
                            return SessionHandle {
                                engine,
                                version: 0,
                                raw: None,
                                source: LoadSource::Fallback,
                            };
                        }
                        Err(e) => {
                            tracing::warn!(session = %session_id, "ignoring invalid fallback snapshot: {e}")
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(session = %session_id, "fallback read failed: {e:#}"),
            }
        }

        tracing::debug!(session = %session_id, "starting fresh session");
        SessionHandle {
            engine: AdaptiveEngine::new(session_id.clone(), self.engine_config.clone()),
            version: 0,
            raw: None,
            source: LoadSource::Fresh,
        }
    }

    fn encode(&self, version: u64, engine: &AdaptiveEngine) -> Result<String, StoreError> {
        let envelope = Envelope {
            version,
            written_at: chrono::Utc::now(),
            snapshot: engine.get_state(),
        };
        serde_json::to_string(&envelope).map_err(|e| StoreError::Serialization {
            session_id: engine.session_id().clone(),
            reason: e.to_string(),
        })
    }

    async fn mirror(&self, engine: &AdaptiveEngine) {
        if let Some(fallback) = &self.fallback {
            if let Err(e) = fallback.store(&engine.get_state()).await {
                tracing::warn!(session = %engine.session_id(), "fallback write failed: {e:#}");
            }
        }
    }

    /// Unconditional overwrite; the last writer wins. `ttl` defaults to the
    /// configured session TTL.
    pub async fn save(
        &self,
        engine: &AdaptiveEngine,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let raw = self.encode(0, engine)?;
        let ttl = ttl.unwrap_or_else(|| self.config.session_ttl());
        let key = self.key(engine.session_id());

        match self.call(self.cache.set(&key, raw, ttl)).await {
            Ok(()) => tracing::debug!(
                session = %engine.session_id(),
                theta = engine.theta(),
                items = engine.state().item_count(),
                "saved"
            ),
            Err(e) => tracing::warn!(session = %engine.session_id(), "cache write skipped: {e}"),
        }
        self.mirror(engine).await;
        Ok(())
    }

    /// Write back only if the cache still holds the value `handle` was loaded
    /// from. On success the handle tracks the new version, so it can be
    /// committed again.
    pub async fn commit(
        &self,
        handle: &mut SessionHandle,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let version = handle.version + 1;
        let raw = self.encode(version, &handle.engine)?;
        let ttl = ttl.unwrap_or_else(|| self.config.session_ttl());
        let session_id = handle.engine.session_id().clone();
        let key = self.key(&session_id);

        let swapped = self
            .call(
                self.cache
                    .compare_and_set(&key, handle.raw.as_deref(), raw.clone(), ttl),
            )
            .await;
        match swapped {
            Ok(true) => {
                tracing::debug!(session = %session_id, version, "committed");
            }
            Ok(false) => {
                tracing::warn!(session = %session_id, loaded = handle.version, "concurrent write detected");
                return Err(StoreError::VersionConflict {
                    session_id,
                    loaded: handle.version,
                });
            }
            Err(e) => {
                tracing::warn!(session = %session_id, "cache write skipped: {e}");
            }
        }

        handle.version = version;
        handle.raw = Some(raw);
        self.mirror(&handle.engine).await;
        Ok(version)
    }

    /// Remove the cached snapshot. Returns `false` on a miss or an outage.
    pub async fn delete(&self, session_id: &SessionId) -> bool {
        match self.call(self.cache.delete(&self.key(session_id))).await {
            Ok(existed) => existed,
            Err(e) => {
                tracing::warn!(session = %session_id, "cache delete skipped: {e}");
                false
            }
        }
    }

    /// Forget a finished session: the cached snapshot and the fallback copy.
    /// Failures are logged; a leftover copy only costs storage.
    pub async fn discard(&self, session_id: &SessionId) {
        self.delete(session_id).await;
        if let Some(fallback) = &self.fallback {
            if let Err(e) = fallback.delete(session_id).await {
                tracing::warn!(session = %session_id, "fallback delete failed: {e:#}");
            }
        }
    }

    pub async fn exists(&self, session_id: &SessionId) -> bool {
        self.ttl(session_id).await.is_some()
    }

    /// Remaining lifetime of the cached snapshot.
    pub async fn ttl(&self, session_id: &SessionId) -> Option<Duration> {
        match self.call(self.cache.ttl(&self.key(session_id))).await {
            Ok(ttl) => ttl,
            Err(e) => {
                tracing::warn!(session = %session_id, "cache ttl query failed: {e}");
                None
            }
        }
    }

    /// Add `additional` to the remaining lifetime. Returns `false` when the
    /// session is not cached.
    pub async fn extend_ttl(&self, session_id: &SessionId, additional: Duration) -> bool {
        let Some(current) = self.ttl(session_id).await else {
            return false;
        };
        match self
            .call(self.cache.expire(&self.key(session_id), current + additional))
            .await
        {
            Ok(extended) => extended,
            Err(e) => {
                tracing::warn!(session = %session_id, "failed to extend ttl: {e}");
                false
            }
        }
    }

    /// Ids of every session with a live snapshot, sorted.
    pub async fn active_sessions(&self) -> Vec<SessionId> {
        let prefix = &self.config.key_prefix;
        let keys = match self.call(self.cache.keys(prefix)).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("cache scan failed: {e}");
                return Vec::new();
            }
        };
        let mut ids: Vec<SessionId> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .map(SessionId::new)
            .collect();
        ids.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        ids
    }

    /// Read a session's headline numbers straight from the envelope.
    pub async fn summary(&self, session_id: &SessionId) -> Option<StoredSessionSummary> {
        let raw = match self.call(self.cache.get(&self.key(session_id))).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(session = %session_id, "cache read failed: {e}");
                return None;
            }
        };
        let envelope: Envelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(session = %session_id, "unreadable snapshot: {e}");
                return None;
            }
        };
        let ttl_secs = self.ttl(session_id).await.map(|ttl| ttl.as_secs());
        let state = envelope.snapshot;
        Some(StoredSessionSummary {
            items: state.item_count(),
            session_id: state.session_id,
            theta: state.theta,
            standard_error: state.standard_error,
            status: state.status,
            version: envelope.version,
            ttl_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Item;
    use crate::testing::{FlakyCache, MapCache, MemoryFallback};

    fn bank() -> Vec<Item> {
        (1..=10)
            .map(|i| Item::new(i, 1.0 + i as f64 * 0.05, -1.5 + i as f64 * 0.3, 0.2))
            .collect()
    }

    fn store(cache: Arc<dyn CacheBackend>) -> SessionStateStore {
        SessionStateStore::new(cache, EngineConfig::default(), StoreConfig::default())
    }

    #[tokio::test]
    async fn miss_builds_fresh_engine() {
        let store = store(Arc::new(MapCache::default()));
        let handle = store.load(&SessionId::new("s1")).await;
        assert_eq!(handle.source(), LoadSource::Fresh);
        assert_eq!(handle.engine.theta(), 0.0);
        assert_eq!(handle.engine.status(), SessionStatus::AwaitingFirstItem);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let cache = Arc::new(MapCache::default());
        let store = store(cache.clone());
        let id = SessionId::new("s1");

        let mut handle = store.load(&id).await;
        let item = handle.engine.next_item(&bank()).unwrap();
        handle.engine.submit_response(item, true, 900).unwrap();
        store.save(&handle.engine, None).await.unwrap();

        assert!(cache.contains("adaptive_engine:s1"));
        let loaded = store.load(&id).await;
        assert_eq!(loaded.source(), LoadSource::Cache);
        assert_eq!(loaded.engine.get_state(), handle.engine.get_state());
    }

    #[tokio::test]
    async fn commit_detects_concurrent_writer() {
        let store = store(Arc::new(MapCache::default()));
        let id = SessionId::new("race");

        let mut first = store.load(&id).await;
        assert_eq!(store.commit(&mut first, None).await.unwrap(), 1);

        let mut a = store.load(&id).await;
        let mut b = store.load(&id).await;
        a.engine.next_item(&bank()).unwrap();
        b.engine.next_item(&bank()).unwrap();

        assert_eq!(store.commit(&mut a, None).await.unwrap(), 2);
        let err = store.commit(&mut b, None).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                session_id: id.clone(),
                loaded: 1
            }
        );
        // The handle that won can keep committing.
        assert_eq!(store.commit(&mut a, None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn two_fresh_loads_race_on_creation() {
        let store = store(Arc::new(MapCache::default()));
        let id = SessionId::new("new");
        let mut a = store.load(&id).await;
        let mut b = store.load(&id).await;
        store.commit(&mut a, None).await.unwrap();
        assert!(matches!(
            store.commit(&mut b, None).await,
            Err(StoreError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn outage_is_a_miss_and_a_skipped_write() {
        let cache = Arc::new(FlakyCache::unavailable());
        let store = store(cache);
        let id = SessionId::new("down");

        let mut handle = store.load(&id).await;
        assert_eq!(handle.source(), LoadSource::Fresh);
        handle.engine.next_item(&bank()).unwrap();
        store.save(&handle.engine, None).await.unwrap();
        store.commit(&mut handle, None).await.unwrap();
        assert!(!store.delete(&id).await);
        assert!(!store.exists(&id).await);
        assert!(store.active_sessions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cache_times_out_as_miss() {
        let store = store(Arc::new(FlakyCache::slow(Duration::from_secs(5))));
        let handle = store.load(&SessionId::new("slow")).await;
        assert_eq!(handle.source(), LoadSource::Fresh);
    }

    #[tokio::test]
    async fn corrupt_entry_is_replaced_on_commit() {
        let cache = Arc::new(MapCache::default());
        cache.insert("adaptive_engine:bad", "{not json");
        let store = store(cache.clone());
        let id = SessionId::new("bad");

        let mut handle = store.load(&id).await;
        assert_eq!(handle.source(), LoadSource::Fresh);
        store.commit(&mut handle, None).await.unwrap();
        assert_eq!(store.load(&id).await.source(), LoadSource::Cache);
    }

    #[tokio::test]
    async fn fallback_is_consulted_on_miss_and_mirrored_on_save() {
        let cache = Arc::new(MapCache::default());
        let fallback = Arc::new(MemoryFallback::default());
        let store = store(cache.clone()).with_fallback(fallback.clone());
        let id = SessionId::new("durable");

        let mut handle = store.load(&id).await;
        let item = handle.engine.next_item(&bank()).unwrap();
        handle.engine.submit_response(item, false, 100).unwrap();
        store.save(&handle.engine, None).await.unwrap();

        // Lose the cache entry; the mirrored snapshot is picked up.
        store.delete(&id).await;
        let restored = store.load(&id).await;
        assert_eq!(restored.source(), LoadSource::Fallback);
        assert_eq!(restored.engine.state().item_count(), 1);

        // Discarding clears both copies.
        store.save(&restored.engine, None).await.unwrap();
        store.discard(&id).await;
        assert_eq!(fallback.len(), 0);
        assert!(!store.exists(&id).await);
        assert_eq!(store.load(&id).await.source(), LoadSource::Fresh);
    }

    #[tokio::test]
    async fn ttl_management_and_listing() {
        let store = store(Arc::new(MapCache::default()));
        let a = SessionId::new("a");
        let b = SessionId::new("b");

        for id in [&b, &a] {
            let handle = store.load(id).await;
            store
                .save(&handle.engine, Some(Duration::from_secs(60)))
                .await
                .unwrap();
        }

        assert!(store.exists(&a).await);
        assert_eq!(store.ttl(&a).await, Some(Duration::from_secs(60)));
        assert!(store.extend_ttl(&a, Duration::from_secs(30)).await);
        assert_eq!(store.ttl(&a).await, Some(Duration::from_secs(90)));
        assert!(!store.extend_ttl(&SessionId::new("zzz"), Duration::from_secs(1)).await);

        assert_eq!(store.active_sessions().await, vec![a.clone(), b.clone()]);

        let summary = store.summary(&a).await.unwrap();
        assert_eq!(summary.items, 0);
        assert_eq!(summary.status, SessionStatus::AwaitingFirstItem);
        assert_eq!(summary.ttl_secs, Some(90));

        assert!(store.delete(&a).await);
        assert!(store.summary(&a).await.is_none());
    }
}
