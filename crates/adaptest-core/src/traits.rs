//! Async traits for the engine's external collaborators.
//!
//! Implementations live in the `adaptest-store` crate. Every collaborator is
//! injected as a trait object; nothing here is a process-wide singleton.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::model::{Item, ItemId, SessionId, SessionState};
use crate::scoring::ScoreSummary;

// ---------------------------------------------------------------------------
// Item bank
// ---------------------------------------------------------------------------

/// Read-only source of calibrated items.
#[async_trait]
pub trait ItemBank: Send + Sync {
    /// Look up a single item. Returns `Ok(None)` for unknown ids.
    async fn get_item(&self, id: ItemId) -> anyhow::Result<Option<Item>>;

    /// All items eligible for selection, optionally restricted to one topic.
    async fn list_candidates(&self, topic: Option<&str>) -> anyhow::Result<Vec<Item>>;
}

// ---------------------------------------------------------------------------
// Cache backend
// ---------------------------------------------------------------------------

/// Key/value cache with expiration, modeled on the usual
/// GET/SET/DEL/EXPIRE/TTL command set.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Unconditional write.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Reset the expiration of an existing key. Returns `false` on a miss.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Remaining lifetime, `None` when the key does not exist.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// Live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Atomically replace the value at `key` if it currently equals
    /// `expected` (`None` meaning absent). Returns `false` when it does not.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, CacheError>;
}

// ---------------------------------------------------------------------------
// Durable storage
// ---------------------------------------------------------------------------

/// The record written once per completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub state: SessionState,
    pub summary: ScoreSummary,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Durable store for final results.
#[async_trait]
pub trait ResultsStore: Send + Sync {
    /// Persist the final result. Writing the same session twice is a no-op
    /// and returns `false`.
    async fn record_final(&self, result: &FinalResult) -> anyhow::Result<bool>;

    async fn get(&self, session_id: &SessionId) -> anyhow::Result<Option<FinalResult>>;
}

/// Durable copy of in-progress snapshots, consulted when the cache misses.
#[async_trait]
pub trait SnapshotFallback: Send + Sync {
    async fn load(&self, session_id: &SessionId) -> anyhow::Result<Option<SessionState>>;

    async fn store(&self, state: &SessionState) -> anyhow::Result<()>;

    /// Drop the snapshot. Deleting an unknown session is not an error.
    async fn delete(&self, session_id: &SessionId) -> anyhow::Result<()>;
}
