//! Engine error types.
//!
//! Lifecycle and sequencing violations are client errors surfaced to the
//! caller. Numerical trouble during estimation is not an error: it is reported
//! through [`EstimationDegraded`] and the previous estimate is kept. Cache
//! and store failures have their own types so callers can tell an outage
//! apart from a lost compare-and-swap.

use thiserror::Error;

use crate::model::{ItemId, SessionId};

/// Errors raised by the adaptive engine and its collaborators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatError {
    /// Every candidate item is excluded or the pool is empty.
    #[error("no eligible item left in the candidate pool")]
    NoEligibleItem,

    /// A response arrived for an item other than the pending one.
    #[error("invalid sequence: expected response for {}, got {got}", fmt_pending(.expected))]
    InvalidSequence {
        expected: Option<ItemId>,
        got: ItemId,
    },

    /// The session has already reached its terminal state.
    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    /// The item bank has no record of the requested item.
    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    /// Item parameters are outside the domain of the 3PL model.
    #[error("invalid item {id}: {reason}")]
    InvalidItem { id: ItemId, reason: String },

    /// The submitted answer kind does not match the item's answer key.
    #[error("answer kind {answer} does not match answer key kind {key}")]
    AnswerKindMismatch {
        answer: &'static str,
        key: &'static str,
    },

    /// A restored snapshot violates one of the session invariants.
    #[error("corrupt session snapshot: {0}")]
    CorruptSnapshot(String),
}

impl CatError {
    /// Returns `true` for errors caused by the caller (bad sequencing,
    /// closed session, mismatched answers) rather than by the item pool.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CatError::InvalidSequence { .. }
                | CatError::SessionClosed(_)
                | CatError::AnswerKindMismatch { .. }
        )
    }
}

fn fmt_pending(expected: &Option<ItemId>) -> String {
    match expected {
        Some(id) => id.to_string(),
        None => "none".to_string(),
    }
}

/// Non-fatal signal that an ability update could not be trusted.
///
/// The engine keeps the previous theta/SE when this is produced and records it
/// for auditing; the test-taker never sees it.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[error("estimation degraded after {iterations} iterations: {reason}")]
pub struct EstimationDegraded {
    /// Iterations spent before giving up.
    pub iterations: u32,
    /// Human-readable cause.
    pub reason: String,
}

/// Failures reported by a cache backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    /// The backend cannot be reached.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the request timeout.
    #[error("cache request timed out after {0} ms")]
    Timeout(u64),

    /// Any other backend failure.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the session state store.
///
/// Cache outages never appear here: they degrade to a miss on load and a
/// skipped write on save.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Another writer committed a newer version of the session first.
    #[error("version conflict for session {session_id}: loaded version {loaded}")]
    VersionConflict { session_id: SessionId, loaded: u64 },

    /// The session snapshot could not be encoded.
    #[error("failed to serialize session {session_id}: {reason}")]
    Serialization {
        session_id: SessionId,
        reason: String,
    },
}
