//! Core data model types for adaptest.
//!
//! Items come from an external, read-only item bank. Responses and session
//! state are owned by a single [`AdaptiveEngine`](crate::engine::AdaptiveEngine)
//! and serialized after every mutation.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CatError;
use crate::stopping::StopReason;

/// Identifier of an item in the bank.
///
/// Ordered numerically; the selector uses that order as its final tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an exam session; also the cache key suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random v4 UUID session id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three 3PL parameters of an item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemParams {
    /// Discrimination.
    pub a: f64,
    /// Difficulty.
    pub b: f64,
    /// Pseudo-guessing lower asymptote.
    pub c: f64,
}

impl ItemParams {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }
}

/// An item as supplied by the bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub a: f64,
    pub b: f64,
    #[serde(default)]
    pub c: f64,
    /// Content area used for balancing and candidate filtering.
    #[serde(default)]
    pub topic: Option<String>,
    /// How a typed answer to this item is scored, if the bank knows.
    #[serde(default)]
    pub answer_key: Option<AnswerKey>,
}

impl Item {
    pub fn new(id: u64, a: f64, b: f64, c: f64) -> Self {
        Self {
            id: ItemId(id),
            a,
            b,
            c,
            topic: None,
            answer_key: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_answer_key(mut self, key: AnswerKey) -> Self {
        self.answer_key = Some(key);
        self
    }

    pub fn params(&self) -> ItemParams {
        ItemParams::new(self.a, self.b, self.c)
    }

    /// Check the parameters are inside the 3PL domain: finite values,
    /// `a > 0` and `0 <= c < 1`.
    pub fn validate(&self) -> Result<(), CatError> {
        let invalid = |reason: &str| CatError::InvalidItem {
            id: self.id,
            reason: reason.to_string(),
        };
        if !(self.a.is_finite() && self.b.is_finite() && self.c.is_finite()) {
            return Err(invalid("parameters must be finite"));
        }
        if self.a <= 0.0 {
            return Err(invalid("discrimination `a` must be positive"));
        }
        if !(0.0..1.0).contains(&self.c) {
            return Err(invalid("guessing `c` must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Scoring key for an item, one variant per item type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerKey {
    MultipleChoice {
        correct: u32,
    },
    FreeResponse {
        accepted: Vec<String>,
        #[serde(default)]
        case_sensitive: bool,
    },
}

impl AnswerKey {
    fn kind(&self) -> &'static str {
        match self {
            AnswerKey::MultipleChoice { .. } => "multiple_choice",
            AnswerKey::FreeResponse { .. } => "free_response",
        }
    }
}

/// A test-taker's answer payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Answer {
    MultipleChoice { choice: u32 },
    FreeResponse { text: String },
    /// Already scored by an external grader.
    Scored { correct: bool },
}

impl Answer {
    fn kind(&self) -> &'static str {
        match self {
            Answer::MultipleChoice { .. } => "multiple_choice",
            Answer::FreeResponse { .. } => "free_response",
            Answer::Scored { .. } => "scored",
        }
    }

    /// Decide correctness against the item's key.
    pub fn is_correct(&self, key: Option<&AnswerKey>) -> Result<bool, CatError> {
        match (self, key) {
            (Answer::Scored { correct }, _) => Ok(*correct),
            (Answer::MultipleChoice { choice }, Some(AnswerKey::MultipleChoice { correct })) => {
                Ok(choice == correct)
            }
            (
                Answer::FreeResponse { text },
                Some(AnswerKey::FreeResponse {
                    accepted,
                    case_sensitive,
                }),
            ) => {
                let given = text.trim();
                Ok(accepted.iter().any(|candidate| {
                    let candidate = candidate.trim();
                    if *case_sensitive {
                        candidate == given
                    } else {
                        candidate.eq_ignore_ascii_case(given)
                    }
                }))
            }
            (answer, key) => Err(CatError::AnswerKindMismatch {
                answer: answer.kind(),
                key: key.map(AnswerKey::kind).unwrap_or("none"),
            }),
        }
    }
}

/// One scored response. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub item_id: ItemId,
    pub correct: bool,
    pub response_time_ms: u64,
    pub theta_before: f64,
    pub theta_after: f64,
    /// Item parameters as they were when the item was issued.
    pub params: ItemParams,
    #[serde(default)]
    pub topic: Option<String>,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    AwaitingFirstItem,
    InProgress,
    Completed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::AwaitingFirstItem => write!(f, "awaiting_first_item"),
            SessionStatus::InProgress => write!(f, "in_progress"),
            SessionStatus::Completed => write!(f, "completed"),
        }
    }
}

/// An item that has been issued but not answered yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingItem {
    pub item_id: ItemId,
    pub params: ItemParams,
    #[serde(default)]
    pub topic: Option<String>,
}

/// Serializable state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub theta: f64,
    pub standard_error: f64,
    /// In administration order, without duplicates.
    pub administered_item_ids: Vec<ItemId>,
    /// Parallel to `administered_item_ids`.
    pub responses: Vec<Response>,
    pub status: SessionStatus,
    #[serde(default)]
    pub pending: Option<PendingItem>,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    /// Number of updates where the estimator kept the previous estimate.
    #[serde(default)]
    pub degraded_updates: u32,
}

impl SessionState {
    pub fn new(session_id: SessionId, theta: f64, standard_error: f64) -> Self {
        Self {
            session_id,
            theta,
            standard_error,
            administered_item_ids: Vec::new(),
            responses: Vec::new(),
            status: SessionStatus::AwaitingFirstItem,
            pending: None,
            stop_reason: None,
            degraded_updates: 0,
        }
    }

    pub fn item_count(&self) -> usize {
        self.responses.len()
    }

    pub fn correct_count(&self) -> usize {
        self.responses.iter().filter(|r| r.correct).count()
    }

    /// Sum of response times across all answered items.
    pub fn elapsed_ms(&self) -> u64 {
        self.responses.iter().map(|r| r.response_time_ms).sum()
    }

    /// How many answered items fall under each topic.
    pub fn topic_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for topic in self.responses.iter().filter_map(|r| r.topic.as_ref()) {
            *counts.entry(topic.clone()).or_insert(0) += 1;
        }
        counts
    }
}
