//! Stopping rule: test length and precision thresholds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a session was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxItems,
    PrecisionReached,
    TimeLimit,
    /// The item pool ran out before any other rule fired.
    PoolExhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxItems => write!(f, "max_items"),
            StopReason::PrecisionReached => write!(f, "precision_reached"),
            StopReason::TimeLimit => write!(f, "time_limit"),
            StopReason::PoolExhausted => write!(f, "pool_exhausted"),
        }
    }
}

/// Stop if `item_count >= max_items`, or if at least `min_items` have been
/// administered and `se <= se_threshold`.
pub fn should_stop(
    item_count: usize,
    se: f64,
    min_items: usize,
    max_items: usize,
    se_threshold: f64,
) -> bool {
    item_count >= max_items || (item_count >= min_items && se <= se_threshold)
}

/// Configured thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingRule {
    pub min_items: usize,
    pub max_items: usize,
    pub se_threshold: f64,
    /// Cumulative response-time budget in milliseconds.
    pub time_limit_ms: Option<u64>,
}

impl Default for StoppingRule {
    fn default() -> Self {
        Self {
            min_items: 5,
            max_items: 20,
            se_threshold: 0.3,
            time_limit_ms: None,
        }
    }
}

impl StoppingRule {
    /// The reason to stop now, if any. Length is checked before precision,
    /// precision before time.
    pub fn evaluate(&self, item_count: usize, se: f64, elapsed_ms: u64) -> Option<StopReason> {
        if item_count >= self.max_items {
            return Some(StopReason::MaxItems);
        }
        if should_stop(
            item_count,
            se,
            self.min_items,
            self.max_items,
            self.se_threshold,
        ) {
            return Some(StopReason::PrecisionReached);
        }
        match self.time_limit_ms {
            Some(limit) if elapsed_ms >= limit => Some(StopReason::TimeLimit),
            _ => None,
        }
    }
}
