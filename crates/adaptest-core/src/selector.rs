//! Maximum-information item selection.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CatError;
use crate::irt;
use crate::model::{Item, ItemId};

/// Information is compared on a grid of this resolution so that values that
/// differ only by rounding noise tie.
const INFO_RESOLUTION: f64 = 1e-12;

/// Selection policy knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    /// Soft cap on administered items per topic.
    #[serde(default)]
    pub max_per_topic: Option<usize>,
}

/// An item together with its information at the theta it was ranked at.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    pub id: ItemId,
    pub information: f64,
    pub distance: f64,
}

/// Picks the most informative eligible item.
///
/// Ordering: highest Fisher information, then smallest `|b - theta|`, then
/// lowest item id. Selection is pure; marking the item administered is the
/// caller's job.
#[derive(Debug, Clone, Default)]
pub struct ItemSelector {
    policy: SelectionPolicy,
}

impl ItemSelector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    /// Select the next item from `candidates` that is not in `excluded`.
    pub fn select_next(
        &self,
        theta: f64,
        excluded: &HashSet<ItemId>,
        candidates: &[Item],
    ) -> Result<ItemId, CatError> {
        candidates
            .iter()
            .filter(|item| !excluded.contains(&item.id))
            .map(|item| rank(item, theta))
            .min_by(compare_ranked)
            .map(|ranked| ranked.id)
            .ok_or(CatError::NoEligibleItem)
    }

    /// Like [`select_next`](Self::select_next), honouring the topic cap.
    ///
    /// Items whose topic already reached `max_per_topic` are skipped. When the
    /// cap would leave nothing eligible it is relaxed instead of failing.
    pub fn select_balanced(
        &self,
        theta: f64,
        excluded: &HashSet<ItemId>,
        candidates: &[Item],
        topic_counts: &HashMap<String, usize>,
    ) -> Result<ItemId, CatError> {
        let Some(cap) = self.policy.max_per_topic else {
            return self.select_next(theta, excluded, candidates);
        };

        let within_cap: Vec<Item> = candidates
            .iter()
            .filter(|item| match &item.topic {
                Some(topic) => topic_counts.get(topic).copied().unwrap_or(0) < cap,
                None => true,
            })
            .cloned()
            .collect();

        match self.select_next(theta, excluded, &within_cap) {
            Err(CatError::NoEligibleItem) => {
                tracing::warn!(cap, "every remaining topic is at its cap, relaxing");
                self.select_next(theta, excluded, candidates)
            }
            other => other,
        }
    }

    /// All non-excluded candidates in selection order.
    pub fn rank_by_information(
        &self,
        theta: f64,
        excluded: &HashSet<ItemId>,
        candidates: &[Item],
    ) -> Vec<RankedItem> {
        let mut ranked: Vec<RankedItem> = candidates
            .iter()
            .filter(|item| !excluded.contains(&item.id))
            .map(|item| rank(item, theta))
            .collect();
        ranked.sort_by(compare_ranked);
        ranked
    }
}

fn rank(item: &Item, theta: f64) -> RankedItem {
    let information = irt::information(&item.params(), theta);
    RankedItem {
        id: item.id,
        information: if information.is_finite() {
            information
        } else {
            0.0
        },
        distance: (item.b - theta).abs(),
    }
}

/// Information rounded to `INFO_RESOLUTION`. Kept as `f64` so very
/// discriminating items never saturate into a tie.
fn information_key(information: f64) -> f64 {
    (information / INFO_RESOLUTION).round()
}

/// Total order where `Less` means "select first".
fn compare_ranked(x: &RankedItem, y: &RankedItem) -> Ordering {
    information_key(y.information)
        .total_cmp(&information_key(x.information))
        .then_with(|| x.distance.total_cmp(&y.distance))
        .then_with(|| x.id.cmp(&y.id))
}
