//! Adaptive session engine.
//!
//! One [`AdaptiveEngine`] owns the state machine of one session:
//!
//! ```text
//! AWAITING_FIRST_ITEM --next_item--> IN_PROGRESS --submit_response--> COMPLETED
//! ```
//!
//! It is the only component that mutates theta and the response history. The
//! engine performs no I/O; callers load it through the session state store,
//! call one operation, and save it back.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{CatError, EstimationDegraded};
use crate::estimator::{AbilityEstimator, EstimatorConfig, ScoredItem};
use crate::model::{
    Answer, AnswerKey, Item, ItemId, PendingItem, Response, SessionId, SessionState, SessionStatus,
};
use crate::scoring::{ScoreConverter, ScoreSummary};
use crate::selector::{ItemSelector, SelectionPolicy};
use crate::stopping::{StopReason, StoppingRule};

/// Configuration for the adaptive engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub selection: SelectionPolicy,
    #[serde(default)]
    pub stopping: StoppingRule,
}

/// What a submission did to the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub response: Response,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
    /// Present when the estimator kept the previous theta.
    pub degraded: Option<EstimationDegraded>,
}

impl SubmitOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// The per-session CAT state machine.
#[derive(Debug, Clone)]
pub struct AdaptiveEngine {
    state: SessionState,
    estimator: AbilityEstimator,
    selector: ItemSelector,
    stopping: StoppingRule,
}

impl AdaptiveEngine {
    /// A fresh session at the configured prior.
    pub fn new(session_id: SessionId, config: EngineConfig) -> Self {
        let estimator = AbilityEstimator::new(config.estimator);
        let prior = estimator.prior();
        Self {
            state: SessionState::new(session_id, prior.theta, prior.standard_error),
            estimator,
            selector: ItemSelector::new(config.selection),
            stopping: config.stopping,
        }
    }

    /// Rebuild an engine from a snapshot produced by [`get_state`](Self::get_state).
    pub fn restore(snapshot: SessionState, config: EngineConfig) -> Result<Self, CatError> {
        validate_snapshot(&snapshot, &config.estimator)?;
        Ok(Self {
            state: snapshot,
            estimator: AbilityEstimator::new(config.estimator),
            selector: ItemSelector::new(config.selection),
            stopping: config.stopping,
        })
    }

    /// Serializable snapshot of the session. Available in every state so the
    /// final state of a completed session can still be persisted.
    pub fn get_state(&self) -> SessionState {
        self.state.clone()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn session_id(&self) -> &SessionId {
        &self.state.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn theta(&self) -> f64 {
        self.state.theta
    }

    pub fn standard_error(&self) -> f64 {
        self.state.standard_error
    }

    pub fn is_completed(&self) -> bool {
        self.state.status == SessionStatus::Completed
    }

    pub fn pending_item(&self) -> Option<ItemId> {
        self.state.pending.as_ref().map(|p| p.item_id)
    }

    /// Administered items plus the pending one.
    pub fn excluded_ids(&self) -> HashSet<ItemId> {
        self.state
            .administered_item_ids
            .iter()
            .copied()
            .chain(self.pending_item())
            .collect()
    }

    /// Issue the next item.
    ///
    /// While an item is pending it is issued again instead of selecting a new
    /// one, so a repeated request from a stateless caller is harmless.
    pub fn next_item(&mut self, candidates: &[Item]) -> Result<ItemId, CatError> {
        self.ensure_open()?;

        if let Some(pending) = self.pending_item() {
            tracing::debug!(session = %self.state.session_id, item = %pending, "re-issuing pending item");
            return Ok(pending);
        }

        let item_id = self.selector.select_balanced(
            self.state.theta,
            &self.excluded_ids(),
            candidates,
            &self.state.topic_counts(),
        )?;
        let item = candidates
            .iter()
            .find(|item| item.id == item_id)
            .ok_or(CatError::ItemNotFound(item_id))?;

        self.state.pending = Some(PendingItem {
            item_id,
            params: item.params(),
            topic: item.topic.clone(),
        });
        if self.state.status == SessionStatus::AwaitingFirstItem {
            self.state.status = SessionStatus::InProgress;
            tracing::info!(session = %self.state.session_id, "session started");
        }
        tracing::debug!(
            session = %self.state.session_id,
            item = %item_id,
            theta = self.state.theta,
            "issued item"
        );
        Ok(item_id)
    }

    /// Record a scored response to the pending item.
    pub fn submit_response(
        &mut self,
        item_id: ItemId,
        correct: bool,
        response_time_ms: u64,
    ) -> Result<SubmitOutcome, CatError> {
        self.ensure_open()?;
        let pending = self.take_pending(item_id)?;

        let theta_before = self.state.theta;
        let mut history: Vec<ScoredItem> =
            self.state.responses.iter().map(ScoredItem::from).collect();
        history.push(ScoredItem::new(pending.params, correct));

        let estimate =
            self.estimator
                .update(&history, self.state.theta, self.state.standard_error);
        if estimate.degraded.is_some() {
            self.state.degraded_updates += 1;
        }
        self.state.theta = estimate.theta;
        self.state.standard_error = estimate.standard_error;

        let response = Response {
            item_id,
            correct,
            response_time_ms,
            theta_before,
            theta_after: estimate.theta,
            params: pending.params,
            topic: pending.topic,
        };
        self.state.administered_item_ids.push(item_id);
        self.state.responses.push(response.clone());

        let stop_reason = self.stopping.evaluate(
            self.state.item_count(),
            self.state.standard_error,
            self.state.elapsed_ms(),
        );
        if let Some(reason) = stop_reason {
            self.complete(reason);
        }

        Ok(SubmitOutcome {
            response,
            status: self.state.status,
            stop_reason,
            degraded: estimate.degraded,
        })
    }

    /// Score a typed answer against the item's key, then record it.
    pub fn submit_answer(
        &mut self,
        item_id: ItemId,
        answer: &Answer,
        key: Option<&AnswerKey>,
        response_time_ms: u64,
    ) -> Result<SubmitOutcome, CatError> {
        self.ensure_open()?;
        self.check_pending(item_id)?;
        let correct = answer.is_correct(key)?;
        self.submit_response(item_id, correct, response_time_ms)
    }

    /// Complete the session before the stopping rule fired, e.g. when the
    /// pool is exhausted. Any pending item is dropped unanswered.
    pub fn finish(&mut self, reason: StopReason) -> Result<(), CatError> {
        self.ensure_open()?;
        if let Some(dropped) = self.state.pending.take() {
            tracing::warn!(
                session = %self.state.session_id,
                item = %dropped.item_id,
                "dropping unanswered item on finish"
            );
        }
        self.complete(reason);
        Ok(())
    }

    /// Score artifacts for the current estimate.
    pub fn summary(&self, converter: &ScoreConverter) -> ScoreSummary {
        converter.convert(self.state.theta, self.state.standard_error)
    }

    fn complete(&mut self, reason: StopReason) {
        self.state.status = SessionStatus::Completed;
        self.state.stop_reason = Some(reason);
        tracing::info!(
            session = %self.state.session_id,
            %reason,
            items = self.state.item_count(),
            theta = self.state.theta,
            se = self.state.standard_error,
            "session completed"
        );
    }

    fn ensure_open(&self) -> Result<(), CatError> {
        if self.is_completed() {
            return Err(CatError::SessionClosed(self.state.session_id.clone()));
        }
        Ok(())
    }

    fn check_pending(&self, item_id: ItemId) -> Result<(), CatError> {
        match self.pending_item() {
            Some(pending) if pending == item_id => Ok(()),
            expected => Err(CatError::InvalidSequence {
                expected,
                got: item_id,
            }),
        }
    }

    fn take_pending(&mut self, item_id: ItemId) -> Result<PendingItem, CatError> {
        self.check_pending(item_id)?;
        self.state
            .pending
            .take()
            .ok_or(CatError::InvalidSequence {
                expected: None,
                got: item_id,
            })
    }
}

fn validate_snapshot(state: &SessionState, estimator: &EstimatorConfig) -> Result<(), CatError> {
    let corrupt = |msg: String| Err(CatError::CorruptSnapshot(msg));

    if state.administered_item_ids.len() != state.responses.len() {
        return corrupt(format!(
            "{} administered items but {} responses",
            state.administered_item_ids.len(),
            state.responses.len()
        ));
    }
    let mut seen = HashSet::new();
    for (id, response) in state.administered_item_ids.iter().zip(&state.responses) {
        if !seen.insert(*id) {
            return corrupt(format!("item {id} administered twice"));
        }
        if response.item_id != *id {
            return corrupt(format!(
                "response for {} recorded against {id}",
                response.item_id
            ));
        }
    }
    if !state.theta.is_finite()
        || state.theta < estimator.theta_min
        || state.theta > estimator.theta_max
    {
        return corrupt(format!("theta {} outside bounds", state.theta));
    }
    if !(state.standard_error >= 0.0) {
        return corrupt(format!("negative standard error {}", state.standard_error));
    }
    if let Some(pending) = &state.pending {
        if seen.contains(&pending.item_id) {
            return corrupt(format!("pending item {} already answered", pending.item_id));
        }
    }
    match state.status {
        SessionStatus::AwaitingFirstItem if !state.responses.is_empty() || state.pending.is_some() => {
            corrupt("awaiting first item but items were issued".to_string())
        }
        SessionStatus::Completed if state.pending.is_some() => {
            corrupt("completed session with a pending item".to_string())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> Vec<Item> {
        (0..30)
            .map(|i| {
                let b = -3.0 + i as f64 * 0.2;
                Item::new(i + 1, 0.8 + (i % 5) as f64 * 0.3, b, 0.2)
            })
            .collect()
    }

    fn engine(min_items: usize, max_items: usize) -> AdaptiveEngine {
        AdaptiveEngine::new(
            SessionId::new("test-session"),
            EngineConfig {
                stopping: StoppingRule {
                    min_items,
                    max_items,
                    se_threshold: 0.3,
                    time_limit_ms: None,
                },
                ..EngineConfig::default()
            },
        )
    }

    #[test]
    fn new_engine_starts_at_prior() {
        let e = engine(5, 20);
        assert_eq!(e.status(), SessionStatus::AwaitingFirstItem);
        assert_eq!(e.theta(), 0.0);
        assert_eq!(e.standard_error(), 1.0);
        assert!(e.pending_item().is_none());
    }

    #[test]
    fn lifecycle_visits_each_state_once() {
        let mut e = engine(3, 6);
        let bank = bank();
        let mut seen = vec![e.status()];
        let mut answer = true;
        while !e.is_completed() {
            let item = e.next_item(&bank).unwrap();
            if *seen.last().unwrap() != e.status() {
                seen.push(e.status());
            }
            e.submit_response(item, answer, 2_000).unwrap();
            answer = !answer;
            if *seen.last().unwrap() != e.status() {
                seen.push(e.status());
            }
        }
        assert_eq!(
            seen,
            vec![
                SessionStatus::AwaitingFirstItem,
                SessionStatus::InProgress,
                SessionStatus::Completed
            ]
        );
        assert!(e.state().item_count() <= 6);
        assert!(e.state().stop_reason.is_some());
    }

    #[test]
    fn no_item_is_administered_twice() {
        let mut e = engine(20, 20);
        let bank = bank();
        for i in 0..20 {
            let item = e.next_item(&bank).unwrap();
            e.submit_response(item, i % 3 != 0, 1_000).unwrap();
        }
        let ids = &e.state().administered_item_ids;
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
        assert_eq!(ids.len(), e.state().responses.len());
        assert_eq!(e.state().stop_reason, Some(StopReason::MaxItems));
    }

    #[test]
    fn next_item_reissues_pending() {
        let mut e = engine(5, 20);
        let bank = bank();
        let first = e.next_item(&bank).unwrap();
        let again = e.next_item(&bank).unwrap();
        assert_eq!(first, again);
        assert_eq!(e.state().administered_item_ids.len(), 0);
    }

    #[test]
    fn correct_first_answer_raises_theta() {
        let mut e = engine(5, 20);
        let bank = vec![Item::new(1, 1.0, 0.0, 0.2), Item::new(2, 1.0, 1.0, 0.2)];
        let item = e.next_item(&bank).unwrap();
        let outcome = e.submit_response(item, true, 500).unwrap();
        assert!(outcome.response.theta_after > outcome.response.theta_before);
        assert!(e.theta() > 0.0);
    }

    #[test]
    fn submission_for_wrong_item_is_rejected() {
        let mut e = engine(5, 20);
        let bank = bank();
        let item = e.next_item(&bank).unwrap();
        let wrong = ItemId(item.0 + 1000);
        let err = e.submit_response(wrong, true, 100).unwrap_err();
        assert_eq!(
            err,
            CatError::InvalidSequence {
                expected: Some(item),
                got: wrong
            }
        );
        // Pending item survives a rejected submission.
        assert_eq!(e.pending_item(), Some(item));
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let mut e = engine(5, 20);
        let bank = bank();
        let item = e.next_item(&bank).unwrap();
        e.submit_response(item, true, 100).unwrap();
        let err = e.submit_response(item, true, 100).unwrap_err();
        assert!(matches!(
            err,
            CatError::InvalidSequence { expected: None, .. }
        ));
        assert_eq!(e.state().responses.len(), 1);
    }

    #[test]
    fn submission_before_first_item_is_rejected() {
        let mut e = engine(5, 20);
        assert!(matches!(
            e.submit_response(ItemId(1), true, 100),
            Err(CatError::InvalidSequence { expected: None, .. })
        ));
    }

    #[test]
    fn completed_engine_rejects_mutation() {
        let mut e = engine(1, 1);
        let bank = bank();
        let item = e.next_item(&bank).unwrap();
        let outcome = e.submit_response(item, false, 100).unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.stop_reason, Some(StopReason::MaxItems));

        let closed = CatError::SessionClosed(SessionId::new("test-session"));
        assert_eq!(e.next_item(&bank).unwrap_err(), closed);
        assert_eq!(e.submit_response(item, true, 1).unwrap_err(), closed);
        assert_eq!(e.finish(StopReason::TimeLimit).unwrap_err(), closed);
        // Reading the state is still allowed.
        assert_eq!(e.get_state().status, SessionStatus::Completed);
    }

    #[test]
    fn exhausted_pool_then_finish() {
        let mut e = engine(5, 20);
        let bank = vec![Item::new(1, 1.0, 0.0, 0.2)];
        let item = e.next_item(&bank).unwrap();
        e.submit_response(item, true, 100).unwrap();
        assert_eq!(e.next_item(&bank), Err(CatError::NoEligibleItem));
        e.finish(StopReason::PoolExhausted).unwrap();
        assert_eq!(e.state().stop_reason, Some(StopReason::PoolExhausted));
    }

    #[test]
    fn get_state_is_idempotent() {
        let mut e = engine(5, 20);
        let bank = bank();
        let item = e.next_item(&bank).unwrap();
        e.submit_response(item, true, 100).unwrap();
        e.next_item(&bank).unwrap();
        assert_eq!(e.get_state(), e.get_state());
    }

    #[test]
    fn restore_round_trip_continues_identically() {
        let mut original = engine(5, 20);
        let bank = bank();
        for correct in [true, false, true] {
            let item = original.next_item(&bank).unwrap();
            original.submit_response(item, correct, 1_500).unwrap();
        }

        let json = serde_json::to_string(&original.get_state()).unwrap();
        let snapshot: SessionState = serde_json::from_str(&json).unwrap();
        let mut restored = AdaptiveEngine::restore(snapshot, EngineConfig::default()).unwrap();

        assert_eq!(restored.theta(), original.theta());
        assert_eq!(restored.standard_error(), original.standard_error());
        assert_eq!(
            restored.next_item(&bank).unwrap(),
            original.next_item(&bank).unwrap()
        );
    }

    #[test]
    fn restore_rejects_corrupt_snapshots() {
        let mut e = engine(5, 20);
        let bank = bank();
        let item = e.next_item(&bank).unwrap();
        e.submit_response(item, true, 100).unwrap();

        let mut dup = e.get_state();
        dup.administered_item_ids.push(item);
        dup.responses.push(dup.responses[0].clone());
        assert!(matches!(
            AdaptiveEngine::restore(dup, EngineConfig::default()),
            Err(CatError::CorruptSnapshot(_))
        ));

        let mut short = e.get_state();
        short.responses.clear();
        assert!(AdaptiveEngine::restore(short, EngineConfig::default()).is_err());

        let mut out_of_bounds = e.get_state();
        out_of_bounds.theta = 9.0;
        assert!(AdaptiveEngine::restore(out_of_bounds, EngineConfig::default()).is_err());
    }

    #[test]
    fn typed_answers_are_scored() {
        let mut e = engine(5, 20);
        let key = AnswerKey::MultipleChoice { correct: 2 };
        let bank = vec![Item::new(1, 1.0, 0.0, 0.2).with_answer_key(key.clone())];
        let item = e.next_item(&bank).unwrap();

        let err = e
            .submit_answer(item, &Answer::FreeResponse { text: "2".into() }, Some(&key), 10)
            .unwrap_err();
        assert!(matches!(err, CatError::AnswerKindMismatch { .. }));

        let outcome = e
            .submit_answer(item, &Answer::MultipleChoice { choice: 2 }, Some(&key), 10)
            .unwrap();
        assert!(outcome.response.correct);
    }

    #[test]
    fn degraded_update_keeps_theta_and_is_counted() {
        let mut e = AdaptiveEngine::new(
            SessionId::new("degraded"),
            EngineConfig {
                estimator: EstimatorConfig {
                    max_iterations: 1,
                    tolerance: 1e-15,
                    ..EstimatorConfig::default()
                },
                ..EngineConfig::default()
            },
        );
        let bank = bank();
        // One correct then one incorrect forces an interior Newton solve.
        let first = e.next_item(&bank).unwrap();
        e.submit_response(first, true, 100).unwrap();
        let theta_before = e.theta();
        let second = e.next_item(&bank).unwrap();
        let outcome = e.submit_response(second, false, 100).unwrap();

        assert!(outcome.degraded.is_some());
        assert_eq!(e.theta(), theta_before);
        assert_eq!(e.state().degraded_updates, 1);
        assert_eq!(e.state().responses.len(), 2);
    }

    #[test]
    fn topic_cap_spreads_content() {
        let mut e = AdaptiveEngine::new(
            SessionId::new("balanced"),
            EngineConfig {
                selection: SelectionPolicy {
                    max_per_topic: Some(1),
                },
                ..EngineConfig::default()
            },
        );
        let bank = vec![
            Item::new(1, 2.0, 0.0, 0.0).with_topic("algebra"),
            Item::new(2, 1.9, 0.0, 0.0).with_topic("algebra"),
            Item::new(3, 0.7, 0.0, 0.0).with_topic("geometry"),
        ];
        let first = e.next_item(&bank).unwrap();
        e.submit_response(first, true, 10).unwrap();
        let second = e.next_item(&bank).unwrap();
        assert_eq!(first, ItemId(1));
        assert_eq!(second, ItemId(3));
    }
}
