//! Request-level orchestration of exam sessions.
//!
//! Each call loads the session's engine from the state store, performs one
//! engine operation, and commits the result. On completion the final state
//! and score summary are written once to the results store and the cached
//! snapshot is dropped.

use std::sync::Arc;

use thiserror::Error;

use crate::engine::SubmitOutcome;
use crate::error::{CatError, StoreError};
use crate::model::{Answer, Item, ItemId, SessionId, SessionState};
use crate::scoring::{ScoreConverter, ScoreSummary};
use crate::state_store::{LoadSource, SessionHandle, SessionStateStore};
use crate::stopping::StopReason;
use crate::traits::{FinalResult, ItemBank, ResultsStore};

/// Errors surfaced to the request layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] CatError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("item bank error: {0:#}")]
    Bank(anyhow::Error),

    #[error("results store error: {0:#}")]
    Results(anyhow::Error),
}

impl ServiceError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, ServiceError::Engine(e) if e.is_client_error())
    }

    /// A concurrent request won the race; reloading and retrying is safe.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::Store(StoreError::VersionConflict { .. }))
    }
}

/// What the test-taker sees next.
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    Question(Item),
    Finished(ScoreSummary),
}

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub outcome: SubmitOutcome,
    /// Present once the submission completed the session.
    pub summary: Option<ScoreSummary>,
}

/// Ties the engine to the item bank, the session store and the results store.
#[derive(Clone)]
pub struct ExamService {
    bank: Arc<dyn ItemBank>,
    store: SessionStateStore,
    results: Arc<dyn ResultsStore>,
    converter: ScoreConverter,
}

impl ExamService {
    pub fn new(
        bank: Arc<dyn ItemBank>,
        store: SessionStateStore,
        results: Arc<dyn ResultsStore>,
        converter: ScoreConverter,
    ) -> Self {
        Self {
            bank,
            store,
            results,
            converter,
        }
    }

    pub fn store(&self) -> &SessionStateStore {
        &self.store
    }

    /// Issue the next question, or the final score when the session is over.
    ///
    /// An exhausted pool completes the session with
    /// [`StopReason::PoolExhausted`] instead of failing.
    pub async fn next_question(&self, session_id: &SessionId) -> Result<NextStep, ServiceError> {
        let mut handle = self.store.load(session_id).await;
        if let Some(result) = self.recorded(&handle).await? {
            return Ok(NextStep::Finished(result.summary));
        }
        if handle.engine.is_completed() {
            return Ok(NextStep::Finished(self.finalize(&mut handle).await?));
        }

        let candidates = self
            .bank
            .list_candidates(None)
            .await
            .map_err(ServiceError::Bank)?;

        match handle.engine.next_item(&candidates) {
            Ok(item_id) => {
                let item = match candidates.into_iter().find(|item| item.id == item_id) {
                    Some(item) => item,
                    None => self.lookup(item_id).await?,
                };
                self.store.commit(&mut handle, None).await?;
                Ok(NextStep::Question(item))
            }
            Err(CatError::NoEligibleItem) => {
                tracing::info!(session = %session_id, "item pool exhausted");
                handle.engine.finish(StopReason::PoolExhausted)?;
                Ok(NextStep::Finished(self.finalize(&mut handle).await?))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Score and record an answer to the pending item.
    pub async fn submit(
        &self,
        session_id: &SessionId,
        item_id: ItemId,
        answer: &Answer,
        response_time_ms: u64,
    ) -> Result<SubmitReceipt, ServiceError> {
        let mut handle = self.store.load(session_id).await;
        if self.recorded(&handle).await?.is_some() {
            return Err(CatError::SessionClosed(session_id.clone()).into());
        }

        let key = match answer {
            Answer::Scored { .. } => None,
            _ => self.lookup(item_id).await?.answer_key,
        };
        let outcome =
            handle
                .engine
                .submit_answer(item_id, answer, key.as_ref(), response_time_ms)?;

        if let Some(degraded) = &outcome.degraded {
            tracing::warn!(session = %session_id, item = %item_id, "{degraded}");
        }

        let summary = if outcome.is_completed() {
            Some(self.finalize(&mut handle).await?)
        } else {
            self.store.commit(&mut handle, None).await?;
            None
        };

        Ok(SubmitReceipt { outcome, summary })
    }

    /// Current state of a session: cached, recorded, or fresh.
    pub async fn session_state(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionState, ServiceError> {
        let handle = self.store.load(session_id).await;
        match self.recorded(&handle).await? {
            Some(result) => Ok(result.state),
            None => Ok(handle.engine.get_state()),
        }
    }

    /// The durable final result, once the session has completed.
    pub async fn final_result(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<FinalResult>, ServiceError> {
        self.results
            .get(session_id)
            .await
            .map_err(ServiceError::Results)
    }

    /// A session with no stored snapshot may already be finished; its cache
    /// entry is dropped once the final result is durable.
    async fn recorded(&self, handle: &SessionHandle) -> Result<Option<FinalResult>, ServiceError> {
        if handle.source() != LoadSource::Fresh {
            return Ok(None);
        }
        self.results
            .get(handle.engine.session_id())
            .await
            .map_err(ServiceError::Results)
    }

    async fn lookup(&self, item_id: ItemId) -> Result<Item, ServiceError> {
        self.bank
            .get_item(item_id)
            .await
            .map_err(ServiceError::Bank)?
            .ok_or(CatError::ItemNotFound(item_id).into())
    }

    /// Commit the completed state, write the final result once, then drop the
    /// cached snapshot. Safe to repeat: the results store ignores a second
    /// write for the same session.
    async fn finalize(&self, handle: &mut SessionHandle) -> Result<ScoreSummary, ServiceError> {
        self.store.commit(handle, None).await?;

        let state = handle.engine.get_state();
        let summary = handle.engine.summary(&self.converter);
        let session_id = state.session_id.clone();
        let result = FinalResult {
            state,
            summary: summary.clone(),
            recorded_at: chrono::Utc::now(),
        };

        let written = self
            .results
            .record_final(&result)
            .await
            .map_err(ServiceError::Results)?;
        if written {
            tracing::info!(
                session = %session_id,
                theta = summary.theta,
                score = summary.score_0_100,
                grade = summary.grade_numeric,
                "final result recorded"
            );
        }
        self.store.discard(&session_id).await;
        Ok(summary)
    }
}
