//! End-to-end session tests: exam service, state store and the store crate's
//! backends wired together the way the CLI wires them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use adaptest_core::bank::StaticItemBank;
use adaptest_core::engine::EngineConfig;
use adaptest_core::error::StoreError;
use adaptest_core::model::{Answer, AnswerKey, Item, SessionId, SessionStatus};
use adaptest_core::scoring::{ScoreConverter, ScoreSummary};
use adaptest_core::service::{ExamService, NextStep, ServiceError};
use adaptest_core::state_store::{LoadSource, SessionStateStore, StoreConfig};
use adaptest_core::stopping::{StopReason, StoppingRule};
use adaptest_core::traits::{ItemBank, ResultsStore, SnapshotFallback};
use adaptest_store::{
    InMemoryCache, InMemoryResultsStore, InMemorySnapshotFallback, JsonFileResultsStore,
};

fn algebra_bank() -> StaticItemBank {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/algebra.toml");
    StaticItemBank::from_file(&path).unwrap()
}

fn engine_config(stopping: StoppingRule) -> EngineConfig {
    EngineConfig {
        stopping,
        ..EngineConfig::default()
    }
}

fn fixed_length(items: usize) -> StoppingRule {
    StoppingRule {
        min_items: items,
        max_items: items,
        se_threshold: 0.0,
        time_limit_ms: None,
    }
}

struct Harness {
    service: ExamService,
    cache: Arc<InMemoryCache>,
}

fn harness(
    cache: InMemoryCache,
    results: Arc<dyn ResultsStore>,
    fallback: Option<Arc<InMemorySnapshotFallback>>,
    stopping: StoppingRule,
    store_config: StoreConfig,
) -> Harness {
    let cache = Arc::new(cache);
    let mut store = SessionStateStore::new(cache.clone(), engine_config(stopping), store_config);
    if let Some(fallback) = fallback {
        store = store.with_fallback(fallback);
    }
    let service = ExamService::new(
        Arc::new(algebra_bank()),
        store,
        results,
        ScoreConverter::default(),
    );
    Harness { service, cache }
}

/// The answer the item's key accepts, or a wrong one.
fn answer_for(item: &Item, correct: bool) -> Answer {
    match (&item.answer_key, correct) {
        (Some(AnswerKey::MultipleChoice { correct: choice }), true) => {
            Answer::MultipleChoice { choice: *choice }
        }
        (Some(AnswerKey::MultipleChoice { correct: choice }), false) => {
            Answer::MultipleChoice { choice: choice + 1 }
        }
        (Some(AnswerKey::FreeResponse { accepted, .. }), true) => Answer::FreeResponse {
            text: accepted[0].clone(),
        },
        (Some(AnswerKey::FreeResponse { .. }), false) => Answer::FreeResponse {
            text: "no idea".to_string(),
        },
        (None, correct) => Answer::Scored { correct },
    }
}

/// Answer questions until the session finishes. Items easier than `ability`
/// are answered correctly.
async fn run_to_completion(service: &ExamService, id: &SessionId, ability: f64) -> ScoreSummary {
    for _ in 0..100 {
        match service.next_question(id).await.unwrap() {
            NextStep::Question(item) => {
                let answer = answer_for(&item, item.b < ability);
                let receipt = service.submit(id, item.id, &answer, 20_000).await.unwrap();
                if let Some(summary) = receipt.summary {
                    return summary;
                }
            }
            NextStep::Finished(summary) => return summary,
        }
    }
    panic!("session {id} did not finish");
}

#[tokio::test]
async fn typed_answers_drive_a_full_session() {
    let results = Arc::new(InMemoryResultsStore::new());
    let h = harness(
        InMemoryCache::new(),
        results.clone(),
        None,
        StoppingRule::default(),
        StoreConfig::default(),
    );
    let id = SessionId::new("student-42");

    let summary = run_to_completion(&h.service, &id, 0.8).await;

    let stored = results.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.summary, summary);
    assert_eq!(stored.state.status, SessionStatus::Completed);
    let count = stored.state.item_count();
    assert!((5..=20).contains(&count), "administered {count} items");
    assert!(summary.theta > 0.0, "theta {}", summary.theta);

    // No item was administered twice.
    let mut ids: Vec<_> = stored.state.administered_item_ids.clone();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), count);

    // The cached snapshot is dropped and the session cannot be reopened.
    assert!(h.cache.is_empty());
    assert!(h.service.store().active_sessions().await.is_empty());
    assert_eq!(
        h.service.next_question(&id).await.unwrap(),
        NextStep::Finished(summary)
    );
}

#[tokio::test]
async fn stronger_examinee_scores_higher() {
    let results = Arc::new(InMemoryResultsStore::new());
    let h = harness(
        InMemoryCache::new(),
        results.clone(),
        None,
        fixed_length(12),
        StoreConfig::default(),
    );

    let weak = run_to_completion(&h.service, &SessionId::new("weak"), -1.0).await;
    let strong = run_to_completion(&h.service, &SessionId::new("strong"), 1.2).await;

    assert!(strong.theta > weak.theta);
    assert!(strong.score_0_100 > weak.score_0_100);
    assert!(strong.grade_numeric <= weak.grade_numeric);
    assert_eq!(results.len().await, 2);
}

#[tokio::test]
async fn store_tracks_versions_and_ttl() {
    let h = harness(
        InMemoryCache::new(),
        Arc::new(InMemoryResultsStore::new()),
        None,
        StoppingRule::default(),
        StoreConfig::default(),
    );
    let id = SessionId::new("tracked");

    let NextStep::Question(item) = h.service.next_question(&id).await.unwrap() else {
        panic!("expected a question");
    };
    h.service
        .submit(&id, item.id, &answer_for(&item, true), 5_000)
        .await
        .unwrap();

    let summary = h.service.store().summary(&id).await.unwrap();
    assert_eq!(summary.items, 1);
    assert_eq!(summary.version, 2);
    assert_eq!(summary.status, SessionStatus::InProgress);

    let before = h.service.store().ttl(&id).await.unwrap();
    assert!(
        h.service
            .store()
            .extend_ttl(&id, Duration::from_secs(600))
            .await
    );
    let after = h.service.store().ttl(&id).await.unwrap();
    assert!(after > before);
    assert_eq!(h.service.store().active_sessions().await, vec![id]);
}

#[tokio::test]
async fn concurrent_writers_conflict() {
    let h = harness(
        InMemoryCache::new(),
        Arc::new(InMemoryResultsStore::new()),
        None,
        StoppingRule::default(),
        StoreConfig::default(),
    );
    let store = h.service.store();
    let id = SessionId::new("racy");
    let items = algebra_bank().list_candidates(None).await.unwrap();

    let mut first = store.load(&id).await;
    let mut second = store.load(&id).await;
    first.engine.next_item(&items).unwrap();
    second.engine.next_item(&items).unwrap();

    assert_eq!(store.commit(&mut first, None).await.unwrap(), 1);
    let err = store.commit(&mut second, None).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::VersionConflict { loaded: 0, .. }
    ));
    assert!(ServiceError::from(err).is_conflict());

    // The winner can keep committing; a reload sees its version.
    assert_eq!(store.commit(&mut first, None).await.unwrap(), 2);
    let reloaded = store.load(&id).await;
    assert_eq!(reloaded.version(), 2);
    assert_eq!(reloaded.source(), LoadSource::Cache);
}

#[tokio::test]
async fn cache_outage_with_fallback_completes_the_session() {
    let fallback = Arc::new(InMemorySnapshotFallback::new());
    let results = Arc::new(InMemoryResultsStore::new());
    let cache = InMemoryCache::new();
    cache.set_available(false);
    let h = harness(
        cache,
        results.clone(),
        Some(fallback.clone()),
        fixed_length(6),
        StoreConfig::default(),
    );
    let id = SessionId::new("outage");

    let summary = run_to_completion(&h.service, &id, 0.0).await;

    let stored = results.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.summary, summary);
    assert_eq!(stored.state.item_count(), 6);
    assert_eq!(stored.state.stop_reason, Some(StopReason::MaxItems));
    assert!(h.cache.call_count() > 0);

    // The finished session is dropped from the fallback but stays closed.
    assert!(fallback.load(&id).await.unwrap().is_none());
    assert!(fallback.is_empty());
    assert_eq!(
        h.service.next_question(&id).await.unwrap(),
        NextStep::Finished(summary)
    );

    h.cache.set_available(true);
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn cache_outage_without_fallback_never_fails_a_request() {
    let cache = InMemoryCache::new();
    cache.set_available(false);
    let h = harness(
        cache,
        Arc::new(InMemoryResultsStore::new()),
        None,
        StoppingRule::default(),
        StoreConfig::default(),
    );
    let id = SessionId::new("no-cache");

    let step = h.service.next_question(&id).await.unwrap();
    assert!(matches!(step, NextStep::Question(_)));
    let state = h.service.session_state(&id).await.unwrap();
    assert_eq!(state.status, SessionStatus::AwaitingFirstItem);
}

#[tokio::test(start_paused = true)]
async fn slow_cache_times_out_as_a_miss() {
    let cache = InMemoryCache::new().with_latency(Duration::from_secs(5));
    let h = harness(
        cache,
        Arc::new(InMemoryResultsStore::new()),
        None,
        StoppingRule::default(),
        StoreConfig {
            request_timeout_ms: 100,
            ..StoreConfig::default()
        },
    );
    let id = SessionId::new("slow");

    let step = h.service.next_question(&id).await.unwrap();
    assert!(matches!(step, NextStep::Question(_)));
    assert!(!h.service.store().exists(&id).await);
}

#[tokio::test(start_paused = true)]
async fn expired_session_starts_over() {
    let h = harness(
        InMemoryCache::new(),
        Arc::new(InMemoryResultsStore::new()),
        None,
        StoppingRule::default(),
        StoreConfig {
            session_ttl_secs: 60,
            ..StoreConfig::default()
        },
    );
    let id = SessionId::new("abandoned");

    let NextStep::Question(item) = h.service.next_question(&id).await.unwrap() else {
        panic!("expected a question");
    };
    h.service
        .submit(&id, item.id, &answer_for(&item, false), 5_000)
        .await
        .unwrap();
    assert_eq!(h.service.session_state(&id).await.unwrap().item_count(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;

    let state = h.service.session_state(&id).await.unwrap();
    assert_eq!(state.item_count(), 0);
    assert_eq!(state.status, SessionStatus::AwaitingFirstItem);
}

#[tokio::test]
async fn json_results_survive_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let results = Arc::new(JsonFileResultsStore::new(dir.path()).unwrap());
    let h = harness(
        InMemoryCache::new(),
        results,
        None,
        fixed_length(5),
        StoreConfig::default(),
    );
    let id = SessionId::new("durable");
    let summary = run_to_completion(&h.service, &id, 0.3).await;

    // A second store over the same directory sees the result.
    let reopened = JsonFileResultsStore::new(dir.path()).unwrap();
    let stored = reopened.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.summary, summary);
    assert_eq!(stored.state.item_count(), 5);
}
