//! Monte Carlo simulation of examinees taking adaptive tests.
//!
//! Every simulated session goes through the full [`ExamService`] path (engine,
//! state store, results store), so a run exercises the same code as live
//! traffic. Sessions run concurrently; each one is strictly sequential.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::irt;
use crate::model::{Answer, ItemParams, SessionId};
use crate::service::{ExamService, NextStep};
use crate::stopping::StopReason;

/// An examinee whose answers follow the 3PL model at a known ability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedExaminee {
    pub true_theta: f64,
}

impl SimulatedExaminee {
    pub fn new(true_theta: f64) -> Self {
        Self { true_theta }
    }

    /// Sample a response to an item.
    pub fn answer(&self, params: &ItemParams, rng: &mut impl Rng) -> bool {
        rng.gen::<f64>() < irt::probability(params, self.true_theta)
    }
}

/// Simulation settings.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Sessions per true theta.
    pub sessions_per_theta: usize,
    /// Maximum concurrent sessions.
    pub parallelism: usize,
    /// Base seed; session `n` uses `seed + n`.
    pub seed: u64,
    /// Simulated time spent on each item.
    pub response_time_ms: u64,
    /// Abort a session that has not finished after this many requests.
    pub max_steps: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sessions_per_theta: 10,
            parallelism: 4,
            seed: 42,
            response_time_ms: 30_000,
            max_steps: 1_000,
        }
    }
}

/// Outcome of one simulated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedSession {
    pub session_id: SessionId,
    pub true_theta: f64,
    pub theta: f64,
    pub standard_error: f64,
    pub items: usize,
    pub stop_reason: Option<StopReason>,
    pub score_0_100: f64,
}

impl SimulatedSession {
    pub fn error(&self) -> f64 {
        self.theta - self.true_theta
    }
}

/// How well estimated abilities recover the true ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub sessions: usize,
    pub completed: usize,
    pub failed: usize,
    pub mean_bias: f64,
    pub rmse: f64,
    pub mean_items: f64,
    pub mean_se: f64,
}

/// Recovery statistics for one true theta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThetaRecovery {
    pub true_theta: f64,
    pub stats: RecoveryStats,
}

/// Everything a simulation run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub id: uuid::Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub sessions: Vec<SimulatedSession>,
    pub overall: RecoveryStats,
    pub by_theta: Vec<ThetaRecovery>,
    pub duration_ms: u64,
}

/// Aggregate recovery statistics. `failed` counts sessions that never
/// produced a result.
pub fn compute_recovery(sessions: &[&SimulatedSession], failed: usize) -> RecoveryStats {
    let completed = sessions.len();
    if completed == 0 {
        return RecoveryStats {
            sessions: failed,
            failed,
            ..RecoveryStats::default()
        };
    }

    RecoveryStats {
        sessions: completed + failed,
        completed,
        failed,
        mean_bias: mean(sessions, |s| s.error()),
        rmse: mean(sessions, |s| s.error().powi(2)).sqrt(),
        mean_items: mean(sessions, |s| s.items as f64),
        mean_se: mean(sessions, |s| s.standard_error),
    }
}

fn mean(sessions: &[&SimulatedSession], f: impl Fn(&SimulatedSession) -> f64) -> f64 {
    sessions.iter().map(|&s| f(s)).sum::<f64>() / sessions.len() as f64
}

/// Progress callbacks for a simulation run.
pub trait SimulationProgress: Send + Sync {
    fn on_session_complete(&self, session: &SimulatedSession);
    fn on_session_error(&self, session_id: &SessionId, error: &str);
    fn on_run_complete(&self, total: usize, completed: usize, failed: usize, elapsed: Duration);
}

/// Progress reporter that ignores every event.
pub struct NoopProgress;

impl SimulationProgress for NoopProgress {
    fn on_session_complete(&self, _: &SimulatedSession) {}
    fn on_session_error(&self, _: &SessionId, _: &str) {}
    fn on_run_complete(&self, _: usize, _: usize, _: usize, _: Duration) {}
}

/// Drives simulated examinees through an [`ExamService`].
pub struct Simulator {
    service: Arc<ExamService>,
    config: SimulationConfig,
}

impl Simulator {
    pub fn new(service: Arc<ExamService>, config: SimulationConfig) -> Self {
        Self { service, config }
    }

    /// Run `sessions_per_theta` sessions for each true theta.
    pub async fn run(
        &self,
        true_thetas: &[f64],
        progress: &dyn SimulationProgress,
    ) -> Result<SimulationReport> {
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4();
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut futures = FuturesUnordered::new();

        let mut index = 0u64;
        for &true_theta in true_thetas {
            for _ in 0..self.config.sessions_per_theta {
                let service = Arc::clone(&self.service);
                let semaphore = Arc::clone(&semaphore);
                let config = self.config.clone();
                let session_id = SessionId::new(format!("sim-{run_id}-{index}"));
                let seed = config.seed.wrapping_add(index);
                index += 1;

                futures.push(async move {
                    let ctx_id = session_id.clone();
                    let inner = async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .map_err(|_| anyhow::anyhow!("semaphore closed"))?;
                        let examinee = SimulatedExaminee::new(true_theta);
                        let mut rng = StdRng::seed_from_u64(seed);
                        run_session(&service, &session_id, examinee, &mut rng, &config).await
                    };
                    (ctx_id, true_theta, inner.await)
                });
            }
        }

        let total = futures.len();
        let mut sessions = Vec::with_capacity(total);
        let mut failures: Vec<f64> = Vec::new();

        while let Some((session_id, true_theta, result)) = futures.next().await {
            match result {
                Ok(session) => {
                    progress.on_session_complete(&session);
                    sessions.push(session);
                }
                Err(e) => {
                    tracing::error!("simulated session {session_id} failed: {e:#}");
                    progress.on_session_error(&session_id, &format!("{e:#}"));
                    failures.push(true_theta);
                }
            }
        }

        let elapsed = start.elapsed();
        progress.on_run_complete(total, sessions.len(), failures.len(), elapsed);

        sessions.sort_by(|x, y| {
            x.true_theta
                .total_cmp(&y.true_theta)
                .then_with(|| x.session_id.as_str().cmp(y.session_id.as_str()))
        });

        let all: Vec<&SimulatedSession> = sessions.iter().collect();
        let overall = compute_recovery(&all, failures.len());
        let by_theta = dedup_thetas(true_thetas)
            .into_iter()
            .map(|true_theta| {
                let matching: Vec<&SimulatedSession> = sessions
                    .iter()
                    .filter(|s| s.true_theta == true_theta)
                    .collect();
                let failed = failures.iter().filter(|&&t| t == true_theta).count();
                ThetaRecovery {
                    true_theta,
                    stats: compute_recovery(&matching, failed),
                }
            })
            .collect();

        Ok(SimulationReport {
            id: run_id,
            created_at: chrono::Utc::now(),
            sessions,
            overall,
            by_theta,
            duration_ms: elapsed.as_millis() as u64,
        })
    }
}

fn dedup_thetas(thetas: &[f64]) -> Vec<f64> {
    let mut unique: Vec<f64> = Vec::with_capacity(thetas.len());
    for &theta in thetas {
        if !unique.contains(&theta) {
            unique.push(theta);
        }
    }
    unique
}

async fn run_session(
    service: &ExamService,
    session_id: &SessionId,
    examinee: SimulatedExaminee,
    rng: &mut StdRng,
    config: &SimulationConfig,
) -> Result<SimulatedSession> {
    for _ in 0..config.max_steps {
        let summary = match service.next_question(session_id).await? {
            NextStep::Question(item) => {
                let correct = examinee.answer(&item.params(), rng);
                let receipt = service
                    .submit(
                        session_id,
                        item.id,
                        &Answer::Scored { correct },
                        config.response_time_ms,
                    )
                    .await?;
                match receipt.summary {
                    Some(summary) => summary,
                    None => continue,
                }
            }
            NextStep::Finished(summary) => summary,
        };

        let result = service
            .final_result(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no final result recorded"))?;
        return Ok(SimulatedSession {
            session_id: session_id.clone(),
            true_theta: examinee.true_theta,
            theta: summary.theta,
            standard_error: summary.se,
            items: result.state.item_count(),
            stop_reason: result.state.stop_reason,
            score_0_100: summary.score_0_100,
        });
    }
    anyhow::bail!("session did not finish within {} steps", config.max_steps)
}
