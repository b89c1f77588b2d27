//! Ability (theta) estimation under the 3PL model.
//!
//! The estimate is always recomputed from the full response history, never
//! from the newest response alone. Three methods are available:
//!
//! - **MLE**: Newton–Raphson on the joint log-likelihood. Response patterns
//!   that are all correct or all incorrect have no interior maximum and are
//!   clamped to the configured bound.
//! - **MAP**: Newton–Raphson on the log-posterior with a Gaussian prior.
//! - **EAP**: posterior mean over an evenly spaced quadrature grid.
//!
//! A failed update is not an error. The previous estimate is returned together
//! with an [`EstimationDegraded`] signal for auditing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EstimationDegraded;
use crate::irt;
use crate::model::{ItemParams, Response};

/// Estimation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimationMethod {
    #[default]
    Mle,
    Map,
    Eap,
}

impl fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimationMethod::Mle => write!(f, "mle"),
            EstimationMethod::Map => write!(f, "map"),
            EstimationMethod::Eap => write!(f, "eap"),
        }
    }
}

impl FromStr for EstimationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mle" => Ok(EstimationMethod::Mle),
            "map" => Ok(EstimationMethod::Map),
            "eap" => Ok(EstimationMethod::Eap),
            other => Err(format!("unknown estimation method: {other}")),
        }
    }
}

/// Configuration for [`AbilityEstimator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub method: EstimationMethod,
    /// Newton–Raphson iteration budget.
    pub max_iterations: u32,
    /// Convergence threshold on the theta step.
    pub tolerance: f64,
    pub theta_min: f64,
    pub theta_max: f64,
    /// Starting theta, and the Gaussian prior mean for MAP/EAP.
    pub prior_mean: f64,
    /// Starting SE, and the Gaussian prior SD for MAP/EAP.
    pub prior_sd: f64,
    /// Grid size for EAP.
    pub quadrature_points: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            method: EstimationMethod::Mle,
            max_iterations: 15,
            tolerance: 1e-4,
            theta_min: -4.0,
            theta_max: 4.0,
            prior_mean: 0.0,
            prior_sd: 1.0,
            quadrature_points: 81,
        }
    }
}

/// A scored response reduced to what the likelihood needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredItem {
    pub params: ItemParams,
    pub correct: bool,
}

impl ScoredItem {
    pub fn new(params: ItemParams, correct: bool) -> Self {
        Self { params, correct }
    }
}

impl From<&Response> for ScoredItem {
    fn from(response: &Response) -> Self {
        Self {
            params: response.params,
            correct: response.correct,
        }
    }
}

/// Result of an estimator update.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub theta: f64,
    pub standard_error: f64,
    pub iterations: u32,
    /// Set when the previous estimate was kept.
    pub degraded: Option<EstimationDegraded>,
}

/// Maximum step size for one Newton iteration; keeps early, sparse-history
/// updates from overshooting across the whole scale.
const MAX_STEP: f64 = 1.0;

/// Computes theta and its standard error from a response history.
#[derive(Debug, Clone, Default)]
pub struct AbilityEstimator {
    config: EstimatorConfig,
}

impl AbilityEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// The estimate before any response has been recorded.
    pub fn prior(&self) -> Estimate {
        Estimate {
            theta: self.clamp(self.config.prior_mean),
            standard_error: self.config.prior_sd.max(0.0),
            iterations: 0,
            degraded: None,
        }
    }

    /// Re-estimate theta and SE from the complete `history`.
    ///
    /// `theta_prior` / `se_prior` are the current estimate: the starting point
    /// of the Newton iterations and the value kept when the update degrades.
    pub fn update(&self, history: &[ScoredItem], theta_prior: f64, se_prior: f64) -> Estimate {
        if history.is_empty() {
            return self.prior();
        }

        let estimate = match self.config.method {
            EstimationMethod::Mle => self.mle(history, theta_prior, se_prior),
            EstimationMethod::Map => self.newton(history, theta_prior, se_prior, true),
            EstimationMethod::Eap => self.eap(history, theta_prior, se_prior),
        };

        if let Some(degraded) = &estimate.degraded {
            tracing::warn!(
                method = %self.config.method,
                responses = history.len(),
                "keeping previous estimate: {degraded}"
            );
        } else {
            tracing::debug!(
                method = %self.config.method,
                theta = estimate.theta,
                se = estimate.standard_error,
                iterations = estimate.iterations,
                "ability updated"
            );
        }
        estimate
    }

    fn mle(&self, history: &[ScoredItem], theta_prior: f64, se_prior: f64) -> Estimate {
        let all_correct = history.iter().all(|r| r.correct);
        let all_incorrect = history.iter().all(|r| !r.correct);
        if all_correct || all_incorrect {
            let theta = if all_correct {
                self.config.theta_max
            } else {
                self.config.theta_min
            };
            return Estimate {
                theta,
                standard_error: self.standard_error(history, theta, se_prior, false),
                iterations: 0,
                degraded: None,
            };
        }
        self.newton(history, theta_prior, se_prior, false)
    }

    fn newton(
        &self,
        history: &[ScoredItem],
        theta_prior: f64,
        se_prior: f64,
        with_prior: bool,
    ) -> Estimate {
        let mut theta = self.clamp(theta_prior);

        for iteration in 1..=self.config.max_iterations {
            let (gradient, hessian) = self.derivatives(history, theta, with_prior);
            if !gradient.is_finite() || !hessian.is_finite() {
                return self.degraded(theta_prior, se_prior, iteration, "non-finite derivatives");
            }

            let raw_step = if hessian < -f64::EPSILON {
                -gradient / hessian
            } else {
                // Not locally concave: fall back to a Fisher scoring step.
                let info = self.expected_information(history, theta, with_prior);
                if info <= 0.0 {
                    return self.degraded(theta_prior, se_prior, iteration, "zero information");
                }
                gradient / info
            };
            let step = raw_step.clamp(-MAX_STEP, MAX_STEP);
            let next = self.clamp(theta + step);

            if (next - theta).abs() < self.config.tolerance {
                return Estimate {
                    theta: next,
                    standard_error: self.standard_error(history, next, se_prior, with_prior),
                    iterations: iteration,
                    degraded: None,
                };
            }
            theta = next;
        }

        self.degraded(
            theta_prior,
            se_prior,
            self.config.max_iterations,
            "did not converge",
        )
    }

    fn eap(&self, history: &[ScoredItem], theta_prior: f64, se_prior: f64) -> Estimate {
        let points = self.config.quadrature_points.max(2);
        let span = self.config.theta_max - self.config.theta_min;
        let grid: Vec<f64> = (0..points)
            .map(|i| self.config.theta_min + span * i as f64 / (points - 1) as f64)
            .collect();

        let log_post: Vec<f64> = grid
            .iter()
            .map(|&t| self.log_likelihood(history, t) + self.log_prior(t))
            .collect();
        let max = log_post.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return self.degraded(theta_prior, se_prior, 1, "degenerate posterior");
        }

        let weights: Vec<f64> = log_post.iter().map(|lp| (lp - max).exp()).collect();
        let total: f64 = weights.iter().sum();
        let mean = grid.iter().zip(&weights).map(|(t, w)| t * w).sum::<f64>() / total;
        let variance = grid
            .iter()
            .zip(&weights)
            .map(|(t, w)| w * (t - mean).powi(2))
            .sum::<f64>()
            / total;

        Estimate {
            theta: self.clamp(mean),
            standard_error: variance.max(0.0).sqrt(),
            iterations: 1,
            degraded: None,
        }
    }

    fn derivatives(&self, history: &[ScoredItem], theta: f64, with_prior: bool) -> (f64, f64) {
        let (mut gradient, mut hessian) = history.iter().fold((0.0, 0.0), |(g, h), r| {
            let (dg, dh) = irt::log_likelihood_derivatives(&r.params, theta, r.correct);
            (g + dg, h + dh)
        });
        if with_prior && self.config.prior_sd > 0.0 {
            let var = self.config.prior_sd.powi(2);
            gradient -= (theta - self.config.prior_mean) / var;
            hessian -= 1.0 / var;
        }
        (gradient, hessian)
    }

    fn expected_information(&self, history: &[ScoredItem], theta: f64, with_prior: bool) -> f64 {
        let info = irt::test_information(history.iter().map(|r| &r.params), theta);
        if with_prior && self.config.prior_sd > 0.0 {
            info + 1.0 / self.config.prior_sd.powi(2)
        } else {
            info
        }
    }

    /// `1 / sqrt(I)` using observed information, falling back to expected
    /// information when the observed value is not positive.
    fn standard_error(
        &self,
        history: &[ScoredItem],
        theta: f64,
        se_prior: f64,
        with_prior: bool,
    ) -> f64 {
        let (_, hessian) = self.derivatives(history, theta, with_prior);
        let observed = -hessian;
        let info = if observed.is_finite() && observed > 0.0 {
            observed
        } else {
            self.expected_information(history, theta, with_prior)
        };
        if info.is_finite() && info > 0.0 {
            1.0 / info.sqrt()
        } else {
            se_prior.max(0.0)
        }
    }

    fn log_likelihood(&self, history: &[ScoredItem], theta: f64) -> f64 {
        history
            .iter()
            .map(|r| irt::log_likelihood(&r.params, theta, r.correct))
            .sum()
    }

    fn log_prior(&self, theta: f64) -> f64 {
        if self.config.prior_sd <= 0.0 {
            return 0.0;
        }
        -0.5 * ((theta - self.config.prior_mean) / self.config.prior_sd).powi(2)
    }

    fn degraded(&self, theta: f64, se: f64, iterations: u32, reason: &str) -> Estimate {
        Estimate {
            theta: self.clamp(theta),
            standard_error: se.max(0.0),
            iterations,
            degraded: Some(EstimationDegraded {
                iterations,
                reason: reason.to_string(),
            }),
        }
    }

    fn clamp(&self, theta: f64) -> f64 {
        if theta.is_nan() {
            return self.config.prior_mean.clamp(self.config.theta_min, self.config.theta_max);
        }
        theta.clamp(self.config.theta_min, self.config.theta_max)
    }
}
