//! Conversion of a final ability estimate into user-facing scores.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Descending theta cutoffs for numeric grades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeScale {
    /// Half-logit bands from 1.0 down to -2.5, grades 1 to 9.
    #[default]
    NineBand,
    /// Nine grades following the national college entrance exam distribution.
    Suneung9,
    /// Five grades of 20% each under a standard normal.
    FiveBand,
}

impl GradeScale {
    pub fn cutoffs(&self) -> &'static [f64] {
        match self {
            GradeScale::NineBand => &[1.0, 0.5, 0.0, -0.5, -1.0, -1.5, -2.0, -2.5],
            GradeScale::Suneung9 => &[1.75, 1.48, 1.17, 0.95, 0.74, 0.52, 0.25, -0.25],
            GradeScale::FiveBand => &[0.84, 0.25, -0.25, -0.84],
        }
    }

    /// Grade 1 is the best; `cutoffs().len() + 1` the worst.
    pub fn grade(&self, theta: f64) -> u8 {
        let cutoffs = self.cutoffs();
        cutoffs
            .iter()
            .position(|&cut| theta >= cut)
            .unwrap_or(cutoffs.len()) as u8
            + 1
    }
}

impl fmt::Display for GradeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GradeScale::NineBand => write!(f, "nine_band"),
            GradeScale::Suneung9 => write!(f, "suneung9"),
            GradeScale::FiveBand => write!(f, "five_band"),
        }
    }
}

impl FromStr for GradeScale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nine_band" => Ok(GradeScale::NineBand),
            "suneung9" => Ok(GradeScale::Suneung9),
            "five_band" => Ok(GradeScale::FiveBand),
            other => Err(format!(
                "unknown grade scale '{other}', expected nine_band, suneung9 or five_band"
            )),
        }
    }
}

/// Score scale parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Theta mapped to a score of 0.
    pub min_theta: f64,
    /// Theta mapped to a score of 100.
    pub max_theta: f64,
    pub t_mean: f64,
    pub t_sd: f64,
    pub grade_scale: GradeScale,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_theta: -3.0,
            max_theta: 3.0,
            t_mean: 50.0,
            t_sd: 10.0,
            grade_scale: GradeScale::NineBand,
        }
    }
}

/// Every score artifact for one final estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub theta: f64,
    pub se: f64,
    pub score_0_100: f64,
    pub t_score: f64,
    pub percentile: f64,
    pub grade_numeric: u8,
    pub grade_letter: char,
}

/// Stateless theta-to-score mapping. Every output is monotonic in theta.
#[derive(Debug, Clone, Default)]
pub struct ScoreConverter {
    config: ScoringConfig,
}

impl ScoreConverter {
    /// Falls back to the default calibration range when `max_theta` does not
    /// exceed `min_theta`.
    pub fn new(mut config: ScoringConfig) -> Self {
        if !(config.max_theta > config.min_theta) {
            tracing::warn!(
                min = config.min_theta,
                max = config.max_theta,
                "invalid calibration range, using defaults"
            );
            let defaults = ScoringConfig::default();
            config.min_theta = defaults.min_theta;
            config.max_theta = defaults.max_theta;
        }
        if !(config.t_sd > 0.0) {
            config.t_sd = ScoringConfig::default().t_sd;
        }
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    fn clamp(&self, theta: f64) -> f64 {
        if theta.is_nan() {
            return 0.0;
        }
        theta.clamp(self.config.min_theta, self.config.max_theta)
    }

    /// Linear over the calibration range.
    pub fn score_0_100(&self, theta: f64) -> f64 {
        let theta = self.clamp(theta);
        (theta - self.config.min_theta) / (self.config.max_theta - self.config.min_theta) * 100.0
    }

    pub fn t_score(&self, theta: f64) -> f64 {
        self.config.t_mean + self.config.t_sd * self.clamp(theta)
    }

    /// `Φ(θ) · 100` under a standard normal ability distribution.
    pub fn percentile(&self, theta: f64) -> f64 {
        normal_cdf(self.clamp(theta)) * 100.0
    }

    pub fn grade_numeric(&self, theta: f64) -> u8 {
        self.config.grade_scale.grade(self.clamp(theta))
    }

    /// Full summary for `(theta, se)`. `theta` is reported as given.
    pub fn convert(&self, theta: f64, se: f64) -> ScoreSummary {
        let percentile = self.percentile(theta);
        ScoreSummary {
            theta,
            se,
            score_0_100: self.score_0_100(theta),
            t_score: self.t_score(theta),
            percentile,
            grade_numeric: self.grade_numeric(theta),
            grade_letter: letter_grade(percentile),
        }
    }

    pub fn convert_batch(&self, estimates: &[(f64, f64)]) -> Vec<ScoreSummary> {
        estimates
            .iter()
            .map(|&(theta, se)| self.convert(theta, se))
            .collect()
    }

    /// Inverse of [`score_0_100`](Self::score_0_100); scores are clamped to `[0, 100]`.
    pub fn score_to_theta(&self, score: f64) -> f64 {
        let score = score.clamp(0.0, 100.0);
        self.config.min_theta + score / 100.0 * (self.config.max_theta - self.config.min_theta)
    }

    pub fn t_score_to_theta(&self, t_score: f64) -> f64 {
        (t_score - self.config.t_mean) / self.config.t_sd
    }
}

/// A at the 90th percentile, B at 75, C at 50, D at 25, otherwise F.
pub fn letter_grade(percentile: f64) -> char {
    const BANDS: [(f64, char); 4] = [(90.0, 'A'), (75.0, 'B'), (50.0, 'C'), (25.0, 'D')];
    BANDS
        .iter()
        .find(|(floor, _)| percentile >= *floor)
        .map(|(_, letter)| *letter)
        .unwrap_or('F')
}

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    const P: f64 = 0.327_591_1;
    const A: [f64; 5] = [
        0.254_829_592,
        -0.284_496_736,
        1.421_413_741,
        -1.453_152_027,
        1.061_405_429,
    ];
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, &coef| acc * t + coef) * t;
    sign * (1.0 - poly * (-x * x).exp())
}
