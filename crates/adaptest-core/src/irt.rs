//! Three-parameter logistic (3PL) item response functions.
//!
//! `P(θ) = c + (1 - c) / (1 + exp(-a(θ - b)))`

use crate::model::ItemParams;

/// Probabilities are kept inside `[PROB_EPSILON, 1 - PROB_EPSILON]` whenever
/// they feed a logarithm or a division.
pub const PROB_EPSILON: f64 = 1e-9;

/// Probability of a correct response at `theta`.
pub fn probability(params: &ItemParams, theta: f64) -> f64 {
    let z = -params.a * (theta - params.b);
    params.c + (1.0 - params.c) / (1.0 + z.exp())
}

/// [`probability`] clamped away from 0 and 1.
pub fn clamped_probability(params: &ItemParams, theta: f64) -> f64 {
    probability(params, theta).clamp(PROB_EPSILON, 1.0 - PROB_EPSILON)
}

/// Fisher information of an item at `theta`.
///
/// `I(θ) = a² (P - c)² (1 - P) / ((1 - c)² P)`
pub fn information(params: &ItemParams, theta: f64) -> f64 {
    let p = clamped_probability(params, theta);
    let one_minus_c = 1.0 - params.c;
    let info = params.a.powi(2) * (p - params.c).powi(2) * (1.0 - p) / (one_minus_c.powi(2) * p);
    if info.is_finite() {
        info.max(0.0)
    } else {
        0.0
    }
}

/// Log-likelihood of one scored response.
pub fn log_likelihood(params: &ItemParams, theta: f64, correct: bool) -> f64 {
    let p = clamped_probability(params, theta);
    if correct {
        p.ln()
    } else {
        (1.0 - p).ln()
    }
}

/// First and second derivatives of [`log_likelihood`] with respect to theta.
///
/// With `W = (P - c) / ((1 - c) P)`:
/// - `dL/dθ   = a (y - P) W`
/// - `d²L/dθ² = a² (P - c)(1 - P)(c·y - P²) / ((1 - c)² P²)`
pub fn log_likelihood_derivatives(params: &ItemParams, theta: f64, correct: bool) -> (f64, f64) {
    let p = clamped_probability(params, theta);
    let y = if correct { 1.0 } else { 0.0 };
    let one_minus_c = 1.0 - params.c;
    let gradient = params.a * (y - p) * (p - params.c) / (one_minus_c * p);
    let hessian = params.a.powi(2) * (p - params.c) * (1.0 - p) * (params.c * y - p * p)
        / (one_minus_c.powi(2) * p * p);
    (gradient, hessian)
}

/// Total test information for a set of items at `theta`.
pub fn test_information<'a>(items: impl IntoIterator<Item = &'a ItemParams>, theta: f64) -> f64 {
    items.into_iter().map(|p| information(p, theta)).sum()
}
