//! adaptest-core: IRT ability estimation, item selection and the adaptive
//! session engine.
//!
//! This crate holds the data model, the 3PL math, the per-session state
//! machine and the async seams (item bank, cache, results store) that the
//! rest of adaptest builds on.

pub mod bank;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod irt;
pub mod model;
pub mod scoring;
pub mod selector;
pub mod service;
pub mod simulation;
pub mod state_store;
pub mod stopping;
#[cfg(test)]
mod testing;
pub mod traits;
