//! adaptest-store: backends for the adaptest session store.
//!
//! Implements the `CacheBackend`, `ResultsStore` and `SnapshotFallback`
//! traits from `adaptest-core`, and loads the TOML configuration that wires
//! them together.

pub mod config;
pub mod memory;
pub mod results;

pub use config::{load_config, load_config_from, AdaptestConfig};
pub use memory::{InMemoryCache, InMemorySnapshotFallback};
pub use results::{InMemoryResultsStore, JsonFileResultsStore};
