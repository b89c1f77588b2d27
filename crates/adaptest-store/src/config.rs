//! adaptest configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use adaptest_core::engine::EngineConfig;
use adaptest_core::estimator::{EstimationMethod, EstimatorConfig};
use adaptest_core::scoring::ScoringConfig;
use adaptest_core::selector::SelectionPolicy;
use adaptest_core::state_store::StoreConfig;
use adaptest_core::stopping::StoppingRule;

/// Top-level adaptest configuration, one TOML table per concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptestConfig {
    pub estimator: EstimatorConfig,
    pub selection: SelectionPolicy,
    pub stopping: StoppingRule,
    pub scoring: ScoringConfig,
    pub cache: StoreConfig,
}

impl AdaptestConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            estimator: self.estimator.clone(),
            selection: self.selection.clone(),
            stopping: self.stopping.clone(),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        self.cache.clone()
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let est = &self.estimator;
        if !(est.theta_min < est.theta_max) {
            anyhow::bail!(
                "estimator.theta_min ({}) must be below theta_max ({})",
                est.theta_min,
                est.theta_max
            );
        }
        if !(est.prior_mean >= est.theta_min && est.prior_mean <= est.theta_max) {
            anyhow::bail!("estimator.prior_mean must lie within the theta bounds");
        }
        if !(est.prior_sd > 0.0) {
            anyhow::bail!("estimator.prior_sd must be positive");
        }
        if est.max_iterations == 0 {
            anyhow::bail!("estimator.max_iterations must be at least 1");
        }
        if est.quadrature_points < 2 {
            anyhow::bail!("estimator.quadrature_points must be at least 2");
        }

        let stop = &self.stopping;
        if stop.max_items == 0 {
            anyhow::bail!("stopping.max_items must be at least 1");
        }
        if stop.min_items > stop.max_items {
            anyhow::bail!(
                "stopping.min_items ({}) exceeds max_items ({})",
                stop.min_items,
                stop.max_items
            );
        }
        if !(stop.se_threshold >= 0.0) {
            anyhow::bail!("stopping.se_threshold must be non-negative");
        }

        if self.selection.max_per_topic == Some(0) {
            anyhow::bail!("selection.max_per_topic must be at least 1 when set");
        }
        if !(self.scoring.min_theta < self.scoring.max_theta) {
            anyhow::bail!("scoring.min_theta must be below scoring.max_theta");
        }
        if self.cache.session_ttl_secs == 0 {
            anyhow::bail!("cache.session_ttl_secs must be positive");
        }
        Ok(())
    }
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `adaptest.toml` in the current directory
/// 2. `~/.config/adaptest/config.toml`
///
/// Environment variable overrides: `ADAPTEST_SESSION_TTL_SECS`,
/// `ADAPTEST_STOP_MAX_ITEMS`, `ADAPTEST_STOP_SE_THRESHOLD`,
/// `ADAPTEST_ESTIMATOR_METHOD`.
pub fn load_config() -> Result<AdaptestConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<AdaptestConfig> {
    let config_path = if let Some(p) = path {
        if p.exists() {
            Some(p.to_path_buf())
        } else {
            anyhow::bail!("config file not found: {}", p.display());
        }
    } else {
        let local = PathBuf::from("adaptest.toml");
        if local.exists() {
            Some(local)
        } else {
            dirs_path()
                .map(|home| home.join("config.toml"))
                .filter(|global| global.exists())
        }
    };

    let mut config = match config_path {
        Some(path) => {
            tracing::debug!("loading config from {}", path.display());
            parse_config_file(&path)?
        }
        None => AdaptestConfig::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Parse a config file without applying overrides.
pub fn parse_config_file(path: &Path) -> Result<AdaptestConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str::<AdaptestConfig>(&content)
        .with_context(|| format!("failed to parse config: {}", path.display()))
}

/// Apply `ADAPTEST_*` overrides, reading variables through `lookup`.
pub fn apply_env_overrides(
    config: &mut AdaptestConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(v) = lookup("ADAPTEST_SESSION_TTL_SECS") {
        config.cache.session_ttl_secs = v
            .trim()
            .parse()
            .with_context(|| format!("invalid ADAPTEST_SESSION_TTL_SECS: {v}"))?;
    }
    if let Some(v) = lookup("ADAPTEST_STOP_MAX_ITEMS") {
        config.stopping.max_items = v
            .trim()
            .parse()
            .with_context(|| format!("invalid ADAPTEST_STOP_MAX_ITEMS: {v}"))?;
    }
    if let Some(v) = lookup("ADAPTEST_STOP_SE_THRESHOLD") {
        config.stopping.se_threshold = v
            .trim()
            .parse()
            .with_context(|| format!("invalid ADAPTEST_STOP_SE_THRESHOLD: {v}"))?;
    }
    if let Some(v) = lookup("ADAPTEST_ESTIMATOR_METHOD") {
        config.estimator.method = v
            .trim()
            .parse::<EstimationMethod>()
            .map_err(|e| anyhow::anyhow!("invalid ADAPTEST_ESTIMATOR_METHOD: {e}"))?;
    }
    Ok(())
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("adaptest"))
}

/// Starter configuration written by `adaptest init`.
pub fn starter_config() -> Result<String> {
    let body = toml::to_string_pretty(&AdaptestConfig::default())
        .context("failed to serialize default config")?;
    Ok(format!("# adaptest configuration\n\n{body}"))
}
