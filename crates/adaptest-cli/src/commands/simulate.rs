//! The `adaptest simulate` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};

use adaptest_core::bank::StaticItemBank;
use adaptest_core::model::SessionId;
use adaptest_core::scoring::ScoreConverter;
use adaptest_core::service::ExamService;
use adaptest_core::simulation::{
    RecoveryStats, SimulatedSession, SimulationConfig, SimulationProgress, SimulationReport,
    Simulator,
};
use adaptest_core::state_store::SessionStateStore;
use adaptest_core::traits::ResultsStore;
use adaptest_store::{load_config_from, InMemoryCache, InMemoryResultsStore, JsonFileResultsStore};

/// Console progress reporter.
struct ConsoleProgress;

impl SimulationProgress for ConsoleProgress {
    fn on_session_complete(&self, session: &SimulatedSession) {
        let reason = session
            .stop_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        eprintln!(
            "  Done: true {:+.2} -> est {:+.2} (se {:.3}, {} items, {})",
            session.true_theta, session.theta, session.standard_error, session.items, reason,
        );
    }

    fn on_session_error(&self, session_id: &SessionId, error: &str) {
        eprintln!("  ERROR: {session_id}: {error}");
    }

    fn on_run_complete(&self, total: usize, completed: usize, failed: usize, elapsed: Duration) {
        eprintln!(
            "\nComplete: {completed}/{total} sessions finished, {failed} failed ({:.1}s)",
            elapsed.as_secs_f64()
        );
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn execute(
    bank_path: PathBuf,
    true_theta: String,
    sessions: usize,
    parallelism: usize,
    seed: u64,
    output: Option<PathBuf>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    anyhow::ensure!(parallelism >= 1, "parallelism must be at least 1");
    anyhow::ensure!(sessions >= 1, "sessions must be at least 1");

    let thetas = parse_thetas(&true_theta)?;
    let config = load_config_from(config_path.as_deref())?;
    let bank = StaticItemBank::from_file(&bank_path)?;
    anyhow::ensure!(!bank.is_empty(), "item bank has no items");

    let results: Arc<dyn ResultsStore> = match &output {
        Some(dir) => Arc::new(JsonFileResultsStore::new(dir.join("results"))?),
        None => Arc::new(InMemoryResultsStore::new()),
    };
    let store = SessionStateStore::new(
        Arc::new(InMemoryCache::new()),
        config.engine_config(),
        config.store_config(),
    );
    let service = ExamService::new(
        Arc::new(bank),
        store,
        results,
        ScoreConverter::new(config.scoring.clone()),
    );

    let sim_config = SimulationConfig {
        sessions_per_theta: sessions,
        parallelism,
        seed,
        ..SimulationConfig::default()
    };

    eprintln!(
        "adaptest v{} - Simulating {} sessions x {} abilities ({} estimation)",
        env!("CARGO_PKG_VERSION"),
        sessions,
        thetas.len(),
        config.estimator.method,
    );
    eprintln!();

    let simulator = Simulator::new(Arc::new(service), sim_config);
    let report = simulator.run(&thetas, &ConsoleProgress).await?;

    print_summary(&report);

    if let Some(dir) = &output {
        std::fs::create_dir_all(dir)?;
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H%M%S");
        let path = dir.join(format!("simulation-{timestamp}.json"));
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write report: {}", path.display()))?;
        eprintln!("Report saved to: {}", path.display());
    }

    anyhow::ensure!(
        report.overall.completed > 0,
        "no simulated session completed"
    );
    Ok(())
}

fn parse_thetas(list: &str) -> Result<Vec<f64>> {
    let thetas = list
        .split(',')
        .map(|s| {
            let s = s.trim();
            s.parse::<f64>()
                .ok()
                .filter(|theta| theta.is_finite())
                .ok_or_else(|| anyhow::anyhow!("invalid theta value: '{s}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    anyhow::ensure!(!thetas.is_empty(), "at least one true theta is required");
    Ok(thetas)
}

fn print_summary(report: &SimulationReport) {
    let mut table = Table::new();
    table.set_header(vec![
        "True theta",
        "Sessions",
        "Failed",
        "Bias",
        "RMSE",
        "Mean items",
        "Mean SE",
    ]);

    for entry in &report.by_theta {
        table.add_row(stats_row(format!("{:+.2}", entry.true_theta), &entry.stats));
    }
    table.add_row(stats_row("overall".to_string(), &report.overall));

    println!("{table}");
}

fn stats_row(label: String, stats: &RecoveryStats) -> Vec<Cell> {
    vec![
        Cell::new(label),
        Cell::new(stats.completed),
        Cell::new(stats.failed),
        Cell::new(format!("{:+.3}", stats.mean_bias)),
        Cell::new(format!("{:.3}", stats.rmse)),
        Cell::new(format!("{:.1}", stats.mean_items)),
        Cell::new(format!("{:.3}", stats.mean_se)),
    ]
}
