//! The `adaptest score` command.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{Cell, Table};

use adaptest_core::scoring::ScoreConverter;
use adaptest_store::load_config_from;

pub fn execute(theta: f64, se: f64, format: String, config_path: Option<PathBuf>) -> Result<()> {
    anyhow::ensure!(theta.is_finite(), "theta must be a finite number");
    anyhow::ensure!(se.is_finite() && se >= 0.0, "se must be non-negative");

    let config = load_config_from(config_path.as_deref())?;
    let converter = ScoreConverter::new(config.scoring);
    let summary = converter.convert(theta, se);

    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        "text" => {
            let mut table = Table::new();
            table.set_header(vec!["Measure", "Value"]);
            table.add_row(vec![Cell::new("Theta"), Cell::new(format!("{:.3}", summary.theta))]);
            table.add_row(vec![Cell::new("SE"), Cell::new(format!("{:.3}", summary.se))]);
            table.add_row(vec![
                Cell::new("Score (0-100)"),
                Cell::new(format!("{:.1}", summary.score_0_100)),
            ]);
            table.add_row(vec![Cell::new("T-score"), Cell::new(format!("{:.1}", summary.t_score))]);
            table.add_row(vec![
                Cell::new("Percentile"),
                Cell::new(format!("{:.1}", summary.percentile)),
            ]);
            table.add_row(vec![
                Cell::new(format!("Grade ({})", converter.config().grade_scale)),
                Cell::new(summary.grade_numeric),
            ]);
            table.add_row(vec![Cell::new("Letter"), Cell::new(summary.grade_letter)]);
            println!("{table}");
        }
        other => anyhow::bail!("unknown format '{other}', expected text or json"),
    }

    Ok(())
}
