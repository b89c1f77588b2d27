//! The `adaptest validate` command.

use std::path::PathBuf;

use anyhow::Result;

use adaptest_core::bank::{self, Severity};

pub fn execute(bank_path: PathBuf) -> Result<()> {
    let banks = if bank_path.is_dir() {
        bank::load_bank_directory(&bank_path)?
    } else {
        vec![bank::parse_item_bank(&bank_path)?]
    };

    anyhow::ensure!(
        !banks.is_empty(),
        "no item banks found in {}",
        bank_path.display()
    );

    let mut total_errors = 0;
    let mut total_warnings = 0;

    for bank in &banks {
        println!("Item bank: {} ({} items)", bank.name, bank.items.len());

        for finding in bank::validate_item_bank(bank) {
            let prefix = finding
                .item_id
                .map(|id| format!("  [{id}]"))
                .unwrap_or_else(|| "  ".to_string());
            match finding.severity {
                Severity::Error => {
                    total_errors += 1;
                    println!("{prefix} ERROR: {}", finding.message);
                }
                Severity::Warning => {
                    total_warnings += 1;
                    println!("{prefix} WARNING: {}", finding.message);
                }
            }
        }
    }

    if total_errors == 0 && total_warnings == 0 {
        println!("All item banks valid.");
    } else if total_errors == 0 {
        println!("\n{total_warnings} warning(s) found.");
    } else {
        anyhow::bail!("{total_errors} error(s), {total_warnings} warning(s) found");
    }

    Ok(())
}
