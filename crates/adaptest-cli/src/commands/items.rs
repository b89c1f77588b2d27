//! The `adaptest items` command.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{Cell, Table};

use adaptest_core::bank::StaticItemBank;
use adaptest_core::irt;
use adaptest_core::selector::ItemSelector;

pub fn execute(
    bank_path: PathBuf,
    theta: f64,
    topic: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    anyhow::ensure!(theta.is_finite(), "theta must be a finite number");

    let bank = StaticItemBank::from_file(&bank_path)?;
    let candidates: Vec<_> = bank
        .items()
        .iter()
        .filter(|item| topic.is_none() || item.topic == topic)
        .cloned()
        .collect();

    if candidates.is_empty() {
        match &topic {
            Some(t) => println!(
                "No items with topic '{t}'. Topics: {}",
                bank.topics().join(", ")
            ),
            None => println!("Item bank is empty."),
        }
        return Ok(());
    }

    let ranked = ItemSelector::default().rank_by_information(theta, &HashSet::new(), &candidates);
    let shown = limit.unwrap_or(ranked.len());

    let mut table = Table::new();
    table.set_header(vec!["Rank", "Item", "Topic", "a", "b", "c", "P(correct)", "Info"]);

    for (rank, entry) in ranked.iter().take(shown).enumerate() {
        let Some(item) = candidates.iter().find(|item| item.id == entry.id) else {
            continue;
        };
        table.add_row(vec![
            Cell::new(rank + 1),
            Cell::new(item.id),
            Cell::new(item.topic.as_deref().unwrap_or("-")),
            Cell::new(format!("{:.2}", item.a)),
            Cell::new(format!("{:.2}", item.b)),
            Cell::new(format!("{:.2}", item.c)),
            Cell::new(format!("{:.3}", irt::probability(&item.params(), theta))),
            Cell::new(format!("{:.4}", entry.information)),
        ]);
    }

    println!("Items ranked at theta = {theta:.2}");
    println!("{table}");
    if shown < ranked.len() {
        println!("({} more not shown)", ranked.len() - shown);
    }

    Ok(())
}
