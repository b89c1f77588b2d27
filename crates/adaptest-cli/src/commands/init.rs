//! The `adaptest init` command.

use std::path::Path;

use anyhow::Result;

use adaptest_store::config::starter_config;

pub fn execute() -> Result<()> {
    if Path::new("adaptest.toml").exists() {
        println!("adaptest.toml already exists, skipping.");
    } else {
        std::fs::write("adaptest.toml", starter_config()?)?;
        println!("Created adaptest.toml");
    }

    std::fs::create_dir_all("item-banks")?;
    let example_path = Path::new("item-banks/example.toml");
    if example_path.exists() {
        println!("item-banks/example.toml already exists, skipping.");
    } else {
        std::fs::write(example_path, EXAMPLE_BANK)?;
        println!("Created item-banks/example.toml");
    }

    println!("\nNext steps:");
    println!("  1. Replace the example items with your calibrated bank");
    println!("  2. Run: adaptest validate --bank item-banks/example.toml");
    println!("  3. Run: adaptest simulate --bank item-banks/example.toml --true-theta -1,0,1");

    Ok(())
}

const EXAMPLE_BANK: &str = r#"[bank]
id = "example"
name = "Example Item Bank"
description = "A small 3PL-calibrated bank to get started"

[[items]]
id = 1
a = 1.1
b = -2.0
c = 0.2
topic = "arithmetic"

[items.answer_key]
type = "multiple_choice"
correct = 2

[[items]]
id = 2
a = 1.4
b = -1.2
c = 0.2
topic = "arithmetic"

[items.answer_key]
type = "multiple_choice"
correct = 4

[[items]]
id = 3
a = 0.9
b = -0.5
c = 0.15
topic = "fractions"

[items.answer_key]
type = "free_response"
accepted = ["3/4", "0.75"]

[[items]]
id = 4
a = 1.6
b = 0.0
c = 0.2
topic = "fractions"

[items.answer_key]
type = "multiple_choice"
correct = 1

[[items]]
id = 5
a = 1.2
b = 0.6
c = 0.25
topic = "algebra"

[items.answer_key]
type = "multiple_choice"
correct = 3

[[items]]
id = 6
a = 1.8
b = 1.1
c = 0.1
topic = "algebra"

[items.answer_key]
type = "free_response"
accepted = ["x = 4", "4"]

[[items]]
id = 7
a = 1.0
b = 1.7
c = 0.2
topic = "algebra"

[items.answer_key]
type = "multiple_choice"
correct = 2

[[items]]
id = 8
a = 1.3
b = 2.4
c = 0.15
topic = "geometry"

[items.answer_key]
type = "multiple_choice"
correct = 5
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use adaptest_core::bank::{parse_item_bank_str, validate_item_bank};

    #[test]
    fn example_bank_is_clean() {
        let bank = parse_item_bank_str(EXAMPLE_BANK, Path::new("example.toml")).unwrap();
        assert_eq!(bank.items.len(), 8);
        assert!(validate_item_bank(&bank).is_empty());
    }
}
