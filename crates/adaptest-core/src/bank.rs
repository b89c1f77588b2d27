//! TOML item bank parser and the static in-memory bank.
//!
//! A bank file looks like:
//!
//! ```toml
//! [bank]
//! id = "algebra"
//! name = "Algebra I"
//!
//! [[items]]
//! id = 1
//! a = 1.2
//! b = -0.4
//! c = 0.2
//! topic = "linear-equations"
//!
//! [items.answer_key]
//! type = "multiple_choice"
//! correct = 2
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::error::CatError;
use crate::model::{Item, ItemId};
use crate::traits::ItemBank;

/// Discrimination below this barely separates examinees.
const WEAK_DISCRIMINATION: f64 = 0.3;
/// Guessing above this usually indicates a miscalibrated item.
const HIGH_GUESSING: f64 = 0.35;
/// Difficulty beyond this is outside any realistic ability range.
const EXTREME_DIFFICULTY: f64 = 4.0;

#[derive(Debug, Deserialize)]
struct TomlBankFile {
    bank: TomlBankHeader,
    #[serde(default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct TomlBankHeader {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
}

/// A parsed item bank file.
#[derive(Debug, Clone)]
pub struct ItemBankFile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub items: Vec<Item>,
}

/// Parse a single TOML bank file.
pub fn parse_item_bank(path: &Path) -> Result<ItemBankFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read item bank file: {}", path.display()))?;

    parse_item_bank_str(&content, path)
}

/// Parse bank TOML from a string.
pub fn parse_item_bank_str(content: &str, source_path: &Path) -> Result<ItemBankFile> {
    let parsed: TomlBankFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    Ok(ItemBankFile {
        id: parsed.bank.id,
        name: parsed.bank.name,
        description: parsed.bank.description,
        items: parsed.items,
    })
}

/// Recursively load every `.toml` bank under `dir`. Unparseable files are
/// skipped with a warning.
pub fn load_bank_directory(dir: &Path) -> Result<Vec<ItemBankFile>> {
    let mut banks = Vec::new();

    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();

        if path.is_dir() {
            banks.extend(load_bank_directory(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            match parse_item_bank(&path) {
                Ok(bank) => banks.push(bank),
                Err(e) => tracing::warn!("skipping {}: {:#}", path.display(), e),
            }
        }
    }

    Ok(banks)
}

/// Severity of a bank lint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The bank cannot be served.
    Error,
    /// Suspicious but usable.
    Warning,
}

/// One finding from [`validate_item_bank`].
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub item_id: Option<ItemId>,
    pub severity: Severity,
    pub message: String,
}

impl ValidationWarning {
    fn error(item_id: Option<ItemId>, message: impl Into<String>) -> Self {
        Self {
            item_id,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(item_id: ItemId, message: impl Into<String>) -> Self {
        Self {
            item_id: Some(item_id),
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// Lint a bank for common calibration problems.
pub fn validate_item_bank(bank: &ItemBankFile) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if bank.items.is_empty() {
        warnings.push(ValidationWarning::error(None, "bank has no items"));
    }

    let mut seen = HashSet::new();
    for item in &bank.items {
        if !seen.insert(item.id) {
            warnings.push(ValidationWarning::error(
                Some(item.id),
                format!("duplicate item ID: {}", item.id),
            ));
        }
        if let Err(e) = item.validate() {
            warnings.push(ValidationWarning::error(Some(item.id), e.to_string()));
            continue;
        }
        if item.a < WEAK_DISCRIMINATION {
            warnings.push(ValidationWarning::warning(
                item.id,
                format!("weak discrimination a = {}", item.a),
            ));
        }
        if item.c > HIGH_GUESSING {
            warnings.push(ValidationWarning::warning(
                item.id,
                format!("high guessing parameter c = {}", item.c),
            ));
        }
        if item.b.abs() > EXTREME_DIFFICULTY {
            warnings.push(ValidationWarning::warning(
                item.id,
                format!("difficulty b = {} outside the ability range", item.b),
            ));
        }
        if item.topic.as_deref().is_some_and(|t| t.trim().is_empty()) {
            warnings.push(ValidationWarning::warning(item.id, "topic is empty"));
        }
    }

    warnings
}

/// An item bank held in memory, sorted by item id.
#[derive(Debug, Clone, Default)]
pub struct StaticItemBank {
    items: Vec<Item>,
    index: HashMap<ItemId, usize>,
}

impl StaticItemBank {
    /// Build a bank, rejecting items outside the 3PL domain and duplicate ids.
    pub fn new(mut items: Vec<Item>) -> Result<Self, CatError> {
        items.sort_by_key(|item| item.id);
        let mut index = HashMap::with_capacity(items.len());
        for (pos, item) in items.iter().enumerate() {
            item.validate()?;
            if index.insert(item.id, pos).is_some() {
                return Err(CatError::InvalidItem {
                    id: item.id,
                    reason: "duplicate item id".to_string(),
                });
            }
        }
        Ok(Self { items, index })
    }

    /// Load and build from a TOML bank file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bank = parse_item_bank(path)?;
        Self::new(bank.items).with_context(|| format!("invalid item bank: {}", path.display()))
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self
            .items
            .iter()
            .filter_map(|item| item.topic.as_deref())
            .collect();
        topics.sort_unstable();
        topics.dedup();
        topics
    }
}

#[async_trait]
impl ItemBank for StaticItemBank {
    async fn get_item(&self, id: ItemId) -> Result<Option<Item>> {
        Ok(self.index.get(&id).map(|&pos| self.items[pos].clone()))
    }

    async fn list_candidates(&self, topic: Option<&str>) -> Result<Vec<Item>> {
        Ok(self
            .items
            .iter()
            .filter(|item| topic.is_none() || item.topic.as_deref() == topic)
            .cloned()
            .collect())
    }
}
