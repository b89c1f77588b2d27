//! Durable stores for final session results.
//!
//! Both stores write each session at most once; a repeated write for the same
//! session is ignored and reported as `false`. The file store links a fully
//! written scratch file into place, so a crash never leaves a truncated result.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use adaptest_core::model::SessionId;
use adaptest_core::traits::{FinalResult, ResultsStore};

/// Results kept in memory for the lifetime of the process.
#[derive(Default)]
pub struct InMemoryResultsStore {
    results: RwLock<HashMap<SessionId, FinalResult>>,
}

impl InMemoryResultsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }

    /// Every recorded result, ordered by session id.
    pub async fn all(&self) -> Vec<FinalResult> {
        let mut all: Vec<FinalResult> = self.results.read().await.values().cloned().collect();
        all.sort_by(|x, y| x.state.session_id.as_str().cmp(y.state.session_id.as_str()));
        all
    }
}

#[async_trait]
impl ResultsStore for InMemoryResultsStore {
    async fn record_final(&self, result: &FinalResult) -> Result<bool> {
        let mut results = self.results.write().await;
        if results.contains_key(&result.state.session_id) {
            tracing::debug!(session = %result.state.session_id, "result already recorded");
            return Ok(false);
        }
        results.insert(result.state.session_id.clone(), result.clone());
        Ok(true)
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<FinalResult>> {
        Ok(self.results.read().await.get(session_id).cloned())
    }
}

/// One pretty-printed JSON file per session under a directory.
pub struct JsonFileResultsStore {
    dir: PathBuf,
}

impl JsonFileResultsStore {
    /// Create the store, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create results directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(session_id)))
    }

    /// A private scratch file in the results directory; never ends in `.json`.
    fn temp_path_for(&self, session_id: &SessionId) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            ".{}.{}-{n}.tmp",
            file_stem(session_id),
            std::process::id()
        ))
    }

    /// Load every result file in the directory.
    pub async fn list(&self) -> Result<Vec<FinalResult>> {
        let mut results = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read directory: {}", self.dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match read_result(&path).await {
                    Ok(result) => results.push(result),
                    Err(e) => tracing::warn!("skipping {}: {:#}", path.display(), e),
                }
            }
        }

        results.sort_by(|x, y| x.state.session_id.as_str().cmp(y.state.session_id.as_str()));
        Ok(results)
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// File stem for a session id. ASCII letters, digits and `-` are kept and
/// every other byte becomes `_xx`, so distinct ids never share a file.
fn file_stem(session_id: &SessionId) -> String {
    let mut stem = String::with_capacity(session_id.as_str().len());
    for byte in session_id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            let _ = write!(stem, "_{byte:02x}");
        }
    }
    stem
}

async fn write_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

async fn read_result(path: &Path) -> Result<FinalResult> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read result: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse result: {}", path.display()))
}

#[async_trait]
impl ResultsStore for JsonFileResultsStore {
    async fn record_final(&self, result: &FinalResult) -> Result<bool> {
        let session_id = &result.state.session_id;
        let path = self.path_for(session_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(session = %session_id, "result already recorded");
            return Ok(false);
        }
        let json = serde_json::to_string_pretty(result)?;

        // The complete file is linked into place, so readers never see a
        // partial write and the first writer wins.
        let temp = self.temp_path_for(session_id);
        if let Err(e) = write_file(&temp, json.as_bytes()).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e).with_context(|| format!("failed to write result: {}", path.display()));
        }
        let linked = tokio::fs::hard_link(&temp, &path).await;
        if let Err(e) = tokio::fs::remove_file(&temp).await {
            tracing::warn!("failed to remove {}: {}", temp.display(), e);
        }
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(session = %session_id, "result already recorded");
                Ok(false)
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to publish result: {}", path.display()))
            }
        }
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<FinalResult>> {
        let path = self.path_for(session_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let result = read_result(&path).await?;
        anyhow::ensure!(
            result.state.session_id == *session_id,
            "{} holds session {}, expected {}",
            path.display(),
            result.state.session_id,
            session_id
        );
        Ok(Some(result))
    }
}
