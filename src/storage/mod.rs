//! Atomic JSON persistence helpers and the on-disk run store.
//!
//! Every persisted document is written to a `.tmp` sibling and renamed
//! into place, so readers never observe a torn write.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::engine::types::{RunSummary, StepSummary};

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = tmp_sibling(path);
    let mut data = serde_json::to_string_pretty(value)?;
    data.push('\n');

    tokio::fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    Ok(())
}

/// Read and parse a JSON document.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Failed to parse {}", path.display()))
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read access to the runs directory: one subdirectory per run id.
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: impl AsRef<Path>) -> Self {
        Self {
            runs_dir: runs_dir.as_ref().to_path_buf(),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    /// Load the persisted summaries of one run.
    pub async fn load_summaries(&self, run_id: &str) -> Result<(RunSummary, Vec<StepSummary>)> {
        let run_dir = self.run_dir(run_id);
        let run: RunSummary = read_json(&run_dir.join("run.json")).await?;
        let steps: Vec<StepSummary> = read_json(&run_dir.join("steps.json")).await?;
        Ok((run, steps))
    }

    /// List finalized runs, newest first. Directories without a readable
    /// `run.json` (in-flight or crashed runs) are skipped.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Ok(data) = tokio::fs::read_to_string(path.join("run.json")).await
                && let Ok(summary) = serde_json::from_str::<RunSummary>(&data)
            {
                runs.push(summary);
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}
