use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use uuid::Uuid;

/// Generate a new opaque run identifier.
pub fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Immutable identity and filesystem layout of one run.
///
/// The run directory is owned exclusively by the process executing the
/// run; distinct run ids map to disjoint directories.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub logs_path: PathBuf,
    pub state_path: PathBuf,
    pub run_summary_path: PathBuf,
    pub steps_summary_path: PathBuf,
    pub errors_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub artifacts_index_path: PathBuf,
}

impl RunContext {
    /// Allocate a fresh run id and create its directory under `runs_dir`.
    pub async fn create(runs_dir: impl AsRef<Path>) -> Result<Self> {
        let ctx = Self::for_run_id(runs_dir, new_run_id());

        tokio::fs::create_dir_all(&ctx.run_dir)
            .await
            .with_context(|| format!("Failed to create run dir: {}", ctx.run_dir.display()))?;
        tokio::fs::create_dir_all(&ctx.artifacts_dir)
            .await
            .with_context(|| {
                format!("Failed to create artifacts dir: {}", ctx.artifacts_dir.display())
            })?;

        Ok(ctx)
    }

    /// Compute the layout for an existing or future run id without
    /// touching the filesystem.
    pub fn for_run_id(runs_dir: impl AsRef<Path>, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        let run_dir = runs_dir.as_ref().join(&run_id);
        let artifacts_dir = run_dir.join("artifacts");

        Self {
            logs_path: run_dir.join("logs.jsonl"),
            state_path: run_dir.join("state.json"),
            run_summary_path: run_dir.join("run.json"),
            steps_summary_path: run_dir.join("steps.json"),
            errors_dir: run_dir.join("errors"),
            artifacts_index_path: artifacts_dir.join("index.json"),
            artifacts_dir,
            run_dir,
            run_id,
        }
    }
}
