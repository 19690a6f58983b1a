//! Audit export: deterministically renders a run's persisted summaries
//! into a structured JSON bundle or a flattened CSV table.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::json;
use thiserror::Error;

use crate::engine::types::{RunSummary, StepSummary, StepStatus};

pub const AUDIT_JSON_FILENAME: &str = "audit.json";
pub const AUDIT_CSV_FILENAME: &str = "audit.csv";

/// Fixed column order: run identity/status/timing first, then step
/// identity/status/timing/error/metrics.
pub const CSV_HEADERS: [&str; 13] = [
    "run_id",
    "workflow",
    "run_status",
    "run_started_at",
    "run_finished_at",
    "run_duration_ms",
    "step_name",
    "step_status",
    "step_started_at",
    "step_finished_at",
    "step_duration_ms",
    "step_error_summary",
    "step_metrics",
];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("run_id not found: {run_id} (expected directory: {dir})")]
    NotFound { run_id: String, dir: PathBuf },
    #[error("unreadable run summary: {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(ExportError::UnsupportedFormat(other.to_string())),
        }
    }
}

fn resolve_run_dir(runs_dir: &Path, run_id: &str) -> Result<PathBuf, ExportError> {
    let run_dir = runs_dir.join(run_id);
    if !run_dir.is_dir() {
        return Err(ExportError::NotFound {
            run_id: run_id.to_string(),
            dir: run_dir,
        });
    }
    Ok(run_dir)
}

async fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ExportError> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ExportError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    serde_json::from_str(&data).map_err(|e| ExportError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Load the persisted run and step summaries for one run.
pub async fn load_run_summaries(
    runs_dir: &Path,
    run_id: &str,
) -> Result<(RunSummary, Vec<StepSummary>), ExportError> {
    let run_dir = resolve_run_dir(runs_dir, run_id)?;
    let run: RunSummary = load_json(&run_dir.join("run.json")).await?;
    let steps: Vec<StepSummary> = load_json(&run_dir.join("steps.json")).await?;
    Ok((run, steps))
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp_path, data).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn csv_rows(run: &RunSummary, steps: &[StepSummary]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADERS)?;

    for step in steps {
        let metrics = match &step.metrics {
            Some(value) => value.to_string(),
            None => String::new(),
        };
        let error_summary = match step.status {
            StepStatus::Failed => step.error_summary.clone().unwrap_or_default(),
            _ => String::new(),
        };

        let record: [String; 13] = [
            run.run_id.clone(),
            run.workflow.clone(),
            run.status.to_string(),
            run.started_at.to_rfc3339(),
            run.finished_at.to_rfc3339(),
            run.duration_ms.to_string(),
            step.step_name.clone(),
            step.status.to_string(),
            step.started_at.to_rfc3339(),
            step.finished_at.to_rfc3339(),
            step.duration_ms.to_string(),
            error_summary,
            metrics,
        ];
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| ExportError::Io(std::io::Error::other(e)))
}

impl From<csv::Error> for ExportError {
    fn from(err: csv::Error) -> Self {
        ExportError::Io(std::io::Error::other(err))
    }
}

/// Export one run's audit record. Returns the output path. The output is
/// fully rendered in memory first: a failed load emits nothing.
pub async fn export_run_audit(
    runs_dir: &Path,
    run_id: &str,
    format: ExportFormat,
    out_path: Option<PathBuf>,
) -> Result<PathBuf, ExportError> {
    let run_dir = resolve_run_dir(runs_dir, run_id)?;
    let (run, steps) = load_run_summaries(runs_dir, run_id).await?;

    let output_path = out_path.unwrap_or_else(|| match format {
        ExportFormat::Json => run_dir.join(AUDIT_JSON_FILENAME),
        ExportFormat::Csv => run_dir.join(AUDIT_CSV_FILENAME),
    });

    let rendered = match format {
        ExportFormat::Json => {
            let bundle = json!({"run": run, "steps": steps});
            let mut data = serde_json::to_string_pretty(&bundle).map_err(|e| {
                ExportError::Unreadable {
                    path: run_dir.join("run.json"),
                    reason: e.to_string(),
                }
            })?;
            data.push('\n');
            data.into_bytes()
        }
        ExportFormat::Csv => csv_rows(&run, &steps)?,
    };

    write_atomic(&output_path, &rendered).await?;
    Ok(output_path)
}
