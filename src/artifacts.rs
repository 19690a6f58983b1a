//! Append-only artifact index: files a step produces and registers for
//! later discovery (`artifacts/index.json`).

use std::path::Path;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::context::RunContext;
use crate::storage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Path relative to the run directory, forward slashes.
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
}

/// Load the artifact index for a run; an absent index is an empty list.
pub async fn load_index(ctx: &RunContext) -> Result<Vec<ArtifactRecord>> {
    if !ctx.artifacts_index_path.exists() {
        return Ok(Vec::new());
    }
    storage::read_json(&ctx.artifacts_index_path).await
}

/// Register a file under the run directory in the artifact index.
/// Artifact names are unique per run.
pub async fn register_artifact(
    ctx: &RunContext,
    name: &str,
    path: &Path,
    kind: &str,
    metadata: Option<Value>,
) -> Result<ArtifactRecord> {
    let rel = path
        .strip_prefix(&ctx.run_dir)
        .map_err(|_| {
            anyhow::anyhow!(
                "artifact path {} is outside run dir {}",
                path.display(),
                ctx.run_dir.display()
            )
        })?
        .to_string_lossy()
        .replace('\\', "/");

    let mut index = load_index(ctx).await?;
    if index.iter().any(|r| r.name == name) {
        bail!("artifact name already registered in this run: {name}");
    }

    let record = ArtifactRecord {
        name: name.to_string(),
        kind: kind.to_string(),
        path: rel,
        created_at: Utc::now(),
        metadata: metadata.unwrap_or_else(|| Value::Object(Default::default())),
    };

    index.push(record.clone());
    storage::write_json_atomic(&ctx.artifacts_index_path, &index).await?;

    Ok(record)
}
