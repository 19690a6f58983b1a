use std::path::PathBuf;

use anyhow::{Context as _, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt;

/// Append-only JSONL lifecycle log for one run.
///
/// Every record carries `timestamp`, `level`, `component`, `event` and
/// `run_id`; callers add event-specific fields on top. One JSON object
/// per line, flushed per record so the on-disk log never holds a torn
/// write for a completed event.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    component: String,
    run_id: String,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>, component: &str, run_id: &str) -> Self {
        Self {
            path: path.into(),
            component: component.to_string(),
            run_id: run_id.to_string(),
        }
    }

    pub async fn append(&self, level: &str, event: &str, fields: Value) -> Result<()> {
        let mut record = Map::new();
        record.insert(
            "timestamp".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        record.insert("level".to_string(), json!(level));
        record.insert("component".to_string(), json!(self.component));
        record.insert("event".to_string(), json!(event));
        record.insert("run_id".to_string(), json!(self.run_id));

        if let Value::Object(extra) = fields {
            for (k, v) in extra {
                record.insert(k, v);
            }
        }

        let mut line = Value::Object(record).to_string();
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open run log: {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    pub async fn info(&self, event: &str, fields: Value) -> Result<()> {
        self.append("INFO", event, fields).await
    }

    pub async fn error(&self, event: &str, fields: Value) -> Result<()> {
        self.append("ERROR", event, fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_carry_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.jsonl");
        let log = RunLog::new(&path, "engine", "run-1");

        log.info("run_start", json!({"workflow": "demo"})).await.unwrap();
        log.error("step_error", json!({"step": "one"})).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);

        for record in &records {
            for key in ["timestamp", "level", "component", "event", "run_id"] {
                assert!(record.get(key).is_some(), "missing field {key}");
            }
            assert_eq!(record["component"], "engine");
            assert_eq!(record["run_id"], "run-1");
        }
        assert_eq!(records[0]["event"], "run_start");
        assert_eq!(records[0]["workflow"], "demo");
        assert_eq!(records[1]["level"], "ERROR");
    }
}
