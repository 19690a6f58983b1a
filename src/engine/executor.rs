use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{error, info};

use crate::engine::context::RunContext;
use crate::engine::runlog::RunLog;
use crate::engine::types::*;
use crate::invoke::InvokeError;
use crate::storage;

/// Engine-level settings; workflow business configuration stays outside.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Cap on the serialized run-state snapshot. Exceeding it fails the
    /// step at its persistence boundary instead of growing without bound.
    pub max_state_bytes: usize,
    /// Recorded in the run summary when present.
    pub config_fingerprint: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_state_bytes: 16 * 1024 * 1024,
            config_fingerprint: None,
        }
    }
}

/// Details of a step failure, normalized from any failure path.
struct StepFailure {
    error_code: String,
    message: String,
    api: Option<ApiFailureDetail>,
}

/// Extra fields recorded when the failure originated in the invoker.
struct ApiFailureDetail {
    operation: String,
    status_code: Option<u16>,
    attempts: u32,
    reason: Option<String>,
}

/// The core workflow execution engine: drives ordered steps through the
/// PENDING → RUNNING → {OK, FAILED} lifecycle, persists state at every
/// step boundary, and halts on the first failure.
pub struct WorkflowEngine {
    settings: EngineSettings,
}

impl WorkflowEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    /// Execute `workflow` inside the run directory described by `ctx`.
    ///
    /// Step failures are recorded, never propagated: `Err` from this
    /// method means the run directory itself could not be written.
    pub async fn run(&self, workflow: &Workflow, ctx: &RunContext) -> Result<RunOutcome> {
        let log = RunLog::new(&ctx.logs_path, "engine", &ctx.run_id);

        let run_started = Utc::now();
        log.info("run_start", json!({"workflow": workflow.name})).await?;
        info!(run_id = %ctx.run_id, workflow = %workflow.name, "Starting workflow run");

        let mut state = RunState::default();
        let mut summaries: Vec<StepSummary> = Vec::new();
        let mut failure: Option<(String, StepFailure)> = None;

        for (index, step) in workflow.steps.iter().enumerate() {
            let step_started = Utc::now();
            log.info(
                "step_start",
                json!({"step": step.name, "step_index": index}),
            )
            .await?;
            info!(step = %step.name, index, "Step running");

            // Guard: nothing raised by step logic escapes the run loop.
            let (result, mut raised) = match step.logic.execute(ctx, &mut state).await {
                Ok(result) => (result, None),
                Err(err) => {
                    let converted = classify_error(&err);
                    let result = StepResult::fail(converted.message.clone());
                    (result, Some(converted))
                }
            };

            if let Some(fail) = &raised {
                let mut fields = Map::new();
                fields.insert("step".into(), json!(step.name));
                fields.insert("step_index".into(), json!(index));
                fields.insert("error_type".into(), json!(fail.error_code));
                fields.insert("error_message".into(), json!(fail.message));
                append_api_fields(&mut fields, fail.api.as_ref());
                log.error("step_error", Value::Object(fields)).await?;
            }

            // An explicit ok=false result is a failure too.
            if raised.is_none() && !result.ok {
                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "step reported failure without a message".to_string());
                raised = Some(StepFailure {
                    error_code: "step_failed".to_string(),
                    message,
                    api: None,
                });
            }

            // Merge outputs under the step name, success or failure.
            if let Some(outputs) = &result.outputs {
                state
                    .step_outputs
                    .insert(step.name.clone(), Value::Object(outputs.clone()));
            }

            // Persist the snapshot before anything else happens; the
            // size cap turns an oversized state into a step failure.
            if raised.is_none() {
                if let Err(overflow) = self.persist_state(ctx, &state).await? {
                    raised = Some(overflow);
                }
            } else {
                // Failed step: persist best-effort, the failure wins.
                let _ = self.persist_state(ctx, &state).await?;
            }

            let status = if raised.is_none() {
                StepStatus::Ok
            } else {
                StepStatus::Failed
            };
            let step_finished = Utc::now();
            let duration_ms = (step_finished - step_started).num_milliseconds().max(0);

            log.info(
                "step_end",
                json!({
                    "step": step.name,
                    "step_index": index,
                    "status": status.to_string(),
                    "duration_ms": duration_ms,
                }),
            )
            .await?;

            summaries.push(StepSummary {
                step_name: step.name.clone(),
                step_index: index,
                status: status.clone(),
                started_at: step_started,
                finished_at: step_finished,
                duration_ms,
                error_summary: raised.as_ref().map(|f| f.message.clone()),
                error_code: raised.as_ref().map(|f| f.error_code.clone()),
                metrics: result.outputs.clone().map(Value::Object),
            });

            match raised {
                None => {
                    info!(step = %step.name, duration_ms, "Step completed");
                }
                Some(fail) => {
                    error!(step = %step.name, error = %fail.message, "Step failed — halting run");
                    let artifact_rel = self
                        .write_error_artifact(ctx, workflow, &step.name, index, &fail)
                        .await?;

                    let mut fields = Map::new();
                    fields.insert("workflow".into(), json!(workflow.name));
                    fields.insert("step".into(), json!(step.name));
                    fields.insert("step_index".into(), json!(index));
                    fields.insert("error_type".into(), json!(fail.error_code));
                    fields.insert("error_message".into(), json!(fail.message));
                    append_api_fields(&mut fields, fail.api.as_ref());
                    fields.insert("error_artifact_path".into(), json!(artifact_rel));
                    log.error("step_failed", Value::Object(fields)).await?;

                    failure = Some((step.name.clone(), fail));
                    break;
                }
            }
        }

        // Finalize: run + step summaries are written whether or not the
        // run succeeded.
        let run_finished = Utc::now();
        let duration_ms = (run_finished - run_started).num_milliseconds().max(0);
        let status = if failure.is_none() {
            RunStatus::Ok
        } else {
            RunStatus::Failed
        };

        log.info(
            "run_end",
            json!({
                "status": status.to_string(),
                "duration_ms": duration_ms,
                "ok": failure.is_none(),
            }),
        )
        .await?;

        let run_summary = RunSummary {
            run_id: ctx.run_id.clone(),
            workflow: workflow.name.clone(),
            status: status.clone(),
            started_at: run_started,
            finished_at: run_finished,
            duration_ms,
            error_summary: failure.as_ref().map(|(step, fail)| {
                format!("step '{step}' failed: {}", fail.message)
            }),
            config_fingerprint: self.settings.config_fingerprint.clone(),
        };
        storage::write_json_atomic(&ctx.run_summary_path, &run_summary).await?;
        storage::write_json_atomic(&ctx.steps_summary_path, &summaries).await?;

        info!(run_id = %ctx.run_id, %status, duration_ms, "Workflow run complete");

        Ok(RunOutcome {
            run_id: ctx.run_id.clone(),
            ok: failure.is_none(),
            failed_step: failure.as_ref().map(|(step, _)| step.clone()),
            error: failure.as_ref().map(|(_, fail)| fail.message.clone()),
        })
    }

    /// Write the state snapshot, enforcing the size cap. The outer
    /// `Result` is an I/O fault; the inner one reports cap overflow.
    async fn persist_state(
        &self,
        ctx: &RunContext,
        state: &RunState,
    ) -> Result<Result<(), StepFailure>> {
        let serialized = serde_json::to_string(state)?;
        if serialized.len() > self.settings.max_state_bytes {
            return Ok(Err(StepFailure {
                error_code: "state_overflow".to_string(),
                message: format!(
                    "run state snapshot is {} bytes, exceeding the {} byte cap",
                    serialized.len(),
                    self.settings.max_state_bytes
                ),
                api: None,
            }));
        }

        storage::write_json_atomic(&ctx.state_path, state).await?;
        Ok(Ok(()))
    }

    /// Write `errors/<workflow>__<step>.json` and return its path
    /// relative to the run directory.
    async fn write_error_artifact(
        &self,
        ctx: &RunContext,
        workflow: &Workflow,
        step_name: &str,
        step_index: usize,
        fail: &StepFailure,
    ) -> Result<String> {
        let file_name = format!("{}__{}.json", workflow.name, step_name);
        let path = ctx.errors_dir.join(&file_name);

        let mut record = Map::new();
        record.insert("ts".into(), json!(Utc::now().to_rfc3339()));
        record.insert("run_id".into(), json!(ctx.run_id));
        record.insert("workflow".into(), json!(workflow.name));
        record.insert("step".into(), json!(step_name));
        record.insert("step_index".into(), json!(step_index));
        record.insert("status".into(), json!(StepStatus::Failed.to_string()));
        record.insert("error_type".into(), json!(fail.error_code));
        record.insert("error_message".into(), json!(fail.message));
        append_api_fields(&mut record, fail.api.as_ref());

        storage::write_json_atomic(&path, &Value::Object(record)).await?;

        Ok(format!("errors/{file_name}"))
    }
}

/// Convert any error raised by step logic into a normalized failure.
/// Invoker errors keep their operation/status/attempts/reason metadata.
fn classify_error(err: &anyhow::Error) -> StepFailure {
    if let Some(invoke_err) = err.downcast_ref::<InvokeError>() {
        StepFailure {
            error_code: invoke_err.code().to_string(),
            message: invoke_err.to_string(),
            api: Some(ApiFailureDetail {
                operation: invoke_err.operation().to_string(),
                status_code: invoke_err.status(),
                attempts: invoke_err.attempts(),
                reason: invoke_err.reason().map(str::to_string),
            }),
        }
    } else {
        StepFailure {
            error_code: "step_error".to_string(),
            message: format!("{err:#}"),
            api: None,
        }
    }
}

fn append_api_fields(fields: &mut Map<String, Value>, api: Option<&ApiFailureDetail>) {
    if let Some(api) = api {
        fields.insert("operation".into(), json!(api.operation));
        fields.insert("attempts".into(), json!(api.attempts));
        if let Some(status) = api.status_code {
            fields.insert("status_code".into(), json!(status));
        }
        if let Some(reason) = &api.reason {
            fields.insert("reason".into(), json!(reason));
        }
    }
}
