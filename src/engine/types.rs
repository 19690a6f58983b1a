use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::context::RunContext;

/// Status of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Ok,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Ok => write!(f, "OK"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Status of an individual step within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    Pending,
    Running,
    Ok,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "PENDING"),
            StepStatus::Running => write!(f, "RUNNING"),
            StepStatus::Ok => write!(f, "OK"),
            StepStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Uniform result returned by step logic.
///
/// A failed result always carries an error message; use the constructors
/// rather than building the struct by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            outputs: None,
            error: None,
        }
    }

    pub fn ok_with(outputs: Map<String, Value>) -> Self {
        Self {
            ok: true,
            outputs: Some(outputs),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            outputs: None,
            error: Some(error.into()),
        }
    }

    pub fn fail_with(error: impl Into<String>, outputs: Map<String, Value>) -> Self {
        Self {
            ok: false,
            outputs: Some(outputs),
            error: Some(error.into()),
        }
    }
}

/// Mutable shared state of a single run. Step logic writes freely into
/// `data`; the engine records each step's outputs under `step_outputs`
/// and persists a snapshot after every step boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub data: Map<String, Value>,
    pub step_outputs: Map<String, Value>,
}

/// Trait implemented by the logic of one workflow step.
///
/// Steps read the immutable run context and mutate the shared run state.
/// Returning `Err` is equivalent to a failed result; the engine converts
/// it at the step boundary and nothing escapes the run loop.
#[async_trait]
pub trait StepLogic: Send + Sync {
    async fn execute(&self, ctx: &RunContext, state: &mut RunState) -> Result<StepResult>;
}

/// Adapter wrapping a plain synchronous closure as step logic.
pub struct FnStep<F>(pub F);

#[async_trait]
impl<F> StepLogic for FnStep<F>
where
    F: Fn(&RunContext, &mut RunState) -> Result<StepResult> + Send + Sync,
{
    async fn execute(&self, ctx: &RunContext, state: &mut RunState) -> Result<StepResult> {
        (self.0)(ctx, state)
    }
}

/// One ordered unit of work within a workflow: a name plus its logic.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub logic: Arc<dyn StepLogic>,
}

impl Step {
    pub fn new(name: impl Into<String>, logic: Arc<dyn StepLogic>) -> Self {
        Self {
            name: name.into(),
            logic,
        }
    }

    /// Build a step from a plain synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&RunContext, &mut RunState) -> Result<StepResult> + Send + Sync + 'static,
    {
        Self::new(name, Arc::new(FnStep(f)))
    }
}

/// A named workflow: an explicit ordered list of steps, built before the
/// run starts. There is no runtime step discovery.
#[derive(Clone)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

/// Persisted summary of one run (`run.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub workflow: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_fingerprint: Option<String>,
}

/// Persisted summary of one executed step (an entry of `steps.json`).
/// Unreached steps are never recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_name: String,
    pub step_index: usize,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

/// Outcome of a run, returned to the caller after finalization.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub ok: bool,
    pub failed_step: Option<String>,
    pub error: Option<String>,
}
