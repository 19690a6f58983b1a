//! Built-in demo workflows. Business workflows live outside the engine;
//! these exist so the CLI has runnable examples and the end-to-end path
//! (steps, state, artifacts, export) can be exercised without external
//! APIs. Each workflow is an explicit ordered step list built up front.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, json};

use crate::artifacts;
use crate::engine::context::RunContext;
use crate::engine::types::{RunState, Step, StepLogic, StepResult, Workflow};

/// Writes a greeting file, registers it as an artifact, and publishes
/// the message as a step output.
struct GreetStep;

#[async_trait]
impl StepLogic for GreetStep {
    async fn execute(&self, ctx: &RunContext, state: &mut RunState) -> Result<StepResult> {
        let message = format!("hello from run {}", ctx.run_id);

        let path = ctx.artifacts_dir.join("greeting.txt");
        tokio::fs::write(&path, format!("{message}\n")).await?;
        artifacts::register_artifact(
            ctx,
            "greeting",
            &path,
            "text",
            Some(json!({"bytes": message.len() + 1})),
        )
        .await?;

        state.data.insert("greeted".to_string(), json!(true));

        let mut outputs = Map::new();
        outputs.insert("message".to_string(), json!(message));
        Ok(StepResult::ok_with(outputs))
    }
}

/// Reads the greeting produced by the previous step and reports its
/// length — exercises output propagation through the run state.
fn measure_step() -> Step {
    Step::from_fn("measure", |_ctx, state| {
        let message = state
            .step_outputs
            .get("greet")
            .and_then(|v| v.get("message"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing output 'message' from step 'greet'"))?;

        let mut outputs = Map::new();
        outputs.insert("message_len".to_string(), json!(message.len()));
        Ok(StepResult::ok_with(outputs))
    })
}

fn demo_workflow() -> Workflow {
    Workflow::new(
        "demo",
        vec![Step::new("greet", Arc::new(GreetStep)), measure_step()],
    )
}

/// A workflow whose last step always fails; handy for exercising the
/// failure path end to end (error artifact, summaries, exit code).
fn demo_fail_workflow() -> Workflow {
    Workflow::new(
        "demo_fail",
        vec![
            Step::new("greet", Arc::new(GreetStep)),
            Step::from_fn("reject", |_ctx, _state| {
                Ok(StepResult::fail("demo_fail always rejects this step"))
            }),
        ],
    )
}

/// The static workflow registry, built before any run starts.
pub fn registry() -> Vec<Workflow> {
    vec![demo_workflow(), demo_fail_workflow()]
}

/// Look up a registered workflow by name.
pub fn find(name: &str) -> Option<Workflow> {
    registry().into_iter().find(|w| w.name == name)
}
