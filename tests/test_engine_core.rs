//! Core engine lifecycle: ordering, stop-on-failure, state persistence.

use serde_json::{Map, Value, json};
use std::sync::{Arc, Mutex};

use stepflow::engine::types::*;
use stepflow::engine::{EngineSettings, RunContext, WorkflowEngine};

fn outputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn tracking_step(name: &str, executed: Arc<Mutex<Vec<String>>>, result: StepResult) -> Step {
    let name_owned = name.to_string();
    Step::from_fn(name, move |_ctx, _state| {
        executed.lock().unwrap().push(name_owned.clone());
        Ok(result.clone())
    })
}

async fn run_workflow(workflow: &Workflow) -> (RunContext, RunOutcome, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let ctx = RunContext::create(dir.path().join("runs")).await.unwrap();
    let engine = WorkflowEngine::new(EngineSettings::default());
    let outcome = engine.run(workflow, &ctx).await.unwrap();
    (ctx, outcome, dir)
}

fn load_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn all_success_runs_every_step_in_order() {
    let executed = Arc::new(Mutex::new(Vec::new()));
    let workflow = Workflow::new(
        "ok",
        vec![
            tracking_step(
                "one",
                executed.clone(),
                StepResult::ok_with(outputs(&[("a", json!(1))])),
            ),
            tracking_step(
                "two",
                executed.clone(),
                StepResult::ok_with(outputs(&[("b", json!(2))])),
            ),
        ],
    );

    let (ctx, outcome, _dir) = run_workflow(&workflow).await;

    assert!(outcome.ok);
    assert!(outcome.failed_step.is_none());
    assert_eq!(*executed.lock().unwrap(), vec!["one", "two"]);

    let run = load_json(&ctx.run_summary_path);
    assert_eq!(run["status"], "OK");
    assert_eq!(run["workflow"], "ok");
    assert_eq!(run["run_id"], ctx.run_id);
    assert!(run["error_summary"].is_null());

    let steps = load_json(&ctx.steps_summary_path);
    let steps = steps.as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["step_name"], "one");
    assert_eq!(steps[0]["step_index"], 0);
    assert_eq!(steps[1]["step_name"], "two");
    assert_eq!(steps[1]["step_index"], 1);
    assert!(steps.iter().all(|s| s["status"] == "OK"));
}

#[tokio::test]
async fn failure_at_index_k_short_circuits_later_steps() {
    let executed = Arc::new(Mutex::new(Vec::new()));
    let workflow = Workflow::new(
        "fail",
        vec![
            tracking_step("one", executed.clone(), StepResult::ok()),
            tracking_step("two", executed.clone(), StepResult::fail("nope")),
            tracking_step("three", executed.clone(), StepResult::ok()),
        ],
    );

    let (ctx, outcome, _dir) = run_workflow(&workflow).await;

    assert!(!outcome.ok);
    assert_eq!(outcome.failed_step.as_deref(), Some("two"));
    assert_eq!(outcome.error.as_deref(), Some("nope"));
    assert_eq!(*executed.lock().unwrap(), vec!["one", "two"]);

    let run = load_json(&ctx.run_summary_path);
    assert_eq!(run["status"], "FAILED");

    // Unreached steps are absent, never recorded as PENDING.
    let steps = load_json(&ctx.steps_summary_path);
    let steps = steps.as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["status"], "OK");
    assert_eq!(steps[1]["status"], "FAILED");
    assert_eq!(steps[1]["error_code"], "step_failed");
}

#[tokio::test]
async fn raised_errors_are_converted_and_logged() {
    let workflow = Workflow::new(
        "boom",
        vec![
            Step::from_fn("one", |_ctx, state| {
                state.data.insert("a".to_string(), json!(1));
                Ok(StepResult::ok())
            }),
            Step::from_fn("boom", |_ctx, _state| Err(anyhow::anyhow!("boom"))),
            Step::from_fn("three", |_ctx, _state| Ok(StepResult::ok())),
        ],
    );

    let (ctx, outcome, _dir) = run_workflow(&workflow).await;

    assert!(!outcome.ok);
    assert_eq!(outcome.failed_step.as_deref(), Some("boom"));

    // State from the successful step survives the later raise.
    let state = load_json(&ctx.state_path);
    assert_eq!(state["data"]["a"], 1);

    let text = std::fs::read_to_string(&ctx.logs_path).unwrap();
    let records: Vec<Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert!(records.iter().any(|r| r["event"] == "step_error"
        && r["error_type"] == "step_error"
        && r["step"] == "boom"));
    assert!(
        records
            .iter()
            .any(|r| r["event"] == "run_end" && r["ok"] == false)
    );
    for r in &records {
        for key in ["timestamp", "level", "component", "event", "run_id"] {
            assert!(r.get(key).is_some(), "missing field {key}");
        }
    }
}

#[tokio::test]
async fn persisted_state_reloads_to_in_memory_state() {
    let workflow = Workflow::new(
        "persist",
        vec![Step::from_fn("write", |_ctx, state| {
            state.data.insert("answer".to_string(), json!(42));
            state
                .data
                .insert("nested".to_string(), json!({"k": [1, 2, 3]}));
            Ok(StepResult::ok_with(
                [("produced".to_string(), json!(true))].into_iter().collect(),
            ))
        })],
    );

    let (ctx, outcome, _dir) = run_workflow(&workflow).await;
    assert!(outcome.ok);

    let reloaded: RunState =
        serde_json::from_str(&std::fs::read_to_string(&ctx.state_path).unwrap()).unwrap();

    let mut expected = RunState::default();
    expected.data.insert("answer".to_string(), json!(42));
    expected
        .data
        .insert("nested".to_string(), json!({"k": [1, 2, 3]}));
    expected
        .step_outputs
        .insert("write".to_string(), json!({"produced": true}));

    assert_eq!(reloaded, expected);
}

#[tokio::test]
async fn outputs_propagate_between_steps() {
    let workflow = Workflow::new(
        "propagate",
        vec![
            Step::from_fn("step1", |_ctx, _state| {
                Ok(StepResult::ok_with(
                    [("n".to_string(), json!(1))].into_iter().collect(),
                ))
            }),
            Step::from_fn("step2", |_ctx, state| {
                match state
                    .step_outputs
                    .get("step1")
                    .and_then(|v| v.get("n"))
                    .and_then(Value::as_i64)
                {
                    Some(n) => Ok(StepResult::ok_with(
                        [("n_plus_one".to_string(), json!(n + 1))].into_iter().collect(),
                    )),
                    None => Ok(StepResult::fail("missing output step1.n")),
                }
            }),
        ],
    );

    let (ctx, outcome, _dir) = run_workflow(&workflow).await;

    assert!(outcome.ok, "step2 should see step1's outputs");
    let state = load_json(&ctx.state_path);
    assert_eq!(state["step_outputs"]["step2"]["n_plus_one"], 2);
}

#[tokio::test]
async fn failed_step_outputs_are_still_merged() {
    let workflow = Workflow::new(
        "partial",
        vec![Step::from_fn("flaky", |_ctx, _state| {
            Ok(StepResult::fail_with(
                "went sideways",
                [("partial".to_string(), json!(true))].into_iter().collect(),
            ))
        })],
    );

    let (ctx, outcome, _dir) = run_workflow(&workflow).await;

    assert!(!outcome.ok);
    let state = load_json(&ctx.state_path);
    assert_eq!(state["step_outputs"]["flaky"]["partial"], true);

    let steps = load_json(&ctx.steps_summary_path);
    assert_eq!(steps[0]["metrics"]["partial"], true);
}

#[tokio::test]
async fn oversized_state_fails_the_step_at_the_persistence_boundary() {
    let workflow = Workflow::new(
        "bloat",
        vec![
            Step::from_fn("grow", |_ctx, state| {
                state
                    .data
                    .insert("blob".to_string(), json!("x".repeat(4096)));
                Ok(StepResult::ok())
            }),
            Step::from_fn("unreached", |_ctx, _state| Ok(StepResult::ok())),
        ],
    );

    let dir = tempfile::tempdir().unwrap();
    let ctx = RunContext::create(dir.path().join("runs")).await.unwrap();
    let engine = WorkflowEngine::new(EngineSettings {
        max_state_bytes: 1024,
        config_fingerprint: None,
    });
    let outcome = engine.run(&workflow, &ctx).await.unwrap();

    assert!(!outcome.ok);
    assert_eq!(outcome.failed_step.as_deref(), Some("grow"));
    assert!(outcome.error.unwrap().contains("exceeding"));

    let steps = load_json(&ctx.steps_summary_path);
    let steps = steps.as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["error_code"], "state_overflow");
}

#[tokio::test]
async fn reruns_get_distinct_run_ids_and_directories() {
    let dir = tempfile::tempdir().unwrap();
    let runs_dir = dir.path().join("runs");
    let workflow = Workflow::new(
        "again",
        vec![Step::from_fn("noop", |_ctx, _state| Ok(StepResult::ok()))],
    );
    let engine = WorkflowEngine::new(EngineSettings::default());

    let ctx1 = RunContext::create(&runs_dir).await.unwrap();
    engine.run(&workflow, &ctx1).await.unwrap();
    let ctx2 = RunContext::create(&runs_dir).await.unwrap();
    engine.run(&workflow, &ctx2).await.unwrap();

    assert_ne!(ctx1.run_id, ctx2.run_id);
    assert!(ctx1.run_summary_path.exists());
    assert!(ctx2.run_summary_path.exists());
}
