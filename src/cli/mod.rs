pub mod config;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use crate::cli::config::AppConfig;
use crate::engine::types::StepStatus;
use crate::engine::{EngineSettings, RunContext, WorkflowEngine};
use crate::export::{self, ExportFormat};
use crate::storage::RunStore;
use crate::workflows;

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Auditable workflow engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a registered workflow
    Run {
        /// Workflow name (see `stepflow workflows`)
        workflow: String,

        /// Runs directory (overrides STEPFLOW_RUNS_DIR)
        #[arg(long)]
        runs_dir: Option<PathBuf>,
    },

    /// Export the audit record of a finished run
    Export {
        /// Run ID
        run_id: String,

        /// Output format (json, csv)
        #[arg(long, default_value = "json")]
        format: String,

        /// Output path (default: audit.json/audit.csv inside the run dir)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Runs directory (overrides STEPFLOW_RUNS_DIR)
        #[arg(long)]
        runs_dir: Option<PathBuf>,
    },

    /// List finalized runs, newest first
    List {
        /// Runs directory (overrides STEPFLOW_RUNS_DIR)
        #[arg(long)]
        runs_dir: Option<PathBuf>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Print a run's summaries as JSON
    Inspect {
        /// Run ID
        run_id: String,

        /// Runs directory (overrides STEPFLOW_RUNS_DIR)
        #[arg(long)]
        runs_dir: Option<PathBuf>,
    },

    /// List registered workflows
    Workflows,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = AppConfig::from_env()?;

    match cli.command {
        Commands::Run { workflow, runs_dir } => cmd_run(workflow, runs_dir, config).await,
        Commands::Export {
            run_id,
            format,
            out,
            runs_dir,
        } => cmd_export(run_id, format, out, runs_dir, config).await,
        Commands::List { runs_dir, format } => cmd_list(runs_dir, format, config).await,
        Commands::Inspect { run_id, runs_dir } => cmd_inspect(run_id, runs_dir, config).await,
        Commands::Workflows => cmd_workflows(),
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => {
            // Auto-detect .env in current directory
            match dotenvy::dotenv() {
                Ok(path) => info!("Loaded env from {}", path.display()),
                Err(dotenvy::Error::Io(_)) => {
                    // No .env file found — that's fine, silently skip
                }
                Err(e) => {
                    eprintln!("Warning: Failed to parse .env file: {}", e);
                }
            }
        }
    }
}

async fn cmd_run(workflow_name: String, runs_dir: Option<PathBuf>, config: AppConfig) -> Result<()> {
    let workflow = workflows::find(&workflow_name).with_context(|| {
        format!(
            "Unknown workflow '{}'. Run `stepflow workflows` to list available workflows",
            workflow_name
        )
    })?;

    let runs_dir = runs_dir.unwrap_or_else(|| config.runs_dir.clone());
    let ctx = RunContext::create(&runs_dir).await?;
    let engine = WorkflowEngine::new(EngineSettings {
        max_state_bytes: config.max_state_bytes,
        config_fingerprint: Some(config.fingerprint()),
    });

    let outcome = engine.run(&workflow, &ctx).await?;

    let store = RunStore::new(&runs_dir);
    let (run, steps) = store.load_summaries(&outcome.run_id).await?;

    println!("Run ID: {}", run.run_id);
    println!("Workflow: {}", run.workflow);
    println!("Status: {} ({} ms)", run.status, run.duration_ms);
    println!("Run dir: {}", ctx.run_dir.display());

    println!("\nSteps:");
    for step in &steps {
        let status_icon = match step.status {
            StepStatus::Ok => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Running => "⟳",
            StepStatus::Pending => "○",
        };
        println!(
            "  {} {} ({} ms)",
            status_icon, step.step_name, step.duration_ms
        );
        if let Some(ref err) = step.error_summary {
            println!("    Error: {}", err);
        }
    }

    if !outcome.ok {
        anyhow::bail!(
            "workflow '{}' failed at step '{}': {}",
            workflow.name,
            outcome.failed_step.as_deref().unwrap_or("?"),
            outcome.error.as_deref().unwrap_or("unknown error"),
        );
    }

    Ok(())
}

async fn cmd_export(
    run_id: String,
    format: String,
    out: Option<PathBuf>,
    runs_dir: Option<PathBuf>,
    config: AppConfig,
) -> Result<()> {
    let runs_dir = runs_dir.unwrap_or(config.runs_dir);
    let format: ExportFormat = format.parse()?;

    let out_path = export::export_run_audit(&runs_dir, &run_id, format, out).await?;
    println!("Exported: {}", out_path.display());

    Ok(())
}

async fn cmd_list(runs_dir: Option<PathBuf>, format: String, config: AppConfig) -> Result<()> {
    let runs_dir = runs_dir.unwrap_or(config.runs_dir);
    let runs = RunStore::new(&runs_dir).list_runs().await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    // Table format
    println!(
        "{:<34} {:<20} {:<8} {:<24}",
        "RUN ID", "WORKFLOW", "STATUS", "STARTED"
    );
    println!("{}", "-".repeat(88));

    for run in &runs {
        println!(
            "{:<34} {:<20} {:<8} {:<24}",
            run.run_id,
            run.workflow,
            run.status,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    println!("\nTotal: {} run(s)", runs.len());
    Ok(())
}

async fn cmd_inspect(run_id: String, runs_dir: Option<PathBuf>, config: AppConfig) -> Result<()> {
    let runs_dir = runs_dir.unwrap_or(config.runs_dir);
    let (run, steps) = RunStore::new(&runs_dir)
        .load_summaries(&run_id)
        .await
        .with_context(|| format!("Run '{}' not found", run_id))?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({"run": run, "steps": steps}))?
    );

    Ok(())
}

fn cmd_workflows() -> Result<()> {
    let registry = workflows::registry();

    println!("{:<20} STEPS", "WORKFLOW");
    println!("{}", "-".repeat(60));

    for workflow in &registry {
        let steps: Vec<&str> = workflow.steps.iter().map(|s| s.name.as_str()).collect();
        println!("{:<20} {}", workflow.name, steps.join(", "));
    }

    println!("\nTotal: {} workflow(s)", registry.len());
    Ok(())
}
