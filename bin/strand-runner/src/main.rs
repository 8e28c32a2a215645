// SPDX-License-Identifier: AGPL-3.0-only
// Minimal bootstrap; all pipeline logic resides in the strand library.
use agent_contracts::{Scene, WorkflowParams};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::sync::Arc;
use strand::{
    run_scene_pipeline, FileResultStore, HttpAgentInvoker, HttpTaskReporter, HttpTextGenerator,
    HttpVectorIndex, InterpreterConfig, LoggingTaskReporter, ObjectiveInterpreter, PipelineConfig,
    SceneTask, TaskReporter,
};
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(name = "strand-runner", about = "Scene analysis pipeline worker")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Process one scene task handed down by the workflow engine.
    Run {
        /// Path to the task file (scene task, scene data and objective).
        #[arg(long)]
        task: std::path::PathBuf,
    },
    /// Interpret a business objective into workflow parameters.
    Interpret {
        #[arg(long)]
        objective: String,
        #[arg(long)]
        scene_context: Option<String>,
    },
}

/// On-disk task format: the workflow engine's task envelope plus the scene
/// payload, with either ready-made parameters or an objective to interpret.
#[derive(Debug, Deserialize)]
struct TaskFile {
    task: SceneTask,
    scene: Scene,
    #[serde(default)]
    params: Option<WorkflowParams>,
    #[serde(default)]
    objective: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Run { task } => run_task(task).await,
        Command::Interpret {
            objective,
            scene_context,
        } => interpret_objective(objective, scene_context).await,
    }
}

async fn run_task(task_path: std::path::PathBuf) -> Result<()> {
    let body = tokio::fs::read_to_string(&task_path)
        .await
        .with_context(|| format!("failed to read task file {}", task_path.display()))?;
    let task_file: TaskFile =
        serde_json::from_str(&body).context("failed to parse task file")?;

    let params = match (task_file.params, task_file.objective) {
        (Some(params), _) => params,
        (None, Some(objective)) => {
            let interpreter = build_interpreter()?;
            interpreter
                .interpret(&objective, None)
                .await
                .context("objective interpretation failed")?
        }
        (None, None) => anyhow::bail!("task file needs either 'params' or 'objective'"),
    };

    let config = PipelineConfig::from_env();
    let index = Arc::new(HttpVectorIndex::from_env().context("vector index not configured")?);
    let invoker =
        Arc::new(HttpAgentInvoker::from_env().context("agent invocation not configured")?);
    let store_dir =
        std::env::var("RESULT_STORE_DIR").unwrap_or_else(|_| "./results".to_string());
    let store = Arc::new(
        FileResultStore::new(store_dir)
            .await
            .context("failed to open result store")?,
    );
    let reporter: Arc<dyn TaskReporter> = match std::env::var("TASK_CALLBACK_ENDPOINT") {
        Ok(endpoint) => Arc::new(HttpTaskReporter { endpoint }),
        Err(_) => Arc::new(LoggingTaskReporter),
    };

    let result = run_scene_pipeline(
        config,
        index,
        invoker,
        store,
        reporter,
        &task_file.task,
        &task_file.scene,
        &params,
    )
    .await?;

    info!(
        scene = %result.scene_id,
        termination = %result.termination,
        cycles = result.cycles_completed,
        "Scene task finished"
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn interpret_objective(objective: String, scene_context: Option<String>) -> Result<()> {
    let interpreter = build_interpreter()?;
    let params = interpreter
        .interpret(&objective, scene_context.as_deref())
        .await
        .context("objective interpretation failed")?;
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}

fn build_interpreter() -> Result<ObjectiveInterpreter> {
    let generator =
        HttpTextGenerator::from_env().context("generation service not configured")?;
    Ok(ObjectiveInterpreter::new(
        Arc::new(generator),
        InterpreterConfig::default(),
    ))
}
