mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stepflow_core::config::AppConfig;
use stepflow_core::definition::WorkflowDefinition;
use stepflow_core::event::WorkflowEvent;
use stepflow_core::types::{CircuitState, Execution, ExecutionStatus};
use stepflow_engine::{ExecutionPlan, WorkflowEngine};
use stepflow_invoke::JsonRpcInvoker;
use stepflow_store::SqliteStore;

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Resilient workflow orchestration for agent calls")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepflow.toml", env = "STEPFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition and print its execution order
    Validate {
        /// Path to a JSON workflow definition
        file: PathBuf,
    },
    /// Store a workflow definition
    Create {
        file: PathBuf,
        /// Workflow name (defaults to the definition's name)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Store a definition and run it immediately
    Run {
        file: PathBuf,
        /// Execution inputs as a JSON object
        #[arg(long, default_value = "{}")]
        inputs: String,
    },
    /// Run a stored workflow
    Exec {
        workflow_id: String,
        /// Execution inputs as a JSON object
        #[arg(long, default_value = "{}")]
        inputs: String,
        /// Correlation id to carry through logs (generated if omitted)
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Show an execution's status and step progress
    Status { execution_id: String },
    /// Mark a stored, unfinished execution as cancelled
    Cancel { execution_id: String },
    /// List recent executions of a workflow
    History {
        workflow_id: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List stored workflows
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Delete a stored workflow
    Delete { workflow_id: String },
    /// Show current configuration
    Config,
    /// Check configuration, storage, and agent endpoints
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle commands that need neither config nor storage
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "stepflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate(file),
        _ => {}
    }

    let config = load_config(&cli.config)?;
    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
        Commands::Doctor => {
            if doctor::run_doctor(&config) > 0 {
                std::process::exit(1);
            }
            return Ok(());
        }
        _ => {}
    }

    let db_path = config.database_path();
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );
    let agents = Arc::new(JsonRpcInvoker::from_config(&config));
    let engine = Arc::new(WorkflowEngine::from_config(store, agents, &config));

    match cli.command {
        Commands::Create {
            file,
            name,
            description,
        } => {
            let definition = WorkflowDefinition::from_file(&file)?;
            let name = name.unwrap_or_else(|| definition.name.clone());
            let workflow = engine.create_workflow(name, definition, description).await?;
            println!("{}", workflow.id);
        }
        Commands::Run { file, inputs } => {
            let definition = WorkflowDefinition::from_file(&file)?;
            let inputs = parse_inputs(&inputs)?;
            let workflow = engine
                .create_workflow(definition.name.clone(), definition, None)
                .await?;
            println!("Workflow {} created", workflow.id);
            let execution = run_live(&engine, workflow.id, inputs, None).await?;
            print_circuits(&engine);
            print_execution(&execution)?;
        }
        Commands::Exec {
            workflow_id,
            inputs,
            correlation_id,
        } => {
            let inputs = parse_inputs(&inputs)?;
            let execution = run_live(&engine, workflow_id, inputs, correlation_id).await?;
            print_circuits(&engine);
            print_execution(&execution)?;
        }
        Commands::Status { execution_id } => {
            let report = engine.get_execution_status(&execution_id).await?;
            println!(
                "Execution {}: {} ({:.0}%)",
                report.execution_id, report.status, report.progress
            );
            for step in &report.steps {
                match step.duration_ms {
                    Some(ms) => println!("  {:<24} {:<10} {}ms", step.step_id, step.status.as_str(), ms),
                    None => println!("  {:<24} {}", step.step_id, step.status.as_str()),
                }
            }
            if let Some(ms) = report.total_duration_ms {
                println!("Total: {}ms", ms);
            }
        }
        Commands::Cancel { execution_id } => {
            let execution = engine.cancel_execution(&execution_id).await?;
            println!("Execution {}: {}", execution.id, execution.status);
        }
        Commands::History { workflow_id, limit } => {
            let executions = engine.get_execution_history(&workflow_id, limit).await?;
            if executions.is_empty() {
                println!("No executions for workflow {}", workflow_id);
            }
            for e in &executions {
                println!(
                    "{}  {:<10} {}  {}",
                    e.id,
                    e.status.as_str(),
                    e.created_at.format("%Y-%m-%d %H:%M:%S"),
                    e.total_duration_ms
                        .map(|ms| format!("{}ms", ms))
                        .unwrap_or_default()
                );
            }
        }
        Commands::List { limit } => {
            let workflows = engine.list_workflows(limit).await?;
            if workflows.is_empty() {
                println!("No workflows stored.");
            }
            for w in &workflows {
                println!(
                    "{}  {:<24} {} steps  {}",
                    w.id,
                    w.name,
                    w.definition.steps.len(),
                    w.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Delete { workflow_id } => {
            engine.delete_workflow(&workflow_id).await?;
            println!("Deleted workflow {}", workflow_id);
        }
        Commands::Validate { .. }
        | Commands::Config
        | Commands::Doctor
        | Commands::Completions { .. } => {
            unreachable!("handled before storage setup")
        }
    }

    Ok(())
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::from_file(file)?;
    let plan = ExecutionPlan::build(&definition)?;
    println!("Workflow '{}' is valid. Execution order:", definition.name);
    for (i, step_id) in plan.ordered_step_ids.iter().enumerate() {
        match plan.owner_of(step_id) {
            Some(block) => println!("  {:>2}. {} (in {})", i + 1, step_id, block),
            None => println!("  {:>2}. {}", i + 1, step_id),
        }
    }
    Ok(())
}

/// Execute while printing step events. Ctrl-C cancels cooperatively.
async fn run_live(
    engine: &Arc<WorkflowEngine>,
    workflow_id: String,
    inputs: serde_json::Value,
    correlation_id: Option<String>,
) -> anyhow::Result<Execution> {
    let mut rx = engine.subscribe();
    let mut runner = {
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            match correlation_id {
                Some(corr) => {
                    engine
                        .execute_workflow_with_correlation(&workflow_id, inputs, corr)
                        .await
                }
                None => engine.execute_workflow(&workflow_id, inputs).await,
            }
        })
    };

    let mut execution_id: Option<String> = None;
    let mut cancel_requested = false;
    let execution = loop {
        tokio::select! {
            joined = &mut runner => break joined??,
            event = rx.recv() => match event {
                Ok(event) => {
                    if let WorkflowEvent::ExecutionStarted { execution_id: id, .. } = &event {
                        execution_id = Some(id.clone());
                    }
                    print_event(&event);
                }
                Err(RecvError::Lagged(n)) => eprintln!("  ... {} events dropped", n),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                match &execution_id {
                    Some(id) => {
                        info!(execution_id = %id, "Cancelling execution");
                        engine.cancel_execution(id).await?;
                    }
                    None => eprintln!("Execution not started yet; press Ctrl-C again after it starts"),
                }
            }
        }
    };

    while let Ok(event) = rx.try_recv() {
        print_event(&event);
    }
    Ok(execution)
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::ExecutionStarted {
            execution_id,
            correlation_id,
            ..
        } => println!("Execution {} started (correlation {})", execution_id, correlation_id),
        WorkflowEvent::StepStarted { step_id, kind, .. } => {
            println!("  > {} [{}]", step_id, kind)
        }
        WorkflowEvent::StepCompleted {
            step_id,
            duration_ms,
            ..
        } => println!("  ✓ {} ({}ms)", step_id, duration_ms),
        WorkflowEvent::StepFailed { step_id, error, .. } => {
            println!("  ✗ {}: {}", step_id, error)
        }
        WorkflowEvent::StepSkipped {
            step_id, reason, ..
        } => println!("  - {} skipped: {}", step_id, reason),
        WorkflowEvent::ExecutionCancelled { execution_id } => {
            println!("Execution {} cancelled", execution_id)
        }
        WorkflowEvent::CircuitStateChanged { target, from, to } => {
            println!("  circuit {}: {} -> {}", target, from, to)
        }
        WorkflowEvent::ExecutionFinished { .. } => {}
    }
}

/// Circuits the run left anything but closed.
fn print_circuits(engine: &WorkflowEngine) {
    for circuit in engine
        .circuits()
        .into_iter()
        .filter(|c| c.state != CircuitState::Closed)
    {
        println!(
            "  circuit {}: {} ({}/{} failures, recovery probe after {}s)",
            circuit.target,
            circuit.state,
            circuit.failure_count,
            circuit.failure_threshold,
            circuit.timeout_secs
        );
    }
}

fn print_execution(execution: &Execution) -> anyhow::Result<()> {
    let duration = execution
        .total_duration_ms
        .map(|ms| format!(" in {}ms", ms))
        .unwrap_or_default();
    println!("Execution {}: {}{}", execution.id, execution.status, duration);
    if let Some(outputs) = &execution.outputs {
        println!("{}", serde_json::to_string_pretty(outputs)?);
    }
    if execution.status == ExecutionStatus::Error {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_inputs(raw: &str) -> anyhow::Result<serde_json::Value> {
    let inputs: serde_json::Value =
        serde_json::from_str(raw).context("--inputs must be a JSON object")?;
    anyhow::ensure!(inputs.is_object(), "--inputs must be a JSON object");
    Ok(inputs)
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".stepflow").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    info!("No config file found, using defaults");
    Ok(AppConfig::default())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
