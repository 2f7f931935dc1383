//! Overture CLI - execute and validate workflow documents.
//!
//! Usage:
//!   overture execute order_processing.yaml --input '{"email":"user@example.com"}'
//!   overture validate workflows/order_processing.yaml
//!   overture serve --port 8080

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use overture::{loader, Engine, WorkflowStatus};

#[derive(Parser, Debug)]
#[command(name = "overture", about = "Stateless orchestrator for declarative service workflows")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Enable trace logging
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a workflow file
    Execute {
        /// Path to the workflow YAML file
        file: PathBuf,

        /// Input data as a JSON object
        #[arg(short, long, default_value = "{}")]
        input: String,
    },
    /// Validate a workflow file without executing it
    Validate {
        /// Path to the workflow YAML file
        file: PathBuf,
    },
    /// Keep the orchestrator resident until interrupted
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    match args.command {
        Command::Execute { file, input } => execute(file, &input).await,
        Command::Validate { file } => validate(&file),
        Command::Serve { port } => serve(port).await,
    }
}

async fn execute(file: PathBuf, input: &str) -> Result<ExitCode> {
    let input: JsonValue = serde_json::from_str(input).context("failed to parse input JSON")?;

    let engine = Engine::new();
    let name = engine
        .load_file(&file)
        .with_context(|| format!("failed to load workflow {}", file.display()))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling workflow");
                cancel.cancel();
            }
        });
    }

    let result = engine.execute(&name, input, cancel).await?;
    info!(
        workflow_id = %result.workflow_id,
        status = %result.status,
        "workflow completed"
    );

    println!("{}", serde_json::to_string_pretty(&result.output)?);
    if let Some(error) = &result.error {
        eprintln!("error: {error}");
    }

    Ok(match result.status {
        WorkflowStatus::Success | WorkflowStatus::Compensated => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn validate(file: &PathBuf) -> Result<ExitCode> {
    match loader::load_file(file) {
        Ok(workflow) => {
            println!(
                "workflow {} v{} is valid ({} steps, {} services)",
                workflow.name,
                workflow.version,
                workflow.steps.len(),
                workflow.services.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("validation failed: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn serve(port: u16) -> Result<ExitCode> {
    info!(port, "orchestrator resident; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(args: &Args) {
    let default_level = if args.trace {
        "trace"
    } else if args.debug {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
