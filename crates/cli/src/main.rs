//! `specforge` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: load a workflow definition and check it against the
//!   built-in task registry.
//! - `run`: execute a workflow inside a sandbox directory.
//! - `checkpoints`: inspect or purge persisted checkpoints.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use engine::{CheckpointManager, Engine, EngineConfig, EngineError, ExecutorConfig};
use tasks::{FileOperations, SandboxedFs, TaskRegistry};

#[derive(Parser)]
#[command(name = "specforge", about = "Parallel DAG workflow engine", version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition (.json, .yaml or .yml).
    Validate {
        path: PathBuf,
        /// Directory file operations would be confined to.
        #[arg(long, env = "SPECFORGE_SANDBOX_ROOT", default_value = ".")]
        sandbox_root: PathBuf,
    },
    /// Execute a workflow definition.
    Run {
        path: PathBuf,
        /// Directory all file operations are confined to.
        #[arg(long, env = "SPECFORGE_SANDBOX_ROOT", default_value = ".")]
        sandbox_root: PathBuf,
        #[arg(long, env = "SPECFORGE_DATABASE_URL", default_value = "sqlite://specforge.db")]
        database_url: String,
        /// Save a checkpoint after every N finished tasks (0 disables).
        #[arg(long, env = "SPECFORGE_CHECKPOINT_EVERY", default_value_t = 10)]
        checkpoint_every: usize,
        /// Cancel remaining tasks on the first failure.
        #[arg(long)]
        fail_fast: bool,
    },
    /// Inspect persisted checkpoints.
    Checkpoints {
        #[arg(long, env = "SPECFORGE_DATABASE_URL", default_value = "sqlite://specforge.db")]
        database_url: String,
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// All checkpoints of a workflow, oldest first.
    List { workflow_id: String },
    /// The most recent checkpoint of a workflow.
    Latest { workflow_id: String },
    /// Delete every checkpoint of a workflow.
    Purge { workflow_id: String },
}

fn setup_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup_logging(cli.log_json);

    match cli.command {
        Command::Validate { path, sandbox_root } => validate(&path, &sandbox_root),
        Command::Run {
            path,
            sandbox_root,
            database_url,
            checkpoint_every,
            fail_fast,
        } => run(&path, &sandbox_root, &database_url, checkpoint_every, fail_fast).await,
        Command::Checkpoints {
            database_url,
            action,
        } => checkpoints(&database_url, action).await,
    }
}

/// The sandboxed file backend and the built-in registry bound to it.
fn builtins(sandbox_root: &Path) -> Result<(Arc<dyn FileOperations>, Arc<TaskRegistry>)> {
    let fs: Arc<dyn FileOperations> = Arc::new(
        SandboxedFs::new(sandbox_root)
            .with_context(|| format!("cannot use sandbox root {}", sandbox_root.display()))?,
    );
    let registry = Arc::new(TaskRegistry::with_builtins(Arc::clone(&fs)));
    Ok((fs, registry))
}

fn validate(path: &Path, sandbox_root: &Path) -> Result<ExitCode> {
    let (_, registry) = builtins(sandbox_root)?;

    match engine::loader::load_file_checked(path, &registry) {
        Ok((def, order)) => {
            println!("Workflow '{}' is valid. Execution order: {order:?}", def.id);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Validation failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn open_checkpoints(database_url: &str) -> Result<CheckpointManager> {
    let pool = db::pool::create_pool(database_url, 5)
        .await
        .with_context(|| format!("cannot open database {database_url}"))?;
    db::pool::run_migrations(&pool).await.context("migration failed")?;
    Ok(CheckpointManager::sqlite(pool))
}

async fn run(
    path: &Path,
    sandbox_root: &Path,
    database_url: &str,
    checkpoint_every: usize,
    fail_fast: bool,
) -> Result<ExitCode> {
    let (fs, registry) = builtins(sandbox_root)?;
    let def = engine::loader::load_file_with_registry(path, &registry)
        .with_context(|| format!("cannot load workflow {}", path.display()))?;

    let checkpoints = if checkpoint_every > 0 {
        Some(open_checkpoints(database_url).await?)
    } else {
        None
    };

    let engine = Engine::new(EngineConfig {
        file_ops: Some(fs),
        registry: Some(registry),
        checkpoints,
        checkpoint_every_n: checkpoint_every,
        executor: ExecutorConfig {
            fail_fast,
            ..ExecutorConfig::default()
        },
    })?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling workflow");
            on_signal.cancel();
        }
    });

    info!(workflow_id = %def.id, sandbox = %sandbox_root.display(), "running workflow");

    match engine.execute(&def, cancel).await {
        Ok(execution) => {
            println!("{}", serde_json::to_string_pretty(&execution)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(EngineError::Execution { execution, source }) => {
            println!("{}", serde_json::to_string_pretty(&execution)?);
            eprintln!("Workflow failed: {source}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            eprintln!("Workflow rejected: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn checkpoints(database_url: &str, action: CheckpointAction) -> Result<ExitCode> {
    let manager = open_checkpoints(database_url).await?;

    match action {
        CheckpointAction::List { workflow_id } => {
            let all = manager.list(&workflow_id).await?;
            println!("{}", serde_json::to_string_pretty(&all)?);
        }
        CheckpointAction::Latest { workflow_id } => match manager.load(&workflow_id).await {
            Ok(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
            Err(engine::CheckpointError::NotFound(_)) => {
                eprintln!("No checkpoint for workflow '{workflow_id}'");
                return Ok(ExitCode::FAILURE);
            }
            Err(e) => return Err(e.into()),
        },
        CheckpointAction::Purge { workflow_id } => {
            let removed = manager.delete_all(&workflow_id).await?;
            println!("Removed {removed} checkpoint(s) for '{workflow_id}'");
        }
    }
    Ok(ExitCode::SUCCESS)
}
