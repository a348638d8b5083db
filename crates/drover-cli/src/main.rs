mod list_cmd;
mod log_cmd;
mod run_cmd;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use drover_core::monitor::{self, GhDiscovery};
use drover_core::plan::PlanInput;
use drover_core::queue::{self, EnqueueOptions};
use drover_core::runner::ShellRunner;
use drover_core::worker::{Worker, WorkerConfig};
use drover_db::config::StoreConfig;
use drover_db::{migrate, pool};

#[derive(Parser)]
#[command(
    name = "drover",
    about = "Durable task orchestrator for fleets of LLM coding agents"
)]
struct Cli {
    /// Database path (overrides the DROVER_DB_PATH env var)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and enqueue a plan JSON file
    Enqueue {
        /// Path to the plan JSON file
        plan: PathBuf,
        /// Idempotency key: re-submitting the same key returns the existing plan
        #[arg(long)]
        idempotency: Option<String>,
        /// Attempt budget for every subtask in the plan
        #[arg(long, default_value_t = 3)]
        max_attempts: i64,
        /// Upper bound on a subtask prompt, in characters
        #[arg(long, default_value_t = drover_core::plan::DEFAULT_MAX_PROMPT_CHARS)]
        max_prompt_chars: usize,
    },
    /// List tasks, most recently updated first
    List {
        /// Filter by status (queued, running, succeeded, failed, blocked, canceled)
        #[arg(long)]
        status: Option<String>,
        /// Maximum number of rows
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Show the event log for a task
    Log {
        /// Task ID to show events for
        task_id: String,
    },
    /// Run the worker loop until interrupted
    Worker {
        /// Runner command template; supports {task_id} {routing} {prompt} {db_path}
        #[arg(long)]
        runner: String,
        /// Idle poll interval in seconds
        #[arg(long, default_value_t = 1.0)]
        poll: f64,
        /// Directory for per-attempt runner logs
        #[arg(long, default_value = "./logs")]
        logs: PathBuf,
    },
    /// Discover and persist PR/CI state for tasks with worktrees
    Monitor {
        /// Only refresh a single task
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Execute a task's routed agent (intended as the worker's runner command)
    Run {
        /// Task ID to execute
        #[arg(long)]
        task_id: String,
    },
}

/// Open the store and bring the schema up to date.
async fn open_store(db: Option<&Path>) -> Result<(SqlitePool, StoreConfig)> {
    let config = match db {
        Some(path) => StoreConfig::new(path),
        None => StoreConfig::from_env(),
    };
    let pool = pool::connect(&config).await?;
    migrate::migrate(&pool).await?;
    Ok((pool, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enqueue {
            plan,
            idempotency,
            max_attempts,
            max_prompt_chars,
        } => {
            let (pool, _) = open_store(cli.db.as_deref()).await?;
            let text = std::fs::read_to_string(&plan)
                .with_context(|| format!("failed to read plan file {}", plan.display()))?;
            let input: PlanInput = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse plan file {}", plan.display()))?;

            let options = EnqueueOptions {
                idempotency_key: idempotency.as_deref(),
                max_attempts,
                max_prompt_chars,
            };
            let result = queue::enqueue_plan(&pool, &input, &options).await;
            pool.close().await;
            println!("{}", result?);
        }
        Commands::List { status, limit } => {
            let (pool, _) = open_store(cli.db.as_deref()).await?;
            let result = list_cmd::run_list(&pool, status.as_deref(), limit).await;
            pool.close().await;
            result?;
        }
        Commands::Log { task_id } => {
            let (pool, _) = open_store(cli.db.as_deref()).await?;
            let result = log_cmd::run_log(&pool, &task_id).await;
            pool.close().await;
            result?;
        }
        Commands::Worker { runner, poll, logs } => {
            let (pool, config) = open_store(cli.db.as_deref()).await?;

            let shell = ShellRunner::new(runner, config.path.to_string_lossy(), logs);
            let worker = Worker::new(
                pool.clone(),
                Arc::new(shell),
                WorkerConfig {
                    poll_interval: Duration::from_secs_f64(poll),
                },
            );

            // Graceful stop: first ctrl-c finishes the current iteration.
            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("stop signal received, finishing current iteration");
                    signal_cancel.cancel();
                }
            });

            let result = worker.run(cancel).await;
            pool.close().await;
            result?;
        }
        Commands::Monitor { task_id } => {
            let (pool, _) = open_store(cli.db.as_deref()).await?;
            let result = monitor::monitor_once(&pool, &GhDiscovery, task_id.as_deref()).await;
            pool.close().await;
            println!("{}", result?);
        }
        Commands::Run { task_id } => {
            let (pool, _) = open_store(cli.db.as_deref()).await?;
            let result = run_cmd::run_task(&pool, &task_id).await;
            pool.close().await;
            std::process::exit(result?);
        }
    }

    Ok(())
}
