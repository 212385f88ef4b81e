//! `devpilot` CLI entry point.
//!
//! Webhook ingestion (decoding inbound GitHub events and calling
//! `trigger::evaluate`) is out of scope: this binary only wires the
//! orchestration core to real adapters and exposes the operations a
//! maintainer needs to drive or inspect it by hand.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devpilot::adapters::git_cli::GitCli;
use devpilot::adapters::github::GitHubClient;
use devpilot::agent_runner::{AgentConfig, AgentRunner};
use devpilot::concurrency_gate::ConcurrencyGate;
use devpilot::config::ConfigLoader;
use devpilot::domain::{TaskDescriptor, TaskStatus};
use devpilot::pipeline::PipelineExecutor;
use devpilot::process_supervisor::ProcessSupervisor;
use devpilot::task_store::{connect, SqliteTaskStore, TaskStore};

#[derive(Parser)]
#[command(name = "devpilot", about = "Task orchestration runtime for AI-driven issue automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new task for an issue, bypassing trigger evaluation.
    Submit {
        #[arg(long)]
        issue_number: i64,
        #[arg(long)]
        issue_title: String,
        #[arg(long)]
        issue_url: String,
        #[arg(long, default_value = "")]
        issue_body: String,
    },
    /// Resume a FAILED/CANCELLED task.
    Retry {
        task_id: String,
    },
    /// Show one task's full record.
    Show {
        task_id: String,
    },
    /// List tasks, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Print aggregate task counts by status.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load().context("failed to load configuration")?;
    let _logger_handle = devpilot::logging::init(&config.logging).context("failed to initialize logging")?;

    let pool = connect(&config.database.path)
        .await
        .context("failed to connect to task database")?;
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(pool));

    match cli.command {
        Commands::Submit {
            issue_number,
            issue_title,
            issue_url,
            issue_body,
        } => {
            let executor = build_pipeline(&config, store.clone())?;
            let epoch_seconds = chrono::Utc::now().timestamp();
            let task_id = devpilot::domain::new_task_id(issue_number, epoch_seconds);
            let descriptor = TaskDescriptor {
                issue_number,
                issue_title,
                issue_url,
                issue_body,
            };
            let task = executor.execute_new(&task_id, descriptor).await?;
            print_task(&task);
        }
        Commands::Retry { task_id } => {
            store.retry(&task_id).await.context("retry rejected")?;
            let executor = build_pipeline(&config, store.clone())?;
            let task = executor.execute_retry(&task_id).await?;
            print_task(&task);
        }
        Commands::Show { task_id } => {
            let task = store
                .get_task(&task_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("task not found: {task_id}"))?;
            print_task(&task);
        }
        Commands::List { status, limit, offset } => {
            let status = status.as_deref().and_then(TaskStatus::parse);
            let tasks = store.list_tasks(status, limit, offset).await?;
            for task in tasks {
                print_task(&task);
            }
        }
        Commands::Stats => {
            let stats = store.stats().await?;
            println!("{stats:#?}");
        }
    }

    Ok(())
}

fn build_pipeline(config: &devpilot::config::Config, store: Arc<dyn TaskStore>) -> Result<PipelineExecutor> {
    let gate = ConcurrencyGate::new(config.max_concurrent);
    let supervisor = Arc::new(ProcessSupervisor::new());
    let agent_runner = Arc::new(AgentRunner::new(
        AgentConfig {
            agent_path: config.agent_path.clone(),
            skip_permissions: config.agent_skip_permissions,
            timeout_seconds: config.agent_timeout_seconds,
            max_retries: config.agent_max_retries,
            repository_path: config.repository.path.clone(),
        },
        supervisor,
    ));
    let code_host = Arc::new(GitHubClient::from_env().map_err(|e| anyhow::anyhow!(e))?);
    let source_control = Arc::new(GitCli::new(
        config.repository.path.clone(),
        config.repository.remote.clone(),
        config.repository.default_branch.clone(),
        config.branch_template.clone(),
    ));

    Ok(PipelineExecutor::new(
        store,
        gate,
        agent_runner,
        code_host,
        source_control,
        config.clone(),
    ))
}

fn print_task(task: &devpilot::domain::Task) {
    println!(
        "{} issue=#{} status={:?} branch={}",
        task.task_id, task.issue_number, task.status, task.branch_name
    );
}
