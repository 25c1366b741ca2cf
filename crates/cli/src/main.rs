//! `orchestrator` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: compile a workflow file and print its job order.
//! - `run`: execute a workflow with in-process runners.
//! - `migrate`: run pending database migrations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use db::{MemoryStore, PgStore, Store};
use engine::{compile_str, CompiledWorkflow, Orchestrator, RunStatus, RunView, SchedulerConfig};
use futures_util::StreamExt;
use runner::{Agent, AgentConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    about = "Run workflow jobs on a pool of runners",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a workflow file and print the order its jobs can run in.
    Validate {
        /// Path to the workflow YAML file.
        path: PathBuf,
    },
    /// Run a workflow to completion and print its logs and outcome.
    Run {
        /// Path to the workflow YAML file.
        path: PathBuf,
        /// Number of in-process runners.
        #[arg(long, default_value_t = 2)]
        runners: usize,
        /// Tags every runner advertises.
        #[arg(long, value_delimiter = ',', default_value = "linux,shell")]
        tags: Vec<String>,
        #[arg(long, default_value_t = 10)]
        heartbeat_secs: u64,
        /// Missed heartbeats before a runner's job is reassigned.
        #[arg(long, default_value_t = 3)]
        missed_heartbeats: u32,
        /// How often idle runners ask for work.
        #[arg(long, default_value_t = 250)]
        poll_ms: u64,
        /// Persist to Postgres instead of memory.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        /// Run input, exposed to steps as `INPUT_<KEY>`.
        #[arg(long = "input", value_name = "KEY=VALUE", value_parser = parse_input)]
        inputs: Vec<(String, String)>,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let workflow = load(&path)?;
            println!(
                "workflow '{}' is valid; job order: {}",
                workflow.name(),
                workflow.topological_keys().join(" -> ")
            );
            Ok(())
        }
        Command::Run {
            path,
            runners,
            tags,
            heartbeat_secs,
            missed_heartbeats,
            poll_ms,
            database_url,
            inputs,
        } => {
            let workflow = Arc::new(load(&path)?);
            let store: Arc<dyn Store> = match database_url {
                Some(url) => {
                    let pool = db::pool::create_pool(&url, 10).await?;
                    db::pool::run_migrations(&pool).await?;
                    Arc::new(PgStore::new(pool))
                }
                None => Arc::new(MemoryStore::new()),
            };
            let config = SchedulerConfig {
                heartbeat_interval: Duration::from_secs(heartbeat_secs.max(1)),
                missed_heartbeats: missed_heartbeats.max(1),
                ..Default::default()
            };
            let agent = AgentConfig {
                tags: tags.into_iter().collect(),
                poll_interval: Duration::from_millis(poll_ms),
                heartbeat_interval: config.heartbeat_interval,
                ..Default::default()
            };
            run(workflow, store, config, agent, runners, inputs.into_iter().collect()).await
        }
        Command::Migrate { database_url } => {
            let pool = db::pool::create_pool(&database_url, 2).await?;
            db::pool::run_migrations(&pool).await?;
            info!("migrations applied");
            Ok(())
        }
    }
}

async fn run(
    workflow: Arc<CompiledWorkflow>,
    store: Arc<dyn Store>,
    config: SchedulerConfig,
    agent: AgentConfig,
    runners: usize,
    inputs: BTreeMap<String, String>,
) -> anyhow::Result<()> {
    if runners == 0 && !workflow.jobs.is_empty() {
        bail!("--runners must be at least 1");
    }

    let orchestrator = Orchestrator::with_store(store, config);
    orchestrator.spawn_reaper();

    let shutdown = CancellationToken::new();
    let agents: Vec<_> = (0..runners)
        .map(|i| {
            let config = AgentConfig {
                runner_id: format!("local-{}", i + 1),
                name: format!("local-{}", i + 1),
                ..agent.clone()
            };
            let agent = Agent::new(config, Arc::new(orchestrator.clone()));
            tokio::spawn(agent.run(shutdown.clone()))
        })
        .collect();

    let run_id = orchestrator.submit(workflow, inputs).await?;
    info!(%run_id, runners, "run submitted");

    let mut logs = orchestrator.subscribe_logs(run_id, 0).await?;
    let printer = tokio::spawn(async move {
        while let Some(entry) = logs.next().await {
            println!("{:>5} | {}", entry.seq, entry.content);
        }
    });

    let status = tokio::select! {
        status = orchestrator.wait(run_id) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling run");
            orchestrator.cancel(run_id).await?;
            orchestrator.wait(run_id).await?
        }
    };
    if let Err(e) = printer.await {
        warn!(error = %e, "log printer ended abnormally");
    }

    print_summary(&orchestrator.snapshot(run_id).await?);

    shutdown.cancel();
    for agent in agents {
        match agent.await {
            Ok(Err(e)) => warn!(error = %e, "runner failed"),
            Err(e) => warn!(error = %e, "runner task ended abnormally"),
            Ok(Ok(())) => {}
        }
    }
    orchestrator.shutdown().await;

    if status != RunStatus::Success {
        bail!("run {run_id} finished with status {status}");
    }
    Ok(())
}

fn load(path: &Path) -> anyhow::Result<CompiledWorkflow> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    compile_str(&text).with_context(|| format!("invalid workflow {}", path.display()))
}

fn print_summary(view: &RunView) {
    println!();
    println!("run {} ({}): {}", view.id, view.workflow_name, view.status);
    for job in &view.jobs {
        match &job.error {
            Some(error) => println!("  {:<24} {:<10} {error}", job.name, job.status),
            None => println!("  {:<24} {}", job.name, job.status),
        }
        for step in &job.steps {
            let code = step
                .exit_code
                .map(|c| format!(" (exit {c})"))
                .unwrap_or_default();
            println!("    {:<22} {}{code}", step.name, step.status);
        }
    }
}

fn parse_input(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
