//! `loopwork`: a thin binary wiring `loopwork-core`'s engine to a concrete
//! `JsonTaskStore` and `SubprocessRunner`. This crate stays small on
//! purpose: resolve paths, build the config structs, hand off to
//! `loopwork_core::coordinator`.

mod cleanup_cmd;
mod config;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "loopwork", about = "Concurrent execution engine for fleets of coding-agent tasks")]
struct Cli {
    /// Project root; engine state lives under `<root>/.loopwork/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Checkpoint/log namespace for this run (one engine run = one namespace).
    #[arg(long, global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drain pending tasks from the store until none remain, interrupted, or a fatal error occurs.
    Run {
        /// Number of concurrent workers.
        #[arg(long)]
        workers: Option<usize>,
        /// Only claim tasks with this feature tag.
        #[arg(long)]
        feature: Option<String>,
        /// Per-task timeout in seconds before the subprocess is killed.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Agent binary to invoke per task (overrides config file).
        #[arg(long)]
        agent_command: Option<String>,
        /// Arguments passed to the agent binary before per-task flags.
        #[arg(long = "agent-arg")]
        agent_args: Vec<String>,
    },
    /// Resume a prior interrupted run from its checkpoint, resetting interrupted tasks to pending.
    Resume {
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        feature: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        agent_command: Option<String>,
        #[arg(long = "agent-arg")]
        agent_args: Vec<String>,
    },
    /// Read-only snapshot of task counts, tracked processes, and the checkpoint.
    Status,
    /// Reap orphaned subprocesses tracked in the process registry without starting a run.
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let state_dir = cli.root.join(".loopwork");
    let output_dir = state_dir.join("output");
    let tasks_path = cli.root.join("tasks.json");

    match cli.command {
        Commands::Run {
            workers,
            feature,
            timeout_secs,
            agent_command,
            agent_args,
        } => {
            let file = config::load_config(&state_dir)?;
            let overrides = config::CliOverrides {
                workers,
                feature,
                namespace: Some(cli.namespace.clone()),
                task_timeout_secs: timeout_secs,
                agent_command,
                agent_args,
            };
            let (engine_config, subprocess_config) =
                config::resolve(&cli.root, state_dir, output_dir, &file, &overrides);
            let code = run_cmd::run(engine_config, subprocess_config, tasks_path, false).await?;
            std::process::exit(code);
        }
        Commands::Resume {
            workers,
            feature,
            timeout_secs,
            agent_command,
            agent_args,
        } => {
            let file = config::load_config(&state_dir)?;
            let overrides = config::CliOverrides {
                workers,
                feature,
                namespace: Some(cli.namespace.clone()),
                task_timeout_secs: timeout_secs,
                agent_command,
                agent_args,
            };
            let (engine_config, subprocess_config) =
                config::resolve(&cli.root, state_dir, output_dir, &file, &overrides);
            let code = run_cmd::run(engine_config, subprocess_config, tasks_path, true).await?;
            std::process::exit(code);
        }
        Commands::Status => {
            status_cmd::run(&state_dir, tasks_path, &cli.namespace).await?;
        }
        Commands::Cleanup => {
            let file = config::load_config(&state_dir)?;
            let task_timeout = file
                .engine
                .task_timeout_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or(loopwork_core::config::EngineConfig::default().task_timeout);
            let grace_period = file
                .engine
                .cleanup_grace_period_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or(loopwork_core::config::CheckpointConfig::default().cleanup_grace_period);
            cleanup_cmd::run(&state_dir, task_timeout, grace_period).await?;
        }
    }

    Ok(())
}
