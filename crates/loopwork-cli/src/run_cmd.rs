//! `loopwork run` / `loopwork resume`: build the engine from resolved
//! config and drive it to completion, translating the outcome into the
//! process exit code contract (0 / 1 / 130).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use loopwork_core::config::EngineConfig;
use loopwork_core::coordinator::Coordinator;
use loopwork_core::error::{EXIT_FATAL, EXIT_INTERRUPTED, EXIT_OK};
use loopwork_core::lock::EngineLock;
use loopwork_core::observer::TracingObserver;
use loopwork_core::process::ProcessRegistry;
use loopwork_core::signal::{InterruptHandler, SignalBridge};
use loopwork_core::task::TaskStore;
use loopwork_store::JsonTaskStore;
use loopwork_subprocess::{SubprocessConfig, SubprocessRunner};

/// Run the engine once, either draining fresh (`resume = false`, reclaiming
/// any tasks a prior crashed run left `in-progress`) or resuming from a
/// checkpoint (`resume = true`, requiring one to exist --
/// `ERR_STATE_INVALID` otherwise).
pub async fn run(
    engine_config: EngineConfig,
    subprocess_config: SubprocessConfig,
    tasks_path: PathBuf,
    resume: bool,
) -> Result<i32> {
    let lock_path = engine_config.state_dir.join("loopwork.lock");
    let lock = match EngineLock::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(err) => {
            error!(error = %err, "failed to acquire engine lock");
            return Ok(EXIT_FATAL);
        }
    };

    let store: Arc<dyn TaskStore> = Arc::new(JsonTaskStore::new(tasks_path));
    let registry = ProcessRegistry::new(engine_config.state_dir.join("processes.json"));
    let runner = Arc::new(SubprocessRunner::new(
        subprocess_config,
        registry,
        engine_config.checkpoint.namespace.clone(),
    ));
    let observer = Arc::new(TracingObserver);
    let interrupt = InterruptHandler::new();
    let _signal_task = SignalBridge::new(interrupt.clone()).install();

    let coordinator = Coordinator::new(engine_config, store, runner, observer, interrupt);

    let outcome = coordinator.run(resume).await;
    lock.release();

    match outcome {
        Ok(summary) => {
            info!(
                completed = summary.tasks_completed,
                failed = summary.tasks_failed,
                quarantined = summary.tasks_quarantined,
                rounds = summary.rounds_run,
                self_healing_attempts = summary.self_healing_attempts,
                interrupted = summary.interrupted,
                "engine run finished"
            );
            println!(
                "completed={} failed={} quarantined={} rounds={}{}",
                summary.tasks_completed,
                summary.tasks_failed,
                summary.tasks_quarantined,
                summary.rounds_run,
                if summary.interrupted { " (interrupted)" } else { "" }
            );
            Ok(if summary.interrupted { EXIT_INTERRUPTED } else { EXIT_OK })
        }
        Err(err) => {
            error!(error = %err, "engine run ended with a fatal error");
            eprintln!("fatal: {err}");
            Ok(err.exit_code())
        }
    }
}
