//! The `WorkerPool`/`Coordinator`: drives N concurrent workers through
//! rounds of claim-execute-report cycles against a `TaskStore`, wiring in
//! the retry budget, failure tracker, circuit breaker, process registry,
//! and checkpoint store along the way.
//!
//! Scheduling model: every round offers each of the current worker count
//! one iteration; the round is a barrier (wait-all).
//! If an entire round claims nothing, the run has drained and the loop
//! ends. Workers within a round are independent futures polled
//! concurrently via `futures::future::join_all` -- there is no per-step
//! lock-step between them, matching the Design Notes' "avoid step-lock"
//! guidance for the source's promise-based worker race.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentRunner, TaskContext};
use crate::checkpoint::{CheckpointSnapshot, CheckpointStore};
use crate::circuit::{AdjustableParams, CircuitBreaker, CircuitCheck, CircuitPolicy};
use crate::config::{EngineConfig, ParallelFailureMode};
use crate::error::EngineError;
use crate::observer::{Observer, WorkerStatus};
use crate::process::{OrphanDetector, ProcessRegistry};
use crate::retry::{compute_backoff, FailureTracker, RetryBudget};
use crate::signal::InterruptHandler;
use crate::task::{ClaimedTask, Task, TaskFilter, TaskStore};

/// Index and per-slot completion counter for one worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSlot {
    pub index: usize,
    pub completed: u64,
}

/// Outcome of one worker iteration's state machine: Claim -> Execute ->
/// {Success | RetryScheduled | FailTerminal | Aborted}.
#[derive(Debug, Clone)]
enum IterationOutcome {
    Idle,
    Success,
    RetryScheduled,
    FailTerminal { quarantined: bool },
    Aborted { task_id: String },
}

/// Bookkeeping returned from a completed (or fatally-aborted) engine run.
#[derive(Debug, Clone, Default)]
pub struct EngineRunSummary {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_quarantined: u64,
    pub rounds_run: u64,
    pub self_healing_attempts: u32,
    pub interrupted: bool,
}

/// Drives the worker pool for one engine run. Cheaply `Clone`: every field
/// is either a handle (`Arc<dyn _>`), an `Arc`-wrapped shared state object,
/// or plain data, so a clone can be moved into each round's spawned worker
/// tasks without the coordinator itself needing `'static` lifetime tricks.
#[derive(Clone)]
pub struct Coordinator {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    runner: Arc<dyn AgentRunner>,
    observer: Arc<dyn Observer>,
    registry: ProcessRegistry,
    checkpoint_store: Arc<CheckpointStore>,
    retry_budget: Arc<RetryBudget>,
    failure_tracker: Arc<FailureTracker>,
    circuit: Arc<CircuitBreaker>,
    interrupt: InterruptHandler,
    /// Per-slot completion counters, indexed by worker id. Grows if
    /// self-healing raises the worker count past its initial size; never
    /// shrinks, since a slot's counter should survive a later reduction.
    slots: Arc<Mutex<Vec<u64>>>,
}

impl Coordinator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        runner: Arc<dyn AgentRunner>,
        observer: Arc<dyn Observer>,
        interrupt: InterruptHandler,
    ) -> Self {
        let registry = ProcessRegistry::new(config.state_dir.join("processes.json"));
        let checkpoint_store = Arc::new(CheckpointStore::new(config.state_dir.clone()));
        let retry_budget = Arc::new(RetryBudget::new(config.retry.budget_limit, config.retry.budget_window));
        let failure_tracker = Arc::new(FailureTracker::new());
        let original = AdjustableParams {
            workers: config.worker_count,
            task_delay: config.task_delay,
            timeout: config.task_timeout,
        };
        let circuit = Arc::new(CircuitBreaker::new(
            CircuitPolicy {
                trip_threshold: config.circuit_breaker.trip_threshold,
                cooldown: config.circuit_breaker.cooldown,
                max_healing_attempts: config.circuit_breaker.max_healing_attempts,
            },
            original,
        ));

        let slots = Arc::new(Mutex::new(vec![0u64; config.worker_count]));

        Self {
            config,
            store,
            runner,
            observer,
            registry,
            checkpoint_store,
            retry_budget,
            failure_tracker,
            circuit,
            interrupt,
            slots,
        }
    }

    /// Snapshot of every worker slot's index and completion counter, for
    /// operator visibility (e.g. a CLI `status` command).
    pub async fn worker_slots(&self) -> Vec<WorkerSlot> {
        self.slots
            .lock()
            .await
            .iter()
            .enumerate()
            .map(|(index, &completed)| WorkerSlot { index, completed })
            .collect()
    }

    async fn record_slot_completion(&self, worker_id: usize) {
        let mut slots = self.slots.lock().await;
        if worker_id >= slots.len() {
            slots.resize(worker_id + 1, 0);
        }
        slots[worker_id] += 1;
    }

    /// The process registry this coordinator's workers register subprocesses
    /// in, exposed so the CLI can run a standalone `cleanup` sweep against
    /// the same file.
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn interrupt_handler(&self) -> &InterruptHandler {
        &self.interrupt
    }

    /// Run the engine to completion: drains the store (or resumes from a
    /// checkpoint), spawns rounds of workers until drained or interrupted,
    /// and returns a summary. Fatal errors are returned as
    /// `Err` with outstanding state already persisted; the caller
    /// (`loopwork-cli`) is responsible for releasing the engine lock and
    /// choosing the process exit code.
    pub async fn run(&self, resume: bool) -> Result<EngineRunSummary, EngineError> {
        let namespace = self.config.checkpoint.namespace.clone();
        let filter = TaskFilter {
            feature: self.config.feature.clone(),
        };

        if resume {
            let snapshot = self
                .checkpoint_store
                .load(&namespace)
                .await
                .map_err(|source| EngineError::BackendInvalid {
                    operation: "checkpoint_load",
                    fatal: true,
                    source,
                })?
                .ok_or_else(|| EngineError::StateInvalid {
                    namespace: namespace.clone(),
                })?;
            for task_id in &snapshot.interrupted_tasks {
                if let Err(err) = self.store.reset_to_pending(task_id).await {
                    warn!(task_id, error = %err, "failed to reset interrupted task to pending on resume");
                }
            }
        } else {
            match self.store.reset_all_in_progress().await {
                Ok(0) => {}
                Ok(n) => info!(count = n, "reclaimed tasks left in-progress by a prior run"),
                Err(err) => warn!(error = %err, "reset_all_in_progress failed (non-fatal)"),
            }
        }

        self.runner
            .preflight(self.config.worker_count)
            .await
            .map_err(|err| EngineError::PreflightFailed {
                reason: err.to_string(),
            })?;

        let sweep_cancel = CancellationToken::new();
        let detector = OrphanDetector::new(
            self.config.checkpoint.orphan_scan_interval,
            self.config.task_timeout,
            self.config.checkpoint.cleanup_grace_period,
        );
        let sweep_registry = self.registry.clone();
        let sweep_token = sweep_cancel.clone();
        let sweep_handle = tokio::spawn(async move {
            detector.run(&sweep_registry, sweep_token).await;
        });

        let started_at = chrono::Utc::now();
        let mut round: u64 = 0;
        let mut completed: u64 = 0;
        let mut failed: u64 = 0;
        let mut quarantined: u64 = 0;
        let mut last_checkpoint = tokio::time::Instant::now();
        let mut interrupted = false;
        let mut fatal: Option<EngineError> = None;
        let mut abort_all = false;
        let mut interrupted_task_ids: Vec<String> = Vec::new();

        loop {
            if self.interrupt.is_shutting_down() {
                interrupted = true;
                break;
            }
            if abort_all {
                break;
            }

            let pre_healing_worker_count = self.circuit.current_params().await.workers;
            match self.circuit.check().await {
                Ok(CircuitCheck::Healed) => {
                    for w in 0..pre_healing_worker_count {
                        self.observer.on_worker_status(w, WorkerStatus::Backoff).await;
                    }
                }
                Ok(CircuitCheck::Ok) => {}
                Err(err) => {
                    fatal = Some(err);
                    break;
                }
            }

            let worker_count = self.circuit.current_params().await.workers;
            let mut handles = Vec::with_capacity(worker_count);
            for w in 0..worker_count {
                let coordinator = self.clone();
                let filter = filter.clone();
                handles.push(tokio::spawn(async move {
                    coordinator.run_one_iteration(w, round, &filter).await
                }));
            }

            let mut any_ran = false;
            for handle in handles {
                match handle.await {
                    Ok(Ok(IterationOutcome::Idle)) => {}
                    Ok(Ok(IterationOutcome::Success)) => {
                        any_ran = true;
                        completed += 1;
                    }
                    Ok(Ok(IterationOutcome::RetryScheduled)) => {
                        any_ran = true;
                    }
                    Ok(Ok(IterationOutcome::FailTerminal { quarantined: was_quarantined })) => {
                        any_ran = true;
                        failed += 1;
                        if was_quarantined {
                            quarantined += 1;
                        }
                        if self.config.parallel_failure_mode == ParallelFailureMode::AbortAll {
                            abort_all = true;
                        }
                    }
                    Ok(Ok(IterationOutcome::Aborted { task_id })) => {
                        any_ran = true;
                        interrupted = true;
                        interrupted_task_ids.push(task_id);
                    }
                    Ok(Err(err)) => {
                        fatal = Some(err);
                    }
                    Err(join_err) => {
                        warn!(error = %join_err, "worker iteration task panicked");
                    }
                }
            }

            round += 1;

            if fatal.is_some() || interrupted {
                break;
            }
            if !any_ran {
                info!(round, "no task claimed this round, drain complete");
                break;
            }

            if last_checkpoint.elapsed() >= self.config.checkpoint.interval {
                self.write_checkpoint(&namespace, round, &[], started_at).await;
                last_checkpoint = tokio::time::Instant::now();
            }

            tokio::time::sleep(self.circuit.current_params().await.task_delay).await;
        }

        sweep_cancel.cancel();
        let _ = sweep_handle.await;

        if interrupted {
            if let Err(err) = self.runner.cleanup().await {
                warn!(error = %err, "agent runner cleanup failed during shutdown");
            }
        }
        if let Err(err) = self.registry.persist().await {
            warn!(error = %err, "failed to persist process registry");
        }
        self.write_checkpoint(&namespace, round, &interrupted_task_ids, started_at)
            .await;

        if let Some(err) = fatal {
            return Err(err);
        }

        let self_healing_attempts = self.circuit.state().await.self_healing_attempts;
        Ok(EngineRunSummary {
            tasks_completed: completed,
            tasks_failed: failed,
            tasks_quarantined: quarantined,
            rounds_run: round,
            self_healing_attempts,
            interrupted,
        })
    }

    async fn write_checkpoint(
        &self,
        namespace: &str,
        completed_iterations: u64,
        interrupted_tasks: &[String],
        started_at: chrono::DateTime<chrono::Utc>,
    ) {
        let snapshot = CheckpointSnapshot {
            workers: self.config.worker_count,
            completed_iterations,
            interrupted_tasks: interrupted_tasks.iter().cloned().collect(),
            started_at,
            namespace: namespace.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
        };
        if let Err(err) = self.checkpoint_store.save(&snapshot).await {
            warn!(error = %err, "checkpoint write failed (best-effort, continuing)");
        }
    }

    /// One worker's claim-execute-report cycle.
    async fn run_one_iteration(
        &self,
        worker_id: usize,
        round: u64,
        filter: &TaskFilter,
    ) -> Result<IterationOutcome, EngineError> {
        let task = match self.store.claim(filter).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.observer.on_worker_status(worker_id, WorkerStatus::Idle).await;
                return Ok(IterationOutcome::Idle);
            }
            Err(source) => {
                return Err(EngineError::BackendInvalid {
                    operation: "claim",
                    fatal: true,
                    source,
                })
            }
        };
        let claimed = ClaimedTask::new(task, worker_id);
        let task = claimed.task.clone();
        self.observer.on_worker_status(worker_id, WorkerStatus::Running).await;

        self.failure_tracker
            .sync_from_store(&task.id, task.failure_count)
            .await;

        let params = self.circuit.current_params().await;
        let output_dir = self.config.output_dir.join("logs");
        if let Err(err) = tokio::fs::create_dir_all(&output_dir).await {
            warn!(error = %err, "failed to create output directory");
        }
        let iteration_key = format!("iteration-{round}-worker-{worker_id}");
        let output_path = output_dir.join(format!("{iteration_key}-output.txt"));
        let prompt_path = output_dir.join(format!("{iteration_key}-prompt.md"));
        let prompt = resolve_prompt(&task);
        if let Err(err) = tokio::fs::write(&prompt_path, &prompt).await {
            warn!(task_id = %task.id, error = %err, "failed to write prompt file");
        }

        let ctx = TaskContext {
            task: task.clone(),
            worker_id,
            round,
            retry_attempt: self.failure_tracker.count(&task.id).await,
            namespace: self.config.checkpoint.namespace.clone(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            prompt,
            prompt_path,
            output_path,
            timeout: params.timeout,
        };

        self.observer.on_task_start(&task, worker_id).await;

        let run_result = tokio::select! {
            biased;
            _ = self.interrupt.cancellation_token().cancelled() => {
                let _ = self.store.reset_to_pending(&task.id).await;
                self.observer.on_task_abort(&task, "interrupted").await;
                return Ok(IterationOutcome::Aborted { task_id: task.id.clone() });
            }
            result = self.runner.run(&ctx) => result,
        };

        let outcome = match run_result {
            Err(err) => {
                let _ = self.store.reset_to_pending(&task.id).await;
                return Err(EngineError::CliNotFound(err.to_string()));
            }
            Ok(outcome) => outcome,
        };

        if outcome.succeeded() {
            if let Err(err) = self.store.mark_completed(&task.id, None).await {
                warn!(task_id = %task.id, error = %err, "mark_completed failed (non-fatal)");
            }
            self.failure_tracker.clear(&task.id).await;
            self.circuit.record_success().await;
            self.observer.on_task_complete(&task, worker_id).await;
            return Ok(IterationOutcome::Success);
        }

        let excerpt = read_excerpt(&outcome.output_path)
            .await
            .unwrap_or_else(|| format!("agent exited with code {:?}", outcome.exit_code));
        let new_count = self.failure_tracker.record_failure(&task.id, &excerpt).await;
        self.circuit.record_failure(&excerpt).await;

        // Quarantine eligibility takes priority over retrying: once a task
        // has failed `quarantine_threshold` times, further retries are
        // pointless -- the next terminal failure is this one.
        if new_count >= self.config.retry.quarantine_threshold {
            if let Err(err) = self.store.mark_quarantined(&task.id, &excerpt).await {
                warn!(task_id = %task.id, error = %err, "mark_quarantined failed (non-fatal)");
            }
            self.observer.on_task_failed(&task, worker_id, &excerpt).await;
            return Ok(IterationOutcome::FailTerminal { quarantined: true });
        }

        let has_budget = self.retry_budget.has_budget().await;
        if new_count <= self.config.retry.max_retries_per_task && has_budget {
            self.retry_budget.consume().await;
            let backoff = compute_backoff(
                self.config.retry.backoff_base,
                self.config.retry.backoff_multiplier,
                self.config.retry.backoff_max,
                new_count - 1,
                self.config.retry.jitter,
            );
            if let Err(err) = self.store.reset_to_pending(&task.id).await {
                warn!(task_id = %task.id, error = %err, "reset_to_pending failed (non-fatal)");
            }
            self.observer.on_task_retry(&task, worker_id, new_count).await;
            self.observer.on_worker_status(worker_id, WorkerStatus::Backoff).await;
            tokio::time::sleep(backoff).await;
            return Ok(IterationOutcome::RetryScheduled);
        }

        if let Err(err) = self.store.mark_failed(&task.id, &excerpt).await {
            warn!(task_id = %task.id, error = %err, "mark_failed failed (non-fatal)");
        }
        self.observer.on_task_failed(&task, worker_id, &excerpt).await;
        Ok(IterationOutcome::FailTerminal { quarantined: false })
    }
}

/// Best-effort tail read of a captured output file, used as the "raw error
/// excerpt" fed to the failure classifier when the agent exits non-zero.
async fn read_excerpt(path: &std::path::Path) -> Option<String> {
    const MAX_EXCERPT_BYTES: u64 = 2048;
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let len = metadata.len();
    let content = tokio::fs::read_to_string(path).await.ok()?;
    if len > MAX_EXCERPT_BYTES {
        let start = content.len().saturating_sub(MAX_EXCERPT_BYTES as usize);
        Some(content[start..].to_string())
    } else {
        Some(content)
    }
}

/// Resolves the prompt text for a task. Composing a rich prompt from task
/// context is out of scope here; this only picks the value up from wherever
/// the task carried it.
fn resolve_prompt(task: &Task) -> String {
    if let Some(prompt) = task.metadata.get("prompt").and_then(|v| v.as_str()) {
        return prompt.to_string();
    }
    if !task.description.is_empty() {
        return task.description.clone();
    }
    task.title.clone()
}
