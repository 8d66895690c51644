//! The `AgentRunner` contract: spawning and supervising the external agent
//! process that actually does a task's work.
//!
//! This is deliberately a simpler surface than a full conversational harness
//! -- the engine treats an agent invocation as "run to completion (or
//! timeout), inspect the exit code, capture combined output", not an
//! interactive event stream. A reference implementation lives in the
//! `loopwork-subprocess` crate.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::task::Task;

/// Everything an `AgentRunner` needs to execute one task.
///
/// Immutable for the duration of one worker iteration.
/// Per-task flags live on `task.metadata` rather than a separate field --
/// there is no flag the engine itself interprets, so a second bag would
/// just be an alias for the same map.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub worker_id: usize,
    /// Coordinator round this iteration belongs to.
    pub round: u64,
    /// 0 on first attempt, incremented on each retry of this task.
    pub retry_attempt: u32,
    /// Checkpoint/log namespace for this run.
    pub namespace: String,
    /// Working directory the agent process should run in.
    pub working_dir: PathBuf,
    /// The prompt text for this invocation. Content is sourced from
    /// `task.metadata`/`task.description` by the coordinator -- composing it
    /// is out of scope here, but the value itself is part of the contract.
    pub prompt: String,
    /// File `prompt` is written to before the runner is invoked, keyed by
    /// `(round, worker_id)` the same way `output_path` is.
    pub prompt_path: PathBuf,
    /// File the agent's combined stdout/stderr should be captured to.
    pub output_path: PathBuf,
    /// Hard ceiling on execution time; the runner must guarantee the process
    /// is gone by the time it returns after this elapses.
    pub timeout: Duration,
}

/// A handle to a running (or just-finished) agent invocation, opaque to the
/// coordinator beyond its pid -- used to register the process for orphan
/// tracking and to request cancellation.
#[derive(Debug, Clone, Copy)]
pub struct AgentHandle {
    pub pid: u32,
}

/// Outcome of a completed agent invocation.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output_path: PathBuf,
}

impl AgentOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs one external agent process per task. Implementations own process
/// spawning, output capture, and timeout enforcement; the engine only calls
/// `run` and interprets the [`AgentOutcome`].
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// One-time health check before the loop starts, given the worker count
    /// the coordinator is about to run with. Failure is a fatal startup
    /// error (`ERR_PREFLIGHT_FAILED`).
    async fn preflight(&self, worker_count: usize) -> anyhow::Result<()>;

    /// Spawn the agent for `ctx` and wait for it to finish or time out.
    /// `ctx.prompt_path` has already been written with `ctx.prompt` by the
    /// time this is called. Must never return before the subprocess is no
    /// longer running.
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<AgentOutcome>;

    /// Request best-effort cancellation of a running invocation, used on
    /// interrupt. Implementations that cannot cancel mid-flight may treat
    /// this as a no-op and rely on the engine's process cleanup sweep instead.
    async fn cancel(&self, handle: AgentHandle) -> anyhow::Result<()>;

    /// Terminate every in-flight invocation this runner knows about. Called
    /// once by the `InterruptHandler` during coordinated shutdown; must be
    /// safe to call concurrently with `run`.
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// Select the CLI/model identifier for the next invocation of `task`,
    /// for runners that rotate between multiple backends. The reference
    /// subprocess runner is single-backend and always returns `None`.
    fn next_model(&self, _task: &Task) -> Option<String> {
        None
    }
}
