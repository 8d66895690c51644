//! Engine configuration structs.
//!
//! Parsing these from a config file, environment variables, or CLI flags is
//! explicitly out of scope for this crate (the `loopwork-cli` binary does
//! that part); what lives here is the plain, validated shape the coordinator
//! consumes, plus the defaults a caller gets for free.

use std::time::Duration;

/// What the coordinator does when a worker iteration ends in a terminal
/// failure while other workers are still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelFailureMode {
    /// Keep running other workers and subsequent rounds (the default).
    ContinueOnFailure,
    /// Stop starting new rounds once any terminal failure occurs in the
    /// current round; rounds already spawned still drain.
    AbortAll,
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Optional feature filter applied to every claim.
    pub feature: Option<String>,
    /// Per-task timeout before the subprocess is killed.
    pub task_timeout: Duration,
    /// Delay inserted between a worker finishing a task and claiming the next.
    pub task_delay: Duration,
    /// Directory holding locks, checkpoints and the process registry
    /// (`.loopwork/` by convention).
    pub state_dir: std::path::PathBuf,
    /// Directory logs and per-iteration prompt/output files are written
    /// under (`<outputDir>/logs/...`).
    pub output_dir: std::path::PathBuf,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub checkpoint: CheckpointConfig,
    pub parallel_failure_mode: ParallelFailureMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            feature: None,
            task_timeout: Duration::from_secs(600),
            task_delay: Duration::from_secs(0),
            state_dir: std::path::PathBuf::from(".loopwork"),
            output_dir: std::path::PathBuf::from(".loopwork/output"),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            checkpoint: CheckpointConfig::default(),
            parallel_failure_mode: ParallelFailureMode::ContinueOnFailure,
        }
    }
}

/// Controls per-task retry and quarantine behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failures allowed before a task is quarantined.
    pub quarantine_threshold: u32,
    /// Maximum retries a single task gets before it is treated as terminal.
    pub max_retries_per_task: u32,
    /// Sliding window the global retry budget tracks.
    pub budget_window: Duration,
    /// Maximum retries allowed inside one budget window, across all tasks.
    pub budget_limit: usize,
    /// Base backoff before a retried task becomes claimable again.
    pub backoff_base: Duration,
    /// Multiplier applied to the backoff on each successive attempt.
    pub backoff_multiplier: f64,
    /// Backoff ceiling, regardless of failure count.
    pub backoff_max: Duration,
    /// Whether to apply +/-10% jitter to the computed backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            quarantine_threshold: 3,
            max_retries_per_task: 3,
            budget_window: Duration::from_secs(600),
            budget_limit: 20,
            backoff_base: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(120),
            jitter: true,
        }
    }
}

/// Controls circuit-breaker tripping and self-healing adjustments.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (across the worker pool) before the breaker trips.
    pub trip_threshold: u32,
    /// How long self-healing sleeps after applying an adjustment.
    pub cooldown: Duration,
    /// Maximum number of self-healing adjustment attempts before giving up
    /// and surfacing `EngineError::TaskInvalid`.
    pub max_healing_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_healing_attempts: 3,
        }
    }
}

/// Controls checkpoint cadence and orphan/cleanup sweeps.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Namespace used to scope the checkpoint file (one engine run = one namespace).
    pub namespace: String,
    /// How often a checkpoint is written during a run, independent of task completion.
    pub interval: Duration,
    /// How often the orphan detector scans the process registry. Always
    /// on, favoring a conservative default over an optional watch branch.
    pub orphan_scan_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL when cleaning up a process.
    pub cleanup_grace_period: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            interval: Duration::from_secs(30),
            orphan_scan_interval: Duration::from_secs(300),
            cleanup_grace_period: Duration::from_secs(5),
        }
    }
}
