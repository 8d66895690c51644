//! Error taxonomy for the engine.
//!
//! Every variant corresponds to one of the `ERR_*` kinds the engine is
//! contractually required to distinguish. Fatal variants map to process
//! exit code 1 via [`EngineError::exit_code`]; interrupt-triggered shutdown
//! uses the dedicated 130 exit code and is represented separately since it
//! is not itself an error (see [`crate::coordinator::EngineRunSummary`]).

use std::path::PathBuf;

/// Errors the engine distinguishes by name across the store-facing log.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Pre-run health check refused; fatal before any task runs.
    #[error("preflight check failed: {reason}")]
    PreflightFailed { reason: String },

    /// Another engine instance holds the exclusive lock.
    #[error("lock conflict: another engine instance (pid {holder_pid}) holds {lock_path}")]
    LockConflict { lock_path: PathBuf, holder_pid: u32 },

    /// Resume was requested but no checkpoint exists for the namespace.
    #[error("resume requested for namespace {namespace:?} but no checkpoint was found")]
    StateInvalid { namespace: String },

    /// The agent binary could not be found or spawned.
    #[error("agent binary not found or failed to spawn: {0}")]
    CliNotFound(String),

    /// A TaskStore operation failed unexpectedly.
    ///
    /// `fatal` distinguishes count/claim failures (fatal) from per-transition
    /// writes (logged and non-fatal; the iteration continues).
    #[error("task store operation '{operation}' failed: {source}")]
    BackendInvalid {
        operation: &'static str,
        fatal: bool,
        #[source]
        source: anyhow::Error,
    },

    /// Surfaced only when dynamic observers were configured; never fatal.
    #[error("failed to load observer plugin: {0}")]
    PluginLoad(String),

    /// Circuit breaker exhausted its self-healing attempts.
    #[error("circuit breaker exhausted self-healing after {attempts} attempts")]
    TaskInvalid { attempts: u32 },

    /// ProcessCleaner could not terminate a process (e.g. permission denied).
    #[error("failed to terminate process {pid}: {source}")]
    ProcessKill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Whether this error must terminate the engine immediately.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::PreflightFailed { .. }
            | EngineError::LockConflict { .. }
            | EngineError::StateInvalid { .. }
            | EngineError::CliNotFound(_)
            | EngineError::TaskInvalid { .. } => true,
            EngineError::BackendInvalid { fatal, .. } => *fatal,
            EngineError::PluginLoad(_) | EngineError::ProcessKill { .. } => false,
        }
    }

    /// Process exit code for a fatal error. Non-fatal variants return `0`
    /// since they never reach the top-level exit path.
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() { 1 } else { 0 }
    }
}

/// Standard exit code for interrupt-triggered shutdown.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Standard exit code for normal completion.
pub const EXIT_OK: i32 = 0;

/// Standard exit code for any fatal [`EngineError`].
pub const EXIT_FATAL: i32 = 1;
