//! Graceful termination of tracked subprocesses that must be torn down
//! (engine shutdown, timeout, or orphan reconciliation).
//!
//! Unlike an [`crate::agent::AgentRunner`], which holds a live `Child` handle,
//! the cleaner only has a bare pid recovered from the [`ProcessRegistry`] --
//! so termination goes through raw signals rather than `Child::kill`, mirroring
//! the SIGTERM-then-SIGKILL sequence an in-process adapter would use on its
//! own child.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::process::registry::{ProcessRecord, ProcessRegistry};

/// Result of attempting to clean up one tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Process was already gone.
    AlreadyExited,
    /// Process exited after SIGTERM within the grace period.
    TerminatedGracefully,
    /// Process required SIGKILL after ignoring SIGTERM.
    ForceKilled,
}

/// Terminates tracked subprocesses and reconciles the registry.
pub struct ProcessCleaner {
    grace_period: Duration,
}

impl ProcessCleaner {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// For `record`: if the OS already reports no such process, remove and
    /// count as clean. Otherwise send SIGTERM, wait up to `grace_period`,
    /// escalate to SIGKILL if still alive. Never aborts a sweep -- a
    /// permission-denied or unexpected error becomes `ERR_PROCESS_KILL` and
    /// is returned for the caller to record and continue past.
    pub async fn cleanup(
        &self,
        registry: &ProcessRegistry,
        record: &ProcessRecord,
    ) -> Result<CleanupOutcome, EngineError> {
        let pid = record.pid;

        if !process_alive(pid) {
            let _ = registry.remove(pid).await;
            return Ok(CleanupOutcome::AlreadyExited);
        }

        #[cfg(unix)]
        {
            // SAFETY: pid came from a ProcessRecord we wrote ourselves when we
            // spawned the subprocess.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, proceeding to poll for SIGKILL");
            }
        }

        let deadline = tokio::time::Instant::now() + self.grace_period;
        let outcome = loop {
            if !process_alive(pid) {
                break CleanupOutcome::TerminatedGracefully;
            }
            if tokio::time::Instant::now() >= deadline {
                #[cfg(unix)]
                {
                    // SAFETY: same pid, still tracked as ours.
                    let ret = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
                    if ret != 0 && process_alive(pid) {
                        let _ = registry.remove(pid).await;
                        return Err(EngineError::ProcessKill {
                            pid,
                            source: std::io::Error::last_os_error(),
                        });
                    }
                }
                break CleanupOutcome::ForceKilled;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        debug!(pid, task_id = ?record.task_id, ?outcome, "process cleaned up");
        let _ = registry.remove(pid).await;
        Ok(outcome)
    }
}

/// Signal-0 liveness probe: sends no actual signal, just checks whether the
/// kernel would deliver one (i.e. whether `pid` still exists and is ours to
/// signal).
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    // SAFETY: libc::kill with signal 0 performs no action beyond error checking.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_reports_already_exited_for_unknown_pid() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        let record = ProcessRecord::new(999_999, "agent", vec![], "default");
        registry.add(record.clone()).await.unwrap();

        let cleaner = ProcessCleaner::new(Duration::from_millis(100));
        let outcome = cleaner.cleanup(&registry, &record).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::AlreadyExited);
        assert!(registry.list().await.unwrap().is_empty());
    }
}
