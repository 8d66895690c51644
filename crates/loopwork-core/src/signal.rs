//! Translates OS signals into a single coordinated, reentrancy-safe shutdown
//! flag the coordinator polls at its suspension points.
//!
//! A single shared cancellation flag plus a dedicated cleanup activity; the
//! handler itself is never re-entered. `SignalBridge` owns the OS-level
//! listener; `InterruptHandler` owns the idempotent state transition a
//! signal (or a test) drives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared, reentrancy-safe interrupt state.
///
/// `cancel` is what the coordinator's suspension points select on.
/// `cleanup_in_progress` ensures a second signal delivered while shutdown is
/// already running is ignored by this process; a *second* interrupt's
/// hard-exit escalation is left to the host, not handled here.
#[derive(Clone)]
pub struct InterruptHandler {
    cancel: CancellationToken,
    cleanup_in_progress: Arc<AtomicBool>,
}

impl InterruptHandler {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            cleanup_in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token the coordinator's suspension points race against.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Trigger shutdown. Idempotent: a second call while the first is still
    /// being processed is a no-op (the handler "ignores subsequent signals").
    /// Returns `true` if this call is the one that initiated shutdown.
    pub fn trigger(&self) -> bool {
        if self.cleanup_in_progress.swap(true, Ordering::SeqCst) {
            info!("interrupt already being handled, ignoring");
            return false;
        }
        info!("interrupt received, beginning coordinated shutdown");
        self.cancel.cancel();
        true
    }
}

impl Default for InterruptHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Listens for the host's soft-terminate and interactive-interrupt signals
/// and drives an [`InterruptHandler`].
///
/// Built on `tokio::signal` (enabled through the workspace's `full` feature
/// set) rather than hand-rolling a `libc` `sigaction` table.
pub struct SignalBridge {
    handler: InterruptHandler,
}

impl SignalBridge {
    pub fn new(handler: InterruptHandler) -> Self {
        Self { handler }
    }

    /// Spawn a background task that triggers `handler` on SIGINT/SIGTERM
    /// (Unix) or Ctrl-C (other platforms). Returns immediately; the spawned
    /// task runs until the process exits or the cancellation token fires.
    pub fn install(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to install SIGTERM handler");
                        return;
                    }
                };
                let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to install SIGINT handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = sigterm.recv() => { self.handler.trigger(); }
                    _ = sigint.recv() => { self.handler.trigger(); }
                    _ = self.handler.cancellation_token().cancelled() => {}
                }
            }
            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_ok() {
                    self.handler.trigger();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let handler = InterruptHandler::new();
        assert!(handler.trigger());
        assert!(!handler.trigger());
        assert!(handler.is_shutting_down());
    }

    #[test]
    fn fresh_handler_is_not_shutting_down() {
        let handler = InterruptHandler::new();
        assert!(!handler.is_shutting_down());
    }
}
