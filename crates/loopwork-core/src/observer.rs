//! Observer hooks for external visibility into the run (metrics, TUI, logs).
//!
//! Observers are best-effort: a panic or error inside one must never affect
//! task execution. `FanOutObserver` enforces this by catching failures and
//! logging them rather than propagating.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;

use crate::task::Task;

/// Status of a worker, reported between rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Running,
    Backoff,
}

/// Hooks invoked by the coordinator as tasks move through their lifecycle.
///
/// Every method has a no-op default so implementations only override what
/// they care about.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn on_task_start(&self, _task: &Task, _worker_id: usize) {}

    async fn on_task_complete(&self, _task: &Task, _worker_id: usize) {}

    async fn on_task_failed(&self, _task: &Task, _worker_id: usize, _error: &str) {}

    async fn on_task_retry(&self, _task: &Task, _worker_id: usize, _attempt: u32) {}

    async fn on_task_abort(&self, _task: &Task, _reason: &str) {}

    async fn on_worker_status(&self, _worker_id: usize, _status: WorkerStatus) {}
}

/// Broadcasts every hook call to a list of observers, isolating failures.
pub struct FanOutObserver {
    observers: Vec<Box<dyn Observer>>,
}

impl FanOutObserver {
    pub fn new(observers: Vec<Box<dyn Observer>>) -> Self {
        Self { observers }
    }

    async fn dispatch<'a, F, Fut>(&'a self, name: &'static str, f: F)
    where
        F: Fn(&'a dyn Observer) -> Fut,
        Fut: std::future::Future<Output = ()> + 'a,
    {
        for observer in &self.observers {
            let outcome = AssertUnwindSafe(f(observer.as_ref())).catch_unwind().await;
            if outcome.is_err() {
                tracing::warn!(hook = name, "observer panicked; continuing");
            }
        }
    }
}

#[async_trait]
impl Observer for FanOutObserver {
    async fn on_task_start(&self, task: &Task, worker_id: usize) {
        self.dispatch("on_task_start", |o| o.on_task_start(task, worker_id))
            .await;
    }

    async fn on_task_complete(&self, task: &Task, worker_id: usize) {
        self.dispatch("on_task_complete", |o| o.on_task_complete(task, worker_id))
            .await;
    }

    async fn on_task_failed(&self, task: &Task, worker_id: usize, error: &str) {
        self.dispatch("on_task_failed", |o| {
            o.on_task_failed(task, worker_id, error)
        })
        .await;
    }

    async fn on_task_retry(&self, task: &Task, worker_id: usize, attempt: u32) {
        self.dispatch("on_task_retry", |o| {
            o.on_task_retry(task, worker_id, attempt)
        })
        .await;
    }

    async fn on_task_abort(&self, task: &Task, reason: &str) {
        self.dispatch("on_task_abort", |o| o.on_task_abort(task, reason))
            .await;
    }

    async fn on_worker_status(&self, worker_id: usize, status: WorkerStatus) {
        self.dispatch("on_worker_status", |o| {
            o.on_worker_status(worker_id, status)
        })
        .await;
    }
}

/// An observer that only writes `tracing` events, used as the engine default.
pub struct TracingObserver;

#[async_trait]
impl Observer for TracingObserver {
    async fn on_task_start(&self, task: &Task, worker_id: usize) {
        tracing::info!(task_id = %task.id, worker_id, "task started");
    }

    async fn on_task_complete(&self, task: &Task, worker_id: usize) {
        tracing::info!(task_id = %task.id, worker_id, "task completed");
    }

    async fn on_task_failed(&self, task: &Task, worker_id: usize, error: &str) {
        tracing::warn!(task_id = %task.id, worker_id, error, "task failed");
    }

    async fn on_task_retry(&self, task: &Task, worker_id: usize, attempt: u32) {
        tracing::info!(task_id = %task.id, worker_id, attempt, "task scheduled for retry");
    }

    async fn on_task_abort(&self, task: &Task, reason: &str) {
        tracing::error!(task_id = %task.id, reason, "task aborted");
    }

    async fn on_worker_status(&self, worker_id: usize, status: WorkerStatus) {
        tracing::debug!(worker_id, ?status, "worker status");
    }
}
