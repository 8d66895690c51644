//! Shared test doubles for loopwork integration tests.
//!
//! Provides an in-memory `TaskStore` and a scripted `AgentRunner` so that
//! `loopwork-core`, `loopwork-store`, and `loopwork-subprocess` can each
//! write end-to-end scenario tests without duplicating the fakes the
//! coordinator's own unit tests already define inline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;

use loopwork_core::agent::{AgentHandle, AgentOutcome, AgentRunner, TaskContext};
use loopwork_core::task::{Task, TaskFilter, TaskStatus, TaskStore};

/// An in-memory `TaskStore` guarded by a single `std::sync::Mutex`,
/// matching the store-internal mutex the `claim` contract requires,
/// without any on-disk state.
pub struct MemoryTaskStore {
    tasks: StdMutex<Vec<Task>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: StdMutex::new(tasks),
        }
    }

    /// Snapshot every task, for assertions.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }
}

fn dependencies_satisfied(depends_on: &std::collections::BTreeSet<String>, tasks: &[Task]) -> bool {
    depends_on.iter().all(|dep_id| {
        tasks
            .iter()
            .any(|t| &t.id == dep_id && t.status == TaskStatus::Completed)
    })
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn claim(&self, filter: &TaskFilter) -> anyhow::Result<Option<Task>> {
        let mut tasks = self.tasks.lock().unwrap();
        let idx = {
            let snapshot = tasks.clone();
            tasks.iter().position(|t| {
                t.status == TaskStatus::Pending && filter.matches(t) && dependencies_satisfied(&t.depends_on, &snapshot)
            })
        };
        match idx {
            Some(i) => {
                tasks[i].status = TaskStatus::InProgress;
                Ok(Some(tasks[i].clone()))
            }
            None => Ok(None),
        }
    }

    async fn count_pending(&self, filter: &TaskFilter) -> anyhow::Result<usize> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && filter.matches(t))
            .count())
    }

    async fn mark_completed(&self, id: &str, _note: Option<&str>) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(t) = tasks.iter_mut().find(|t| t.id == id) {
            t.status = TaskStatus::Completed;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(t) = tasks.iter_mut().find(|t| t.id == id) {
            t.status = TaskStatus::Failed;
            t.failure_count += 1;
            t.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn reset_to_pending(&self, id: &str) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(t) = tasks.iter_mut().find(|t| t.id == id) {
            t.status = TaskStatus::Pending;
        }
        Ok(())
    }

    async fn mark_quarantined(&self, id: &str, reason: &str) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(t) = tasks.iter_mut().find(|t| t.id == id) {
            t.status = TaskStatus::Quarantined;
            t.last_error = Some(reason.to_string());
        }
        Ok(())
    }

    async fn reset_all_in_progress(&self) -> anyhow::Result<usize> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut count = 0;
        for t in tasks.iter_mut() {
            if t.status == TaskStatus::InProgress {
                t.status = TaskStatus::Pending;
                count += 1;
            }
        }
        Ok(count)
    }
}

/// An `AgentRunner` that replays a scripted list of exit codes per task id,
/// consumed front-to-back across retries. Tasks with no script left (or
/// never scripted) exit `0`.
pub struct ScriptedAgentRunner {
    scripts: StdMutex<HashMap<String, Vec<i32>>>,
    calls: AtomicUsize,
}

impl ScriptedAgentRunner {
    pub fn new(scripts: impl IntoIterator<Item = (String, Vec<i32>)>) -> Self {
        Self {
            scripts: StdMutex::new(scripts.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Total number of `run` invocations observed so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgentRunner {
    async fn preflight(&self, _worker_count: usize) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<AgentOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let code = {
            let mut scripts = self.scripts.lock().unwrap();
            let codes = scripts.entry(ctx.task.id.clone()).or_default();
            if codes.is_empty() {
                0
            } else {
                codes.remove(0)
            }
        };
        if let Some(parent) = ctx.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&ctx.output_path, format!("scripted exit {code}")).await?;
        Ok(AgentOutcome {
            exit_code: Some(code),
            timed_out: false,
            output_path: ctx.output_path.clone(),
        })
    }

    async fn cancel(&self, _handle: AgentHandle) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Build a minimal pending `Task` for tests, with the given id as both id
/// and title, no dependencies, and medium priority.
pub fn sample_task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: id.to_string(),
        description: String::new(),
        status: TaskStatus::Pending,
        priority: loopwork_core::task::Priority::Medium,
        feature: None,
        depends_on: Default::default(),
        failure_count: 0,
        last_error: None,
        metadata: Default::default(),
    }
}
