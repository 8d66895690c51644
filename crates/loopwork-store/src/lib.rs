//! Reference `TaskStore` backed by a JSON document:
//! `{ "tasks": [...] }`, written atomically (temp file + rename) under an
//! `fs2` advisory exclusive lock so that the read-modify-write cycle
//! `claim` needs is safe across concurrent workers in one engine process
//! and across multiple engine processes pointed at the same file.
//!
//! This is the one concrete store the canonical interchange format must be
//! compatible with; the engine itself only ever depends on
//! `loopwork_core::task::TaskStore`.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use loopwork_core::task::{Task, TaskFilter, TaskStatus, TaskStore};

/// On-disk document: `{ "tasks": [Task, ...] }`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskDocument {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// A `TaskStore` backed by a single JSON file.
///
/// Every mutating operation acquires an exclusive lock on a sibling
/// `<path>.lock` file, re-reads the document from disk, applies its
/// change, and writes back atomically -- the same pattern
/// `loopwork_core::process::ProcessRegistry` uses for its own JSON
/// document, so a second engine process (or this crate's own tests run in
/// parallel) can never interleave a claim.
#[derive(Clone)]
pub struct JsonTaskStore {
    path: PathBuf,
}

impl JsonTaskStore {
    /// `path` is the task store JSON file (e.g. `tasks.json`).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    fn read(path: &Path) -> anyhow::Result<TaskDocument> {
        if !path.exists() {
            return Ok(TaskDocument::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("reading task store at {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(TaskDocument::default());
        }
        serde_json::from_str(&content).context("parsing task store JSON")
    }

    fn write(path: &Path, doc: &TaskDocument) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("creating task store directory")?;
        }
        let json = serde_json::to_string_pretty(doc).context("serializing task store")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).context("writing temp task store file")?;
        fs::rename(&tmp, path).context("renaming temp task store file")
    }

    /// Acquire the exclusive lock, re-read, apply `f`, write back, release.
    fn locked_mutate<F, R>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&mut TaskDocument) -> R,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("creating task store directory")?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.lock_path())
            .context("opening task store lock file")?;
        lock_file
            .lock_exclusive()
            .context("acquiring task store lock")?;

        let mut doc = Self::read(&self.path)?;
        let result = f(&mut doc);
        Self::write(&self.path, &doc)?;
        Ok(result)
        // lock_file drops here, releasing the flock
    }

    async fn with_lock<F, R>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&mut TaskDocument) -> R + Send + 'static,
        R: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.locked_mutate(f))
            .await
            .context("task store mutation task panicked")?
    }

    /// Seed the store with `tasks`, overwriting whatever is currently on
    /// disk. Convenience for tests and for first-run bootstrapping; not
    /// part of the `TaskStore` trait.
    pub async fn seed(&self, tasks: Vec<Task>) -> anyhow::Result<()> {
        self.with_lock(move |doc| doc.tasks = tasks).await
    }

    /// Snapshot every task currently on disk, in file order. Not part of
    /// the `TaskStore` trait (which only exposes `count_pending`); useful
    /// for an operator-facing `status` view without requiring a second
    /// contract method.
    pub async fn all(&self) -> anyhow::Result<Vec<Task>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || Ok(Self::read(&this.path)?.tasks))
            .await
            .context("task store read task panicked")?
    }
}

/// Whether every id in `depends_on` names a task that is `completed` in
/// `tasks`. An unknown dependency id is treated as unsatisfied rather than
/// ignored -- a typo in `dependsOn` should block the task, not silently
/// make it immediately claimable.
fn dependencies_satisfied(depends_on: &std::collections::BTreeSet<String>, tasks: &[Task]) -> bool {
    depends_on.iter().all(|dep_id| {
        tasks
            .iter()
            .any(|t| &t.id == dep_id && t.status == TaskStatus::Completed)
    })
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn claim(&self, filter: &TaskFilter) -> anyhow::Result<Option<Task>> {
        let filter = filter.clone();
        self.with_lock(move |doc| {
            let candidate_idx = {
                let tasks = &doc.tasks;
                let mut candidates: Vec<usize> = tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| {
                        t.status == TaskStatus::Pending
                            && filter.matches(t)
                            && dependencies_satisfied(&t.depends_on, tasks)
                    })
                    .map(|(i, _)| i)
                    .collect();
                // Highest priority first; stable on ties so the oldest
                // eligible task (lowest file-order index) wins.
                candidates.sort_by(|&a, &b| tasks[b].priority.cmp(&tasks[a].priority));
                candidates.first().copied()
            };
            candidate_idx.map(|idx| {
                doc.tasks[idx].status = TaskStatus::InProgress;
                doc.tasks[idx].clone()
            })
        })
        .await
    }

    async fn count_pending(&self, filter: &TaskFilter) -> anyhow::Result<usize> {
        let all = self.all().await?;
        Ok(all
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && filter.matches(t))
            .count())
    }

    async fn mark_completed(&self, id: &str, note: Option<&str>) -> anyhow::Result<()> {
        let id = id.to_string();
        let note = note.map(str::to_string);
        self.with_lock(move |doc| {
            if let Some(task) = doc.tasks.iter_mut().find(|t| t.id == id) {
                task.status = TaskStatus::Completed;
                if let Some(note) = note {
                    task.metadata
                        .insert("completionNote".to_string(), serde_json::Value::String(note));
                }
            }
        })
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> anyhow::Result<()> {
        let id = id.to_string();
        let error = error.to_string();
        self.with_lock(move |doc| {
            if let Some(task) = doc.tasks.iter_mut().find(|t| t.id == id) {
                task.status = TaskStatus::Failed;
                task.failure_count += 1;
                task.last_error = Some(error);
            }
        })
        .await
    }

    async fn reset_to_pending(&self, id: &str) -> anyhow::Result<()> {
        let id = id.to_string();
        self.with_lock(move |doc| {
            if let Some(task) = doc.tasks.iter_mut().find(|t| t.id == id) {
                task.status = TaskStatus::Pending;
            }
        })
        .await
    }

    async fn mark_quarantined(&self, id: &str, reason: &str) -> anyhow::Result<()> {
        let id = id.to_string();
        let reason = reason.to_string();
        self.with_lock(move |doc| {
            if let Some(task) = doc.tasks.iter_mut().find(|t| t.id == id) {
                task.status = TaskStatus::Quarantined;
                task.last_error = Some(reason);
            }
        })
        .await
    }

    async fn reset_all_in_progress(&self) -> anyhow::Result<usize> {
        self.with_lock(|doc| {
            let mut count = 0;
            for task in doc.tasks.iter_mut() {
                if task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::Pending;
                    count += 1;
                }
            }
            count
        })
        .await
    }
}
