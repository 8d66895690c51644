//! The `Task` data model and the `TaskStore` contract the engine consumes.
//!
//! The engine never caches a task past one worker iteration and never
//! mutates a `Task` directly -- all state transitions go through the
//! `TaskStore` trait, which is responsible for atomicity. Concrete stores
//! (a JSON file, a database, ...) live in their own crates; this module
//! only defines the contract.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use serde_json::Value;

/// Status of a task. Transitions are monotone except `pending <-> in_progress`
/// and `failed -> pending` (retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Quarantined,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Quarantined => "quarantined",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

/// Task priority, highest scheduled first by stores that honor it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// A unit of work owned by the `TaskStore`. The engine only ever holds
/// short-lived copies returned by `claim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub feature: Option<String>,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A task returned by a successful `claim`, owned by exactly one worker for
/// the duration of its execution cycle.
///
/// Intentionally not `Clone`: the "at most one owner" invariant is enforced
/// by the type system rather than by convention -- a caller cannot
/// accidentally hand the same claim to two workers.
#[derive(Debug)]
pub struct ClaimedTask {
    pub task: Task,
    pub worker_id: usize,
    pub claimed_at: chrono::DateTime<chrono::Utc>,
}

impl ClaimedTask {
    pub fn new(task: Task, worker_id: usize) -> Self {
        Self {
            task,
            worker_id,
            claimed_at: chrono::Utc::now(),
        }
    }
}

/// Filter applied by `claim` and `count_pending` when selecting candidate
/// tasks. An empty filter matches every pending task.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub feature: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        match &self.feature {
            Some(feature) => task.feature.as_deref() == Some(feature.as_str()),
            None => true,
        }
    }
}

/// The contract the engine consumes from a pluggable task store.
///
/// `claim` is the linchpin of correctness: implementations must guarantee
/// at-most-one claim under concurrent callers, typically via a store-internal
/// mutex (in-process) or an equivalent atomic operation (e.g. a `SELECT ...
/// FOR UPDATE SKIP LOCKED`, or an advisory file lock around a read-modify-
/// write cycle for file-backed stores).
///
/// State-write operations (`mark_completed`, `mark_failed`, `reset_to_pending`,
/// `mark_quarantined`) report failure but are never fatal to the caller --
/// the engine logs a backend-invalid warning and continues rather than
/// aborting the run over one failed transition write.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Atomically find a pending task matching `filter`, whose dependencies
    /// (if the store tracks them) are all satisfied, mark it in-progress,
    /// and return it. Returns `Ok(None)` when nothing pending matches.
    async fn claim(&self, filter: &TaskFilter) -> anyhow::Result<Option<Task>>;

    /// Count pending tasks matching `filter` (including dependency-blocked
    /// ones -- this is a coarse count used for operator visibility, not a
    /// claim-eligibility count).
    async fn count_pending(&self, filter: &TaskFilter) -> anyhow::Result<usize>;

    /// Transition a task to `completed`, recording an optional note.
    async fn mark_completed(&self, id: &str, note: Option<&str>) -> anyhow::Result<()>;

    /// Transition a task to `failed`, recording the error and incrementing
    /// `failure_count`.
    async fn mark_failed(&self, id: &str, error: &str) -> anyhow::Result<()>;

    /// Transition a task back to `pending` (used for retry and for
    /// interrupt-time release of claimed tasks).
    async fn reset_to_pending(&self, id: &str) -> anyhow::Result<()>;

    /// Transition a task to `quarantined` (dead-letter): the engine will
    /// never auto-retry it again.
    async fn mark_quarantined(&self, id: &str, reason: &str) -> anyhow::Result<()>;

    /// Reclaim tasks left `in-progress` by a prior crashed run. Invoked once
    /// at startup, except when resuming from a checkpoint. Stores that
    /// cannot distinguish a crash from a live run may implement this as a
    /// no-op.
    async fn reset_all_in_progress(&self) -> anyhow::Result<usize> {
        Ok(0)
    }
}
