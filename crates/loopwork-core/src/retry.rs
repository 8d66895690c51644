//! Global retry budget and per-task failure tracking.
//!
//! Both are owned by the coordinator and guarded by an internal async mutex
//! -- contention is low (at most one operation per worker per iteration), so
//! a plain `tokio::sync::Mutex` is enough; there is no need for the
//! lock-free ring buffers a hotter path might reach for.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;

/// Category a [`FailureEvent`] is classified into by [`crate::circuit::SelfHealer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    RateLimit,
    Timeout,
    Memory,
    CliCache,
    Unknown,
}

impl FailureCategory {
    /// Classify a raw error excerpt using substring matching.
    pub fn classify(excerpt: &str) -> Self {
        let lower = excerpt.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
            Self::RateLimit
        } else if lower.contains("timeout") || lower.contains("etimedout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("memory") || lower.contains("oom") || lower.contains("out of memory") {
            Self::Memory
        } else if (lower.contains("enoent") && lower.contains("cache"))
            || lower.contains("cache corruption")
            || lower.contains("corrupted")
        {
            Self::CliCache
        } else {
            Self::Unknown
        }
    }
}

/// One recorded failure, retained as a bounded ring of the last 10.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub category: FailureCategory,
    pub excerpt: String,
}

impl FailureEvent {
    pub fn new(excerpt: impl Into<String>) -> Self {
        let excerpt = excerpt.into();
        Self {
            timestamp: chrono::Utc::now(),
            category: FailureCategory::classify(&excerpt),
            excerpt,
        }
    }
}

const FAILURE_RING_CAPACITY: usize = 10;

/// Per-task failure counter and last-error text, used to decide quarantine.
///
/// Synchronized from `Task::failure_count`/`Task::last_error` when a task is
/// claimed, so the decision survives process restarts even though the
/// tracker itself is in-memory.
#[derive(Debug, Default)]
pub struct FailureTracker {
    inner: Mutex<std::collections::HashMap<String, TrackedFailure>>,
}

#[derive(Debug, Clone, Default)]
struct TrackedFailure {
    count: u32,
    last_error: Option<String>,
    events: VecDeque<FailureEvent>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed (or reconcile) this task's in-memory count from the store's
    /// persisted `failure_count`, taking whichever is larger -- the engine
    /// never forgets failures the store already recorded.
    pub async fn sync_from_store(&self, task_id: &str, store_count: u32) {
        let mut guard = self.inner.lock().await;
        let entry = guard.entry(task_id.to_string()).or_default();
        entry.count = entry.count.max(store_count);
    }

    /// Record a failure for `task_id`, returning the updated count.
    pub async fn record_failure(&self, task_id: &str, excerpt: &str) -> u32 {
        let mut guard = self.inner.lock().await;
        let entry = guard.entry(task_id.to_string()).or_default();
        entry.count += 1;
        entry.last_error = Some(excerpt.to_string());
        entry.events.push_back(FailureEvent::new(excerpt));
        while entry.events.len() > FAILURE_RING_CAPACITY {
            entry.events.pop_front();
        }
        entry.count
    }

    /// Current failure count for `task_id` (0 if never seen).
    pub async fn count(&self, task_id: &str) -> u32 {
        self.inner
            .lock()
            .await
            .get(task_id)
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Whether `task_id` should be quarantined rather than merely failed:
    /// true once its tracked failure count reaches `threshold` at the
    /// moment of the terminal failure.
    pub async fn should_quarantine(&self, task_id: &str, threshold: u32) -> bool {
        self.count(task_id).await >= threshold
    }

    /// Clear tracked state for `task_id` on success: the ring is cleared on
    /// any success.
    pub async fn clear(&self, task_id: &str) {
        self.inner.lock().await.remove(task_id);
    }
}

/// Sliding-window global cap on retry consumption across all tasks.
///
/// Entries older than `window` are expired on every read so a long-idle
/// engine doesn't accumulate stale budget usage.
pub struct RetryBudget {
    max_retries: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<tokio::time::Instant>>,
}

impl RetryBudget {
    pub fn new(max_retries: usize, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    fn expire(&self, ring: &mut VecDeque<tokio::time::Instant>) {
        let now = tokio::time::Instant::now();
        while let Some(front) = ring.front() {
            if now.duration_since(*front) > self.window {
                ring.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether a retry may be consumed right now.
    pub async fn has_budget(&self) -> bool {
        let mut ring = self.timestamps.lock().await;
        self.expire(&mut ring);
        ring.len() < self.max_retries
    }

    /// Consume one unit of budget, recording the current instant.
    ///
    /// Callers should check [`Self::has_budget`] first; this always expires
    /// then appends regardless -- the budget is advisory bookkeeping, not a
    /// gate enforced inside this call.
    pub async fn consume(&self) {
        let mut ring = self.timestamps.lock().await;
        self.expire(&mut ring);
        ring.push_back(tokio::time::Instant::now());
    }

    /// Number of non-expired consumptions in the current window.
    pub async fn usage(&self) -> usize {
        let mut ring = self.timestamps.lock().await;
        self.expire(&mut ring);
        ring.len()
    }
}

/// Compute the backoff for retry attempt `n` (0-indexed):
/// `min(maxDelay, initialDelay * multiplier^n)`, with optional ±10% jitter.
pub fn compute_backoff(
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    attempt: u32,
    jitter: bool,
) -> Duration {
    let base = initial_delay.as_secs_f64() * multiplier.powi(attempt as i32);
    let base = base.min(max_delay.as_secs_f64());
    let factor = if jitter {
        1.0 + (rand::random::<f64>() * 0.2 - 0.1)
    } else {
        1.0
    };
    Duration::from_secs_f64((base * factor).max(0.0))
}
