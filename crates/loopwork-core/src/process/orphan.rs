//! Periodic scan for subprocesses whose owning engine has died or that have
//! simply run far longer than any task should.
//!
//! Two independent classification rules:
//! - **parent-dead**: the record's `parent_pid` is non-zero and the OS
//!   reports no such process (a signal-0 probe returning "no such process").
//! - **stale**: wall-clock age exceeds 2x the configured task timeout.
//!
//! A record matching both rules is counted once, with the reason set to
//! whichever rule is checked first. The detector never classifies untracked
//! OS processes by name -- only records already in the registry are
//! candidates, so a user process that happens to share the agent binary's
//! name is never at risk.

use std::time::Duration;

use tracing::info;

use crate::process::cleaner::{process_alive, CleanupOutcome};
use crate::process::registry::{ProcessRecord, ProcessRegistry};
use crate::process::ProcessCleaner;

/// Why a [`ProcessRecord`] was classified as an orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanReason {
    ParentDead,
    Stale,
}

/// Finds and reaps orphaned subprocesses tracked in a [`ProcessRegistry`].
pub struct OrphanDetector {
    scan_interval: Duration,
    task_timeout: Duration,
    cleaner: ProcessCleaner,
}

impl OrphanDetector {
    /// `task_timeout` is the configured per-task timeout; a record is stale
    /// once its age exceeds 2x that value.
    pub fn new(scan_interval: Duration, task_timeout: Duration, cleanup_grace_period: Duration) -> Self {
        Self {
            scan_interval,
            task_timeout,
            cleaner: ProcessCleaner::new(cleanup_grace_period),
        }
    }

    /// One scan pass: classify every record in `registry`, reaping any that
    /// match either rule. Returns the pids that were reaped, deduplicated.
    pub async fn scan_once(&self, registry: &ProcessRegistry) -> anyhow::Result<Vec<u32>> {
        let mut reaped = Vec::new();
        for record in registry.list().await? {
            if let Some(reason) = self.classify(&record) {
                info!(
                    pid = record.pid,
                    task_id = ?record.task_id,
                    ?reason,
                    "reaping orphaned subprocess"
                );
                match self.cleaner.cleanup(registry, &record).await {
                    Ok(CleanupOutcome::AlreadyExited) => {}
                    Ok(_) => reaped.push(record.pid),
                    Err(err) => {
                        tracing::warn!(pid = record.pid, error = %err, "failed to reap orphan");
                    }
                }
            }
        }
        Ok(reaped)
    }

    /// Classify a single record, checking parent-dead before stale so a
    /// record matching both rules reports the former.
    pub fn classify(&self, record: &ProcessRecord) -> Option<OrphanReason> {
        if self.is_parent_dead(record) {
            return Some(OrphanReason::ParentDead);
        }
        if self.is_stale(record) {
            return Some(OrphanReason::Stale);
        }
        None
    }

    fn is_parent_dead(&self, record: &ProcessRecord) -> bool {
        record.parent_pid != 0 && !process_alive(record.parent_pid) && process_alive(record.pid)
    }

    fn is_stale(&self, record: &ProcessRecord) -> bool {
        let age_ms = chrono::Utc::now().timestamp_millis() - record.start_time_ms;
        age_ms as i64 > 2 * self.task_timeout.as_millis() as i64
    }

    /// Run `scan_once` on a loop, forever, until `cancel` fires. Intended to
    /// be spawned as a background task alongside the worker pool, always on:
    /// the cleanup sweep has no separate enable/disable flag, just the scan
    /// interval.
    pub async fn run(
        &self,
        registry: &ProcessRegistry,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.scan_once(registry).await {
                        tracing::warn!(error = %err, "orphan scan failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_orphan_when_parent_pid_is_dead() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        // Our own pid is always alive, so use it as the "subprocess" and an
        // implausible pid as the dead parent.
        let mut record = ProcessRecord::new(std::process::id(), "agent", vec![], "default");
        record.parent_pid = 999_999;
        registry.add(record.clone()).await.unwrap();

        let detector = OrphanDetector::new(Duration::from_secs(1), Duration::from_secs(600), Duration::from_millis(50));
        assert_eq!(detector.classify(&record), Some(OrphanReason::ParentDead));
    }

    #[tokio::test]
    async fn live_parent_is_not_orphaned() {
        let record = ProcessRecord::new(std::process::id(), "agent", vec![], "default");
        let detector = OrphanDetector::new(Duration::from_secs(1), Duration::from_secs(600), Duration::from_millis(50));
        assert_eq!(detector.classify(&record), None);
    }

    #[tokio::test]
    async fn stale_age_is_detected_even_with_live_parent() {
        let mut record = ProcessRecord::new(std::process::id(), "agent", vec![], "default");
        record.start_time_ms -= 1_000_000; // far in the past
        let detector = OrphanDetector::new(Duration::from_secs(1), Duration::from_millis(1), Duration::from_millis(50));
        assert_eq!(detector.classify(&record), Some(OrphanReason::Stale));
    }

    #[tokio::test]
    async fn parent_dead_takes_precedence_over_stale() {
        let mut record = ProcessRecord::new(std::process::id(), "agent", vec![], "default");
        record.parent_pid = 999_999;
        record.start_time_ms -= 1_000_000;
        let detector = OrphanDetector::new(Duration::from_secs(1), Duration::from_millis(1), Duration::from_millis(50));
        assert_eq!(detector.classify(&record), Some(OrphanReason::ParentDead));
    }
}
