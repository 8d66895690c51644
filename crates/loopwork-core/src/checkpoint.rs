//! Periodic and terminal snapshots of run progress, namespaced to disk.
//!
//! Writes are best-effort and must never block a worker: callers log and
//! continue on failure rather than propagating. This collapses what could
//! otherwise be two persistence paths (a periodic checkpoint and a
//! separate, sometimes-out-of-sync "resume state" file) into a single file
//! per namespace.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// A point-in-time snapshot of an engine run, written periodically and once
/// more at shutdown/completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointSnapshot {
    pub workers: usize,
    pub completed_iterations: u64,
    #[serde(default)]
    pub interrupted_tasks: BTreeSet<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub namespace: String,
    pub session_id: String,
}

/// Namespaced JSON checkpoint files under a persistent, project-local
/// directory (e.g. `.loopwork/`).
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        if namespace == "default" {
            self.root.join("parallel-state.json")
        } else {
            self.root.join(format!("parallel-state-{namespace}.json"))
        }
    }

    /// Write `snapshot`, atomically (temp-then-rename). Errors are returned
    /// to the caller to log; the coordinator must not treat this as fatal.
    pub async fn save(&self, snapshot: &CheckpointSnapshot) -> anyhow::Result<()> {
        let root = self.root.clone();
        let path = self.path_for(&snapshot.namespace);
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&root).context("creating checkpoint directory")?;
            let json =
                serde_json::to_string_pretty(&snapshot).context("serializing checkpoint")?;
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, json).context("writing temp checkpoint file")?;
            fs::rename(&tmp, &path).context("renaming temp checkpoint file")
        })
        .await
        .context("checkpoint save task panicked")?
    }

    /// Load the checkpoint for `namespace`, tolerating a missing or
    /// unreadable file by returning `Ok(None)` ("no state").
    pub async fn load(&self, namespace: &str) -> anyhow::Result<Option<CheckpointSnapshot>> {
        let path = self.path_for(namespace);
        tokio::task::spawn_blocking(move || Ok(read_checkpoint(&path)))
            .await
            .context("checkpoint load task panicked")?
    }
}

fn read_checkpoint(path: &Path) -> Option<CheckpointSnapshot> {
    let content = fs::read_to_string(path).ok()?;
    if content.trim().is_empty() {
        return None;
    }
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(namespace: &str) -> CheckpointSnapshot {
        CheckpointSnapshot {
            workers: 4,
            completed_iterations: 2,
            interrupted_tasks: ["t1".to_string()].into_iter().collect(),
            started_at: chrono::Utc::now(),
            namespace: namespace.to_string(),
            session_id: "session-1".to_string(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let snap = sample("default");
        store.save(&snap).await.unwrap();

        let loaded = store.load("default").await.unwrap().unwrap();
        assert_eq!(loaded, snap);
    }

    #[tokio::test]
    async fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn namespaces_use_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&sample("alpha")).await.unwrap();
        store.save(&sample("beta")).await.unwrap();

        assert!(store.load("alpha").await.unwrap().is_some());
        assert!(store.load("beta").await.unwrap().is_some());
        assert!(dir.path().join("parallel-state-alpha.json").exists());
        assert!(dir.path().join("parallel-state-beta.json").exists());
    }
}
