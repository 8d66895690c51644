//! On-disk registry of spawned agent subprocesses, keyed by pid.
//!
//! Persisted as a single JSON document versioned by schema number under the
//! engine's state directory, written atomically (temp file + rename) and
//! mutated only under an exclusive advisory lock on a sibling `.lock` file,
//! so concurrent workers in the same engine process -- and a previous
//! crashed engine process -- never clobber each other's records.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use anyhow::Context;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Orphaned,
    Stale,
}

/// One tracked subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub namespace: String,
    #[serde(default)]
    pub task_id: Option<String>,
    /// Epoch milliseconds the process was first tracked.
    pub start_time_ms: i64,
    /// PID of the owning engine process; defaults to the engine's own pid.
    pub parent_pid: u32,
    pub status: ProcessStatus,
}

impl ProcessRecord {
    pub fn new(pid: u32, command: impl Into<String>, args: Vec<String>, namespace: impl Into<String>) -> Self {
        Self {
            pid,
            command: command.into(),
            args,
            namespace: namespace.into(),
            task_id: None,
            start_time_ms: chrono::Utc::now().timestamp_millis(),
            parent_pid: std::process::id(),
            status: ProcessStatus::Running,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    #[serde(default)]
    processes: Vec<ProcessRecord>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            processes: Vec::new(),
        }
    }
}

/// File-backed registry of in-flight subprocesses, keyed by pid.
#[derive(Clone)]
pub struct ProcessRegistry {
    path: PathBuf,
}

impl ProcessRegistry {
    /// `path` is the registry JSON file (e.g. `.loopwork/processes.json`).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn read(&self) -> anyhow::Result<RegistryDocument> {
        if !self.path.exists() {
            return Ok(RegistryDocument::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("reading process registry at {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(RegistryDocument::default());
        }
        serde_json::from_str(&content).context("parsing process registry JSON")
    }

    fn write(&self, doc: &RegistryDocument) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("creating process registry directory")?;
        }
        let json = serde_json::to_string_pretty(doc).context("serializing process registry")?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).context("writing temp process registry file")?;
        fs::rename(&tmp_path, &self.path).context("renaming temp process registry file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .context("setting process registry permissions")?;
        }
        Ok(())
    }

    /// Acquire the exclusive lock, re-read from disk, apply `f`, write back.
    fn locked_mutate<F, R>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&mut RegistryDocument) -> R,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("creating process registry directory")?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.lock_path())
            .context("opening process registry lock file")?;
        lock_file
            .lock_exclusive()
            .context("acquiring process registry lock")?;

        let mut doc = self.read()?;
        let result = f(&mut doc);
        self.write(&doc)?;
        Ok(result)
        // lock_file drops here, releasing the flock
    }

    async fn with_lock<F, R>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&mut RegistryDocument) -> R + Send + 'static,
        R: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.locked_mutate(f))
            .await
            .context("process registry task panicked")?
    }

    /// Record a newly spawned subprocess. Replaces any existing record with
    /// the same pid (pids are reused by the OS over a long-running engine).
    pub async fn add(&self, record: ProcessRecord) -> anyhow::Result<()> {
        self.with_lock(move |doc| {
            doc.processes.retain(|r| r.pid != record.pid);
            doc.processes.push(record);
        })
        .await
    }

    /// Look up a single record by pid.
    pub async fn get(&self, pid: u32) -> anyhow::Result<Option<ProcessRecord>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let doc = this.read()?;
            Ok(doc.processes.into_iter().find(|r| r.pid == pid))
        })
        .await
        .context("process registry read task panicked")?
    }

    /// Remove a subprocess record once it has exited or been cleaned up.
    pub async fn remove(&self, pid: u32) -> anyhow::Result<Option<ProcessRecord>> {
        self.with_lock(move |doc| {
            let idx = doc.processes.iter().position(|r| r.pid == pid)?;
            Some(doc.processes.remove(idx))
        })
        .await
    }

    /// Mutate the status of a tracked record in place.
    pub async fn update_status(&self, pid: u32, status: ProcessStatus) -> anyhow::Result<bool> {
        self.with_lock(move |doc| {
            match doc.processes.iter_mut().find(|r| r.pid == pid) {
                Some(record) => {
                    record.status = status;
                    true
                }
                None => false,
            }
        })
        .await
    }

    /// Snapshot of every currently tracked process.
    pub async fn list(&self) -> anyhow::Result<Vec<ProcessRecord>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let doc = this.read()?;
            Ok(doc.processes)
        })
        .await
        .context("process registry read task panicked")?
    }

    /// Records scoped to a single namespace.
    pub async fn list_by_namespace(&self, namespace: &str) -> anyhow::Result<Vec<ProcessRecord>> {
        let namespace = namespace.to_string();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.namespace == namespace)
            .collect())
    }

    /// Drop every tracked record.
    pub async fn clear(&self) -> anyhow::Result<()> {
        self.with_lock(|doc| doc.processes.clear()).await
    }

    /// Force a persist of the current in-memory view to disk. Since every
    /// mutating operation already persists immediately, this is a no-op
    /// retained for callers that want an explicit flush point (e.g. before
    /// releasing the engine lock on shutdown).
    pub async fn persist(&self) -> anyhow::Result<()> {
        self.with_lock(|_doc| ()).await
    }

    /// Load is tolerant to a missing file (returns an empty list).
    pub async fn load(&self) -> anyhow::Result<Vec<ProcessRecord>> {
        self.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pid: u32) -> ProcessRecord {
        ProcessRecord::new(pid, "agent", vec!["--flag".to_string()], "default")
            .with_task_id("task-1")
    }

    #[tokio::test]
    async fn add_and_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        registry.add(sample(1234)).await.unwrap();

        let all = registry.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].task_id.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn remove_deletes_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        registry.add(sample(1234)).await.unwrap();

        let removed = registry.remove(1234).await.unwrap();
        assert!(removed.is_some());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_status_mutates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        registry.add(sample(1234)).await.unwrap();

        assert!(registry.update_status(1234, ProcessStatus::Orphaned).await.unwrap());
        let record = registry.get(1234).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessStatus::Orphaned);
    }

    #[tokio::test]
    async fn list_by_namespace_filters() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        registry
            .add(ProcessRecord::new(1, "agent", vec![], "alpha"))
            .await
            .unwrap();
        registry
            .add(ProcessRecord::new(2, "agent", vec![], "beta"))
            .await
            .unwrap();

        let alpha = registry.list_by_namespace("alpha").await.unwrap();
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].pid, 1);
    }

    #[tokio::test]
    async fn persist_then_load_preserves_set_modulo_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processes.json");
        let registry = ProcessRegistry::new(path.clone());
        registry.add(sample(1)).await.unwrap();
        registry.add(sample(2)).await.unwrap();
        registry.persist().await.unwrap();

        let reloaded = ProcessRegistry::new(path);
        let mut pids: Vec<u32> = reloaded.load().await.unwrap().into_iter().map(|r| r.pid).collect();
        pids.sort();
        assert_eq!(pids, vec![1, 2]);
    }

    #[tokio::test]
    async fn clear_empties_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        registry.add(sample(1234)).await.unwrap();
        registry.clear().await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_additions_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processes.json");

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let registry = ProcessRegistry::new(path.clone());
            handles.push(tokio::spawn(async move {
                registry.add(sample(1000 + i)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let registry = ProcessRegistry::new(path);
        assert_eq!(registry.list().await.unwrap().len(), 8);
    }
}
