//! Reference `AgentRunner` that spawns an arbitrary configured binary per
//! task, captures its combined stdout+stderr to the per-iteration output
//! file, and enforces the per-invocation timeout.
//!
//! Tracks children in a `HashMap<u32, Child>` keyed by pid for cancellation,
//! escalates SIGTERM-then-SIGKILL on termination, and does a one-shot
//! preflight spawn before the first task. This crate deliberately does not
//! interpret the subprocess's output at all -- prompt construction and
//! agent semantics are out of scope; this exists only to make the
//! workspace runnable end to end.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use loopwork_core::agent::{AgentHandle, AgentOutcome, AgentRunner, TaskContext};
use loopwork_core::process::{ProcessRecord, ProcessRegistry};
use loopwork_core::task::Task;

/// How the subprocess is invoked.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Path or `$PATH`-resolved name of the agent binary.
    pub command: String,
    /// Arguments prepended to every invocation, before the per-task ones
    /// this runner appends (`--task-id`, the working directory, ...).
    pub base_args: Vec<String>,
    /// Arguments used for the one-time `preflight` health check, e.g.
    /// `["--version"]`. Run with a short fixed timeout.
    pub preflight_args: Vec<String>,
    /// Timeout applied to the preflight check itself.
    pub preflight_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on cancel/cleanup/timeout.
    pub termination_grace_period: Duration,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            command: "true".to_string(),
            base_args: Vec::new(),
            preflight_args: vec!["--version".to_string()],
            preflight_timeout: Duration::from_secs(10),
            termination_grace_period: Duration::from_secs(5),
        }
    }
}

struct Tracked {
    child: Child,
}

/// Spawns one subprocess per task, registering it in a shared
/// [`ProcessRegistry`] so [`loopwork_core::process::OrphanDetector`] can
/// reap it if this runner's own bookkeeping is ever lost (process crash).
pub struct SubprocessRunner {
    config: SubprocessConfig,
    registry: ProcessRegistry,
    namespace: String,
    children: Arc<Mutex<HashMap<u32, Tracked>>>,
}

impl SubprocessRunner {
    pub fn new(config: SubprocessConfig, registry: ProcessRegistry, namespace: impl Into<String>) -> Self {
        Self {
            config,
            registry,
            namespace: namespace.into(),
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn build_command(&self, ctx: &TaskContext) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.base_args);
        cmd.arg("--task-id").arg(&ctx.task.id);
        cmd.arg("--prompt-file").arg(&ctx.prompt_path);
        cmd.arg("--output").arg(&ctx.output_path);
        if let Some(feature) = &ctx.task.feature {
            cmd.arg("--feature").arg(feature);
        }
        cmd.current_dir(&ctx.working_dir);
        cmd.kill_on_drop(true);
        cmd
    }

    /// SIGTERM, wait up to the grace period, SIGKILL -- mirrors
    /// `loopwork_core::process::ProcessCleaner`, duplicated here rather
    /// than shared because this runner holds a live `Child` (so it can
    /// `wait()` directly) instead of only a bare pid.
    async fn terminate(&self, pid: u32, child: &mut Child) {
        #[cfg(unix)]
        {
            // SAFETY: pid is a child this runner spawned and still tracks.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }
        let exited = tokio::time::timeout(self.config.termination_grace_period, child.wait()).await;
        match exited {
            Ok(Ok(_)) => debug!(pid, "process exited after SIGTERM"),
            _ => {
                debug!(pid, "process did not exit after SIGTERM, sending SIGKILL");
                let _ = child.kill().await;
            }
        }
    }
}

#[async_trait]
impl AgentRunner for SubprocessRunner {
    async fn preflight(&self, worker_count: usize) -> anyhow::Result<()> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.preflight_args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let spawn_result = cmd.spawn();
        let mut child = match spawn_result {
            Ok(child) => child,
            Err(err) => anyhow::bail!("agent binary '{}' failed to spawn: {err}", self.config.command),
        };

        let status = tokio::time::timeout(self.config.preflight_timeout, child.wait())
            .await
            .map_err(|_| anyhow::anyhow!("preflight check timed out after {:?}", self.config.preflight_timeout))??;

        if !status.success() {
            anyhow::bail!(
                "preflight check for '{}' exited with status {status} (worker_count={worker_count})",
                self.config.command
            );
        }
        Ok(())
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<AgentOutcome> {
        if let Some(parent) = ctx.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let output_file = File::create(&ctx.output_path).await?.into_std().await;
        let stderr_file = output_file.try_clone()?;

        let mut cmd = self.build_command(ctx);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(output_file));
        cmd.stderr(Stdio::from(stderr_file));

        let mut child = cmd
            .spawn()
            .map_err(|err| anyhow::anyhow!("agent binary '{}' failed to spawn: {err}", self.config.command))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("spawned child has no pid"))?;

        let record = ProcessRecord::new(pid, self.config.command.clone(), self.config.base_args.clone(), self.namespace.clone())
            .with_task_id(ctx.task.id.clone());
        self.registry.add(record).await?;

        // Track the live child by pid *before* waiting on it, so that if
        // this future is dropped mid-wait (the coordinator's `tokio::select!`
        // against the interrupt token drops the losing branch), the child
        // is not dropped with it -- it survives in `self.children` for a
        // later `cleanup()` call to find and terminate.
        self.children.lock().await.insert(pid, Tracked { child });

        let deadline = tokio::time::Instant::now() + ctx.timeout;
        let status = loop {
            {
                let mut children = self.children.lock().await;
                let Some(tracked) = children.get_mut(&pid) else {
                    // Removed concurrently by `cancel`/`cleanup`.
                    break None;
                };
                if let Ok(Some(status)) = tracked.child.try_wait() {
                    children.remove(&pid);
                    break Some(status);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        let outcome = match status {
            Some(status) => AgentOutcome {
                exit_code: status.code(),
                timed_out: false,
                output_path: ctx.output_path.clone(),
            },
            None => {
                // Either the deadline passed with the child still running, or
                // a concurrent cancel/cleanup already removed (and is
                // terminating) it. Either way this invocation is over; make
                // sure the child is actually gone before reporting timeout.
                if let Some(mut tracked) = self.children.lock().await.remove(&pid) {
                    warn!(pid, task_id = %ctx.task.id, timeout = ?ctx.timeout, "agent invocation timed out, terminating");
                    self.terminate(pid, &mut tracked.child).await;
                }
                AgentOutcome {
                    exit_code: None,
                    timed_out: true,
                    output_path: ctx.output_path.clone(),
                }
            }
        };

        let _ = self.registry.remove(pid).await;

        Ok(outcome)
    }

    async fn cancel(&self, handle: AgentHandle) -> anyhow::Result<()> {
        let tracked = self.children.lock().await.remove(&handle.pid);
        if let Some(mut tracked) = tracked {
            self.terminate(handle.pid, &mut tracked.child).await;
        }
        let _ = self.registry.remove(handle.pid).await;
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        let pids: Vec<u32> = self.children.lock().await.keys().copied().collect();
        for pid in pids {
            let tracked = self.children.lock().await.remove(&pid);
            if let Some(mut tracked) = tracked {
                self.terminate(pid, &mut tracked.child).await;
            }
            let _ = self.registry.remove(pid).await;
        }
        Ok(())
    }

    fn next_model(&self, _task: &Task) -> Option<String> {
        None
    }
}

/// Output path this runner would use for a given `(round, worker)` pair.
/// Exposed so a caller building a `TaskContext` doesn't need to re-derive
/// the naming convention.
pub fn output_path(output_dir: &std::path::Path, round: u64, worker_id: usize) -> PathBuf {
    output_dir
        .join("logs")
        .join(format!("iteration-{round}-worker-{worker_id}-output.txt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopwork_core::task::{Priority, TaskStatus};
    use std::time::Duration as StdDuration;

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status: TaskStatus::InProgress,
            priority: Priority::Medium,
            feature: None,
            depends_on: Default::default(),
            failure_count: 0,
            last_error: None,
            metadata: Default::default(),
        }
    }

    fn ctx(dir: &std::path::Path, task: Task, timeout: StdDuration) -> TaskContext {
        TaskContext {
            task,
            worker_id: 0,
            round: 0,
            retry_attempt: 0,
            namespace: "default".to_string(),
            working_dir: dir.to_path_buf(),
            prompt: "do the thing".to_string(),
            prompt_path: dir.join("prompt.md"),
            output_path: dir.join("output.txt"),
            timeout,
        }
    }

    #[tokio::test]
    async fn run_captures_exit_code_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        let config = SubprocessConfig {
            command: "sh".to_string(),
            base_args: vec!["-c".to_string(), "echo hello; exit 3".to_string()],
            ..Default::default()
        };
        let runner = SubprocessRunner::new(config, registry, "default");

        let outcome = runner
            .run(&ctx(dir.path(), task("t1"), StdDuration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
        let content = tokio::fs::read_to_string(&outcome.output_path).await.unwrap();
        assert!(content.contains("hello"));
    }

    #[tokio::test]
    async fn run_kills_process_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        let config = SubprocessConfig {
            command: "sh".to_string(),
            base_args: vec!["-c".to_string(), "sleep 60".to_string()],
            ..Default::default()
        };
        let runner = SubprocessRunner::new(config, registry.clone(), "default");

        let outcome = runner
            .run(&ctx(dir.path(), task("t1"), StdDuration::from_millis(100)))
            .await
            .unwrap();

        assert!(outcome.timed_out);
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preflight_fails_for_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        let config = SubprocessConfig {
            command: "/nonexistent/definitely-not-a-binary".to_string(),
            ..Default::default()
        };
        let runner = SubprocessRunner::new(config, registry, "default");

        assert!(runner.preflight(1).await.is_err());
    }

    #[tokio::test]
    async fn preflight_succeeds_for_exit_zero() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("processes.json"));
        let config = SubprocessConfig {
            command: "true".to_string(),
            preflight_args: vec![],
            ..Default::default()
        };
        let runner = SubprocessRunner::new(config, registry, "default");

        runner.preflight(2).await.unwrap();
    }
}
