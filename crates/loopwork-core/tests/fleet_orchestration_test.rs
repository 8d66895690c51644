//! End-to-end coordinator scenarios that exercise more than one round of
//! scheduling, driven entirely through `loopwork-test-utils` fakes so no
//! real subprocess or on-disk task store is involved.

use std::sync::Arc;
use std::time::Duration;

use loopwork_core::agent::AgentRunner;
use loopwork_core::config::{CircuitBreakerConfig, EngineConfig, RetryPolicy};
use loopwork_core::coordinator::Coordinator;
use loopwork_core::error::EngineError;
use loopwork_core::observer::TracingObserver;
use loopwork_core::signal::InterruptHandler;
use loopwork_core::task::{Priority, Task, TaskStore};
use loopwork_test_utils::{sample_task, MemoryTaskStore, ScriptedAgentRunner};

fn test_config(state_dir: &std::path::Path, worker_count: usize) -> EngineConfig {
    EngineConfig {
        worker_count,
        state_dir: state_dir.join("state"),
        output_dir: state_dir.join("output"),
        task_delay: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

/// Scenario C: every task fails with a rate-limit-shaped excerpt. The
/// circuit breaker trips once `trip_threshold` consecutive failures land,
/// halves the worker count as its rate-limit adjustment, and keeps tripping
/// as the (still failing) tasks churn through the reduced pool. Once
/// `max_healing_attempts` adjustments have been applied with no recovery,
/// the run ends in `EngineError::TaskInvalid`.
#[tokio::test]
async fn scenario_c_rate_limit_exhausts_self_healing() {
    let dir = tempfile::tempdir().unwrap();

    let tasks: Vec<Task> = (0..15).map(|i| sample_task(&format!("t{i}"))).collect();
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new(tasks));

    let scripts = (0..15).map(|i| (format!("t{i}"), vec![1, 1, 1, 1, 1]));
    let runner: Arc<dyn AgentRunner> = Arc::new(RateLimitedRunner::new(scripts));

    let mut config = test_config(dir.path(), 4);
    config.circuit_breaker = CircuitBreakerConfig {
        trip_threshold: 3,
        cooldown: Duration::from_millis(5),
        max_healing_attempts: 3,
    };
    config.retry = RetryPolicy {
        quarantine_threshold: 100,
        max_retries_per_task: 100,
        budget_window: Duration::from_secs(600),
        budget_limit: 1000,
        backoff_base: Duration::from_millis(1),
        backoff_multiplier: 1.0,
        backoff_max: Duration::from_millis(1),
        jitter: false,
    };

    let observer = Arc::new(TracingObserver);
    let interrupt = InterruptHandler::new();
    let coordinator = Coordinator::new(config, store, runner, observer, interrupt);

    let result = coordinator.run(false).await;

    match result {
        Err(EngineError::TaskInvalid { attempts }) => {
            assert_eq!(attempts, 3);
        }
        other => panic!("expected ERR_TASK_INVALID after self-healing exhaustion, got {other:?}"),
    }
}

/// A runner that always returns the next scripted exit code but writes an
/// excerpt the circuit breaker's classifier recognizes as a rate-limit
/// failure, regardless of the exit code itself.
struct RateLimitedRunner {
    inner: ScriptedAgentRunner,
}

impl RateLimitedRunner {
    fn new(scripts: impl IntoIterator<Item = (String, Vec<i32>)>) -> Self {
        Self {
            inner: ScriptedAgentRunner::new(scripts),
        }
    }
}

#[async_trait::async_trait]
impl AgentRunner for RateLimitedRunner {
    async fn preflight(&self, worker_count: usize) -> anyhow::Result<()> {
        self.inner.preflight(worker_count).await
    }

    async fn run(
        &self,
        ctx: &loopwork_core::agent::TaskContext,
    ) -> anyhow::Result<loopwork_core::agent::AgentOutcome> {
        let outcome = self.inner.run(ctx).await?;
        if let Some(parent) = ctx.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&ctx.output_path, "error: HTTP 429 rate limit exceeded").await?;
        Ok(outcome)
    }

    async fn cancel(&self, handle: loopwork_core::agent::AgentHandle) -> anyhow::Result<()> {
        self.inner.cancel(handle).await
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.inner.cleanup().await
    }
}

/// Scenario D: a three-task dependency chain (`a` -> `b` -> `c`) must run in
/// order even with three workers available, since `b`'s and `c`'s
/// dependencies keep them unclaimable until their predecessor completes.
#[tokio::test]
async fn scenario_d_dependency_chain_runs_in_order() {
    let dir = tempfile::tempdir().unwrap();

    let mut task_a = sample_task("a");
    task_a.priority = Priority::Low;
    let mut task_b = sample_task("b");
    task_b.priority = Priority::Low;
    task_b.depends_on.insert("a".to_string());
    let mut task_c = sample_task("c");
    task_c.priority = Priority::Low;
    task_c.depends_on.insert("b".to_string());

    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new(vec![task_c, task_a, task_b]));

    let order = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let runner: Arc<dyn AgentRunner> = Arc::new(OrderTrackingRunner {
        order: order.clone(),
    });

    let config = test_config(dir.path(), 3);
    let observer = Arc::new(TracingObserver);
    let interrupt = InterruptHandler::new();
    let coordinator = Coordinator::new(config, store.clone(), runner, observer, interrupt);

    let summary = coordinator.run(false).await.expect("run should succeed");
    assert_eq!(summary.tasks_completed, 3);
    assert_eq!(summary.tasks_failed, 0);

    let seen = order.lock().unwrap().clone();
    let idx = |id: &str| seen.iter().position(|x| x == id).unwrap();
    assert!(idx("a") < idx("b"));
    assert!(idx("b") < idx("c"));
}

struct OrderTrackingRunner {
    order: Arc<std::sync::Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl AgentRunner for OrderTrackingRunner {
    async fn preflight(&self, _worker_count: usize) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(
        &self,
        ctx: &loopwork_core::agent::TaskContext,
    ) -> anyhow::Result<loopwork_core::agent::AgentOutcome> {
        self.order.lock().unwrap().push(ctx.task.id.clone());
        if let Some(parent) = ctx.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&ctx.output_path, "ok").await?;
        Ok(loopwork_core::agent::AgentOutcome {
            exit_code: Some(0),
            timed_out: false,
            output_path: ctx.output_path.clone(),
        })
    }

    async fn cancel(&self, _handle: loopwork_core::agent::AgentHandle) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
