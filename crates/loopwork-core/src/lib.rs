//! `loopwork-core`: the concurrent execution engine for a fleet of agent
//! tasks -- worker pool, atomic task-claim protocol, retry/backoff with a
//! global budget, adaptive circuit breaker with self-healing, dead-letter
//! quarantine, child-process registry with orphan detection, and the
//! interrupt-safe checkpoint/resume protocol.
//!
//! This crate defines the contracts (`TaskStore`, `AgentRunner`, `Observer`)
//! and drives them; concrete task stores and agent runners live in their own
//! crates (`loopwork-store`, `loopwork-subprocess`).

pub mod agent;
pub mod checkpoint;
pub mod circuit;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod observer;
pub mod process;
pub mod retry;
pub mod signal;
pub mod task;

pub use agent::{AgentHandle, AgentOutcome, AgentRunner, TaskContext};
pub use checkpoint::{CheckpointSnapshot, CheckpointStore};
pub use circuit::{AdjustableParams, CircuitBreaker, CircuitPolicy, CircuitState};
pub use config::{CheckpointConfig, CircuitBreakerConfig, EngineConfig, ParallelFailureMode, RetryPolicy};
pub use coordinator::{Coordinator, EngineRunSummary, WorkerSlot};
pub use error::{EngineError, EXIT_FATAL, EXIT_INTERRUPTED, EXIT_OK};
pub use lock::EngineLock;
pub use observer::{FanOutObserver, Observer, TracingObserver, WorkerStatus};
pub use process::{OrphanDetector, OrphanReason, ProcessCleaner, ProcessRecord, ProcessRegistry, ProcessStatus};
pub use retry::{FailureCategory, FailureEvent, FailureTracker, RetryBudget};
pub use signal::{InterruptHandler, SignalBridge};
pub use task::{ClaimedTask, Priority, Task, TaskFilter, TaskStatus, TaskStore};
