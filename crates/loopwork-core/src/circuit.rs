//! Consecutive-failure circuit breaker and self-healing adjustment policy.
//!
//! The breaker counts consecutive failing worker iterations across the
//! whole pool (reset on any success). When it trips, control passes to the
//! [`SelfHealer`], which classifies the last 10 [`FailureEvent`]s and, if a
//! dominant pattern emerges, mutates the live worker count / task delay /
//! timeout rather than giving up outright.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::retry::{FailureCategory, FailureEvent};

/// Adjustable knobs the self-healer may mutate at runtime, alongside the
/// original values so cumulative healing stays reasonable to operators and
/// every adjustment is computed relative to the unmodified baseline.
#[derive(Debug, Clone, Copy)]
pub struct AdjustableParams {
    pub workers: usize,
    pub task_delay: Duration,
    pub timeout: Duration,
}

/// Snapshot of the breaker's live state, for observability.
#[derive(Debug, Clone, Copy)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub self_healing_attempts: u32,
    pub current: AdjustableParams,
    pub original: AdjustableParams,
}

/// Outcome of a between-rounds circuit-breaker check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitCheck {
    /// Breaker has not tripped; no action needed.
    Ok,
    /// Breaker tripped and self-healing adjusted parameters; the coordinator
    /// should apply the returned values and continue after a cooldown.
    Healed,
}

struct Inner {
    consecutive_failures: u32,
    self_healing_attempts: u32,
    current: AdjustableParams,
    original: AdjustableParams,
    ring: std::collections::VecDeque<FailureEvent>,
}

/// Thresholds and caps driving the breaker and healer, mirrors
/// [`crate::config::CircuitBreakerConfig`] plus the numeric caps hard-coded
/// into the adjustment table below.
#[derive(Debug, Clone, Copy)]
pub struct CircuitPolicy {
    pub trip_threshold: u32,
    pub cooldown: Duration,
    pub max_healing_attempts: u32,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            trip_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_healing_attempts: 3,
        }
    }
}

const RING_CAPACITY: usize = 10;
const DOMINANCE_RATIO: f64 = 0.6;

/// A consecutive-failure counter guarding a [`SelfHealer`] adjustment cycle.
pub struct CircuitBreaker {
    policy: CircuitPolicy,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(policy: CircuitPolicy, original: AdjustableParams) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner {
                consecutive_failures: 0,
                self_healing_attempts: 0,
                current: original,
                original,
            }),
        }
    }

    /// Reset the consecutive-failure counter on any success.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
    }

    /// Record one failing worker iteration, feeding its error excerpt into
    /// the pattern-classifier ring.
    pub async fn record_failure(&self, excerpt: &str) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures += 1;
        inner.ring.push_back(FailureEvent::new(excerpt));
        while inner.ring.len() > RING_CAPACITY {
            inner.ring.pop_front();
        }
    }

    /// Current adjustable parameters (workers / task_delay / timeout).
    pub async fn current_params(&self) -> AdjustableParams {
        self.inner.lock().await.current
    }

    /// Snapshot of the full breaker state.
    pub async fn state(&self) -> CircuitState {
        let inner = self.inner.lock().await;
        CircuitState {
            consecutive_failures: inner.consecutive_failures,
            self_healing_attempts: inner.self_healing_attempts,
            current: inner.current,
            original: inner.original,
        }
    }

    /// Run between rounds. If the breaker has tripped, classify the ring and
    /// apply the corresponding adjustment, sleeping through the self-healing
    /// cooldown before returning. Returns [`EngineError::TaskInvalid`] once
    /// `max_healing_attempts` has been exceeded.
    pub async fn check(&self) -> Result<CircuitCheck, EngineError> {
        let (tripped, attempts) = {
            let inner = self.inner.lock().await;
            (
                inner.consecutive_failures >= self.policy.trip_threshold,
                inner.self_healing_attempts,
            )
        };
        if !tripped {
            return Ok(CircuitCheck::Ok);
        }

        if attempts >= self.policy.max_healing_attempts {
            return Err(EngineError::TaskInvalid { attempts });
        }

        let dominant = {
            let inner = self.inner.lock().await;
            dominant_category(&inner.ring)
        };

        {
            let mut inner = self.inner.lock().await;
            inner.current = apply_adjustment(inner.current, dominant);
            inner.consecutive_failures = 0;
            inner.ring.clear();
            inner.self_healing_attempts += 1;
        }

        match dominant {
            Some(FailureCategory::RateLimit) => warn!("Rate limit detected; halving workers and doubling task delay"),
            Some(FailureCategory::Timeout) => warn!("Timeout pattern detected; increasing per-task timeout"),
            Some(FailureCategory::Memory) => warn!("Memory pressure detected; halving workers"),
            Some(FailureCategory::CliCache) => warn!("CLI cache corruption detected; clearing caches on retry"),
            Some(FailureCategory::Unknown) | None => warn!("Unclassified failure pattern; backing off conservatively"),
        }

        let attempts_after = {
            let inner = self.inner.lock().await;
            inner.self_healing_attempts
        };
        info!(attempts = attempts_after, cooldown_secs = self.policy.cooldown.as_secs(), "self-healing applied, cooling down");
        tokio::time::sleep(self.policy.cooldown).await;

        Ok(CircuitCheck::Healed)
    }
}

/// The dominant category across `ring`: a category "wins" if it accounts
/// for >= 60% of the ring's entries.
fn dominant_category(ring: &std::collections::VecDeque<FailureEvent>) -> Option<FailureCategory> {
    if ring.is_empty() {
        return None;
    }
    let total = ring.len() as f64;
    let mut counts = std::collections::HashMap::new();
    for event in ring {
        *counts.entry(event.category).or_insert(0u32) += 1;
    }
    counts
        .into_iter()
        .find(|(_, count)| (*count as f64) / total >= DOMINANCE_RATIO)
        .map(|(category, _)| category)
}

fn apply_adjustment(current: AdjustableParams, category: Option<FailureCategory>) -> AdjustableParams {
    match category {
        Some(FailureCategory::RateLimit) => AdjustableParams {
            workers: (current.workers / 2).max(1),
            task_delay: (current.task_delay * 2).min(Duration::from_secs(30)),
            timeout: current.timeout,
        },
        Some(FailureCategory::Timeout) => AdjustableParams {
            workers: current.workers,
            task_delay: current.task_delay,
            timeout: Duration::from_secs_f64(
                (current.timeout.as_secs_f64() * 1.5).min(1800.0),
            ),
        },
        Some(FailureCategory::Memory) => AdjustableParams {
            workers: (current.workers / 2).max(1),
            task_delay: current.task_delay,
            timeout: current.timeout,
        },
        Some(FailureCategory::CliCache) => current,
        Some(FailureCategory::Unknown) | None => AdjustableParams {
            workers: current.workers.saturating_sub(1).max(1),
            task_delay: (current.task_delay + Duration::from_secs(2)).min(Duration::from_secs(10)),
            timeout: current.timeout,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AdjustableParams {
        AdjustableParams {
            workers: 8,
            task_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn trips_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(
            CircuitPolicy {
                trip_threshold: 3,
                cooldown: Duration::from_millis(1),
                max_healing_attempts: 3,
            },
            params(),
        );
        for _ in 0..2 {
            breaker.record_failure("boom").await;
            assert_eq!(breaker.check().await.unwrap(), CircuitCheck::Ok);
        }
        breaker.record_failure("429 rate limit").await;
        assert_eq!(breaker.check().await.unwrap(), CircuitCheck::Healed);
        assert_eq!(breaker.current_params().await.workers, 4);
    }

    #[tokio::test]
    async fn success_resets_consecutive_counter() {
        let breaker = CircuitBreaker::new(
            CircuitPolicy {
                trip_threshold: 3,
                cooldown: Duration::from_millis(1),
                max_healing_attempts: 3,
            },
            params(),
        );
        breaker.record_failure("boom").await;
        breaker.record_failure("boom").await;
        breaker.record_success().await;
        assert_eq!(breaker.check().await.unwrap(), CircuitCheck::Ok);
    }

    #[tokio::test]
    async fn exhausts_after_max_healing_attempts() {
        let breaker = CircuitBreaker::new(
            CircuitPolicy {
                trip_threshold: 1,
                cooldown: Duration::from_millis(1),
                max_healing_attempts: 2,
            },
            params(),
        );
        for _ in 0..2 {
            breaker.record_failure("timeout").await;
            assert_eq!(breaker.check().await.unwrap(), CircuitCheck::Healed);
        }
        breaker.record_failure("timeout").await;
        let err = breaker.check().await.unwrap_err();
        assert!(matches!(err, EngineError::TaskInvalid { attempts: 2 }));
    }

    #[tokio::test]
    async fn memory_pattern_halves_workers_only() {
        let breaker = CircuitBreaker::new(
            CircuitPolicy {
                trip_threshold: 2,
                cooldown: Duration::from_millis(1),
                max_healing_attempts: 3,
            },
            params(),
        );
        breaker.record_failure("out of memory").await;
        breaker.record_failure("OOM killed process").await;
        breaker.check().await.unwrap();
        let current = breaker.current_params().await;
        assert_eq!(current.workers, 4);
        assert_eq!(current.timeout, Duration::from_secs(600));
    }
}
