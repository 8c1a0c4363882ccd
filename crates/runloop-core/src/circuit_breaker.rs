use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::Level;

use runloop_observability::{emit_event, ObservabilityEvent, ProcessKind};
use runloop_types::ToolCategory;

use crate::config::CategoryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// `trial` marks the single call let through while half-open.
    Allowed { trial: bool },
    Rejected { retry_after: Duration },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CircuitSnapshot {
    pub category: ToolCategory,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub opened_at: Option<DateTime<Utc>>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    trial_started: Option<Instant>,
    total_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
}

/// Failure governor for one tool category, shared by every run using it.
pub struct CircuitBreaker {
    category: ToolCategory,
    failure_threshold: u32,
    success_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(category: ToolCategory, policy: &CategoryPolicy) -> Self {
        Self {
            category,
            failure_threshold: policy.failure_threshold.max(1),
            success_threshold: policy.success_threshold.max(1),
            cooldown: policy.cooldown(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                opened_at_wall: None,
                trial_started: None,
                total_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
            }),
        }
    }

    pub fn category(&self) -> &ToolCategory {
        &self.category
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn try_acquire(&self) -> Admission {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.total_calls += 1;
                Admission::Allowed { trial: false }
            }
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.trial_started = Some(now);
                    inner.total_calls += 1;
                    drop(inner);
                    self.log_transition(CircuitState::HalfOpen);
                    Admission::Allowed { trial: true }
                } else {
                    inner.rejected_calls += 1;
                    Admission::Rejected {
                        retry_after: self.cooldown - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                // A trial call that never reported back is released after a cooldown.
                let trial_busy = inner
                    .trial_started
                    .is_some_and(|started| now.saturating_duration_since(started) < self.cooldown);
                if trial_busy {
                    inner.rejected_calls += 1;
                    let started = inner.trial_started.unwrap_or(now);
                    Admission::Rejected {
                        retry_after: self.cooldown - now.saturating_duration_since(started),
                    }
                } else {
                    inner.trial_started = Some(now);
                    inner.total_calls += 1;
                    Admission::Allowed { trial: true }
                }
            }
        }
    }

    pub fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::HalfOpen || !trial {
            return;
        }
        inner.trial_started = None;
        inner.consecutive_successes += 1;
        if inner.consecutive_successes >= self.success_threshold {
            inner.state = CircuitState::Closed;
            inner.consecutive_successes = 0;
            inner.opened_at = None;
            inner.opened_at_wall = None;
            drop(inner);
            self.log_transition(CircuitState::Closed);
        }
    }

    pub fn record_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.failed_calls += 1;
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        let reopen = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::HalfOpen => trial,
            CircuitState::Open => false,
        };
        if reopen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.opened_at_wall = Some(Utc::now());
            inner.trial_started = None;
            drop(inner);
            self.log_transition(CircuitState::Open);
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.trial_started = None;
        drop(inner);
        self.log_transition(CircuitState::Closed);
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            category: self.category.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_calls: inner.total_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            opened_at: inner.opened_at_wall,
        }
    }

    fn log_transition(&self, to: CircuitState) {
        let level = if to == CircuitState::Open {
            Level::WARN
        } else {
            Level::INFO
        };
        emit_event(
            level,
            ProcessKind::Worker,
            ObservabilityEvent::new("breaker.transition", "circuit_breaker")
                .category(self.category.as_str())
                .status(to.as_str()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        let policy = CategoryPolicy {
            timeout_ms: 1_000,
            failure_threshold: 3,
            success_threshold: 2,
            cooldown_ms: 10_000,
        };
        CircuitBreaker::new(ToolCategory::network_lookup(), &policy)
    }

    fn fail_closed(cb: &CircuitBreaker, times: u32) {
        for _ in 0..times {
            assert_eq!(cb.try_acquire(), Admission::Allowed { trial: false });
            cb.record_failure(false);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_during_cooldown() {
        let cb = breaker();
        fail_closed(&cb, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail_closed(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Open);

        for _ in 0..5 {
            assert!(matches!(cb.try_acquire(), Admission::Rejected { .. }));
        }
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.rejected_calls, 5);
        assert_eq!(snapshot.failed_calls, 3);
        assert!(snapshot.opened_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let cb = breaker();
        fail_closed(&cb, 2);
        assert_eq!(cb.try_acquire(), Admission::Allowed { trial: false });
        cb.record_success(false);
        fail_closed(&cb, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn admits_exactly_one_trial_after_cooldown() {
        let cb = breaker();
        fail_closed(&cb, 3);
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(cb.try_acquire(), Admission::Allowed { trial: true });
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(cb.try_acquire(), Admission::Rejected { .. }));
        assert!(matches!(cb.try_acquire(), Admission::Rejected { .. }));

        cb.record_success(true);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.try_acquire(), Admission::Allowed { trial: true });
        cb.record_success(true);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.try_acquire(), Admission::Allowed { trial: false });
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let cb = breaker();
        fail_closed(&cb, 3);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.try_acquire(), Admission::Allowed { trial: true });
        cb.record_failure(true);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_acquire(), Admission::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_trial_is_released_after_cooldown() {
        let cb = breaker();
        fail_closed(&cb, 3);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.try_acquire(), Admission::Allowed { trial: true });
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.try_acquire(), Admission::Allowed { trial: true });
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_immediately() {
        let cb = breaker();
        fail_closed(&cb, 3);
        cb.reset();
        assert_eq!(cb.try_acquire(), Admission::Allowed { trial: false });
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }
}
