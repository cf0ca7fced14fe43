//! Retry decisions, backoff delays, and the per-step circuit breaker.
//!
//! Retry logic is stateless: the executor tracks the attempt count and asks
//! `should_retry` / `delay_for` before each re-attempt. The circuit breaker
//! is the stateful piece -- one instance per step ID, shared across runs
//! within the process.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use loomflow_types::workflow::{CircuitBreakerConfig, DelayStrategy, ErrorKind, RetryPolicy};

// ---------------------------------------------------------------------------
// Retry decisions
// ---------------------------------------------------------------------------

/// Whether a failed attempt should be retried.
///
/// `attempt` is the 1-based number of attempts already made. Deterministic
/// failures (validation, reference, evaluation, loop limits), permission
/// denials, cancellations, and open-breaker rejections are never retried,
/// even if listed in `retry_on`.
pub fn should_retry(policy: Option<&RetryPolicy>, attempt: u32, kind: ErrorKind) -> bool {
    let Some(policy) = policy else {
        return false;
    };
    if attempt >= policy.max_attempts {
        return false;
    }
    kind_is_retryable(policy, kind)
}

fn kind_is_retryable(policy: &RetryPolicy, kind: ErrorKind) -> bool {
    if matches!(
        kind,
        ErrorKind::Validation
            | ErrorKind::Reference
            | ErrorKind::Evaluation
            | ErrorKind::LoopLimit
            | ErrorKind::PermissionDenied
            | ErrorKind::Cancelled
            | ErrorKind::CircuitOpen
    ) {
        return false;
    }
    match &policy.retry_on {
        Some(kinds) => kinds.contains(&kind),
        None => kind.retryable_by_default(),
    }
}

/// Delay to wait before the next attempt, given `attempt` attempts already
/// made (1-based).
pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = match policy.delay {
        DelayStrategy::Fixed => policy.initial_delay_ms,
        DelayStrategy::Exponential | DelayStrategy::Jittered => {
            let exponent = attempt.saturating_sub(1);
            let scaled =
                policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(exponent as i32);
            scaled.min(policy.max_delay_ms as f64) as u64
        }
    };

    let delay_ms = match policy.delay {
        DelayStrategy::Jittered => {
            let jitter = rand::thread_rng().gen_range(0..=base / 2);
            (base + jitter).min(policy.max_delay_ms)
        }
        _ => base.min(policy.max_delay_ms),
    };

    Duration::from_millis(delay_ms)
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Outcome of asking the breaker whether an execution may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    Reject,
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Per-step circuit breaker: closed -> open after `failure_threshold`
/// consecutive failures -> half-open after `cooldown_ms` -> closed on a
/// successful trial, or straight back to open on a failed one.
///
/// Rejections while open do not advance the failure count.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Ask whether an execution may proceed. An open breaker whose cooldown
    /// has elapsed transitions to half-open and admits one trial.
    pub fn check(&self) -> BreakerDecision {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            BreakerState::Closed { .. } => BreakerDecision::Allow,
            BreakerState::HalfOpen => BreakerDecision::Allow,
            BreakerState::Open { since } => {
                if since.elapsed() >= Duration::from_millis(self.config.cooldown_ms) {
                    *state = BreakerState::HalfOpen;
                    BreakerDecision::Allow
                } else {
                    BreakerDecision::Reject
                }
            }
        }
    }

    /// Record a successful execution.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    /// Record a failed execution.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    BreakerState::Open {
                        since: Instant::now(),
                    }
                } else {
                    BreakerState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            // A failed half-open trial re-opens with a fresh cooldown.
            BreakerState::HalfOpen => BreakerState::Open {
                since: Instant::now(),
            },
            open @ BreakerState::Open { .. } => open,
        };
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
