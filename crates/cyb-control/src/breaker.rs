//! The adaptive circuit breaker.
//!
//! # State Machine
//!
//! - `closed -> open` when `failures >= adaptive_threshold`; recovery is
//!   scheduled after a jittered exponential backoff (capped at 5 minutes)
//! - `open -> half-open` once the recovery deadline passes
//! - `half-open -> closed` after `success_threshold` consecutive successes
//! - `half-open -> open` on any failure, with an increased backoff
//!
//! While open, calls return [`CallError::Open`] without executing. Health
//! feedback tunes `adaptive_threshold` as an EMA blend of the base
//! threshold, a system-health factor, and the observed error rate, clamped
//! to `[2, 20]`. A half-open trial cancelled by its caller counts as
//! neither success nor failure.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use cyb_core::Backoff;

/// Threshold clamp bounds.
const THRESHOLD_MIN: f64 = 2.0;
const THRESHOLD_MAX: f64 = 20.0;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Base failure threshold before adaptation.
    pub base_threshold: f64,
    /// Consecutive successes required to close from half-open.
    pub success_threshold: u32,
    /// Deadline for each wrapped call.
    pub call_timeout: Duration,
    /// First recovery delay after opening.
    pub recovery_initial: Duration,
    /// Cap on the recovery backoff.
    pub recovery_max: Duration,
    /// EMA blend factor for threshold adaptation.
    pub ema_alpha: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            base_threshold: 5.0,
            success_threshold: 2,
            call_timeout: Duration::from_secs(30),
            recovery_initial: Duration::from_secs(1),
            recovery_max: Duration::from_secs(300),
            ema_alpha: 0.3,
        }
    }
}

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the recovery deadline.
    Open,
    /// One trial call at a time probes the downstream.
    HalfOpen,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallError<E> {
    /// The breaker is open; the function was not executed.
    #[error("circuit open")]
    Open,
    /// The wrapped call exceeded the breaker's deadline.
    #[error("call timed out")]
    Timeout,
    /// The wrapped call failed; recorded as a breaker failure.
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last close.
    pub failures: u32,
    /// Lifetime successes.
    pub successes: u32,
    /// Health score in `[0, 1]`.
    pub health_score: f64,
    /// Current adaptive threshold in `[2, 20]`.
    pub adaptive_threshold: f64,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    opened_until: Option<Instant>,
    health_score: f64,
    adaptive_threshold: f64,
    recovery: Backoff,
    trial_in_flight: bool,
}

/// A single-owner breaker state machine.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let threshold = config.base_threshold.clamp(THRESHOLD_MIN, THRESHOLD_MAX);
        let recovery = Backoff::new(config.recovery_initial, config.recovery_max, 2.0, 0.1);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                consecutive_successes: 0,
                last_failure_at: None,
                opened_until: None,
                health_score: 1.0,
                adaptive_threshold: threshold,
                recovery,
                trial_in_flight: false,
            }),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (open may flip to half-open on the next call).
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Execute `f` under the breaker with the configured call timeout.
    ///
    /// # Errors
    ///
    /// [`CallError::Open`] without executing when the breaker is open;
    /// [`CallError::Timeout`] when the deadline passes; [`CallError::Inner`]
    /// carrying the call's own error. Timeout and inner errors are recorded
    /// as breaker failures; results are never swallowed.
    pub async fn call<T, E, Fut, F>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(is_trial) = self.begin() else {
            return Err(CallError::Open);
        };
        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let outcome = tokio::time::timeout(self.config.call_timeout, f()).await;
        guard.armed = false;

        match outcome {
            Ok(Ok(value)) => {
                self.record_success(is_trial);
                Ok(value)
            },
            Ok(Err(e)) => {
                self.record_failure(is_trial);
                Err(CallError::Inner(e))
            },
            Err(_) => {
                self.record_failure(is_trial);
                Err(CallError::Timeout)
            },
        }
    }

    /// Admission decision. `Some(is_trial)` to proceed, `None` when open.
    fn begin(&self) -> Option<bool> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let due = inner.opened_until.is_none_or(|until| Instant::now() >= until);
                if due {
                    info!(breaker = %self.name, "recovery timer elapsed, probing half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Some(true)
                } else {
                    None
                }
            },
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(true)
                }
            },
        }
    }

    fn record_success(&self, was_trial: bool) {
        let mut inner = self.lock();
        inner.successes = inner.successes.saturating_add(1);
        inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
        inner.health_score = (inner.health_score + 0.1).min(1.0);
        if was_trial {
            inner.trial_in_flight = false;
        }
        if inner.state == CircuitState::HalfOpen
            && inner.consecutive_successes >= self.config.success_threshold
        {
            info!(breaker = %self.name, "closing after successful probes");
            inner.state = CircuitState::Closed;
            inner.failures = 0;
            inner.consecutive_successes = 0;
            inner.opened_until = None;
            inner.recovery.reset();
        }
    }

    fn record_failure(&self, was_trial: bool) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.consecutive_successes = 0;
        inner.health_score = (inner.health_score - 0.2).max(0.0);
        inner.last_failure_at = Some(Instant::now());
        if was_trial {
            inner.trial_in_flight = false;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                let delay = inner.recovery.next_delay();
                warn!(breaker = %self.name, ?delay, "probe failed, reopening");
                inner.state = CircuitState::Open;
                inner.opened_until = Some(Instant::now() + delay);
            },
            CircuitState::Closed => {
                if f64::from(inner.failures) >= inner.adaptive_threshold {
                    let delay = inner.recovery.next_delay();
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        threshold = inner.adaptive_threshold,
                        ?delay,
                        "failure threshold reached, opening"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_until = Some(Instant::now() + delay);
                }
            },
            CircuitState::Open => {},
        }
    }

    /// Cancelled half-open trial: counted as neither success nor failure.
    fn abort_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Blend a suggested threshold from system health and error rate:
    /// `suggested = base * health_factor * (1 - error_rate)` with
    /// `health_factor = 1.2` above 0.8 system health, else `0.8`; the new
    /// threshold is an EMA of the old and suggested values, clamped to
    /// `[2, 20]`.
    pub fn update_health(&self, system_health: f64, error_rate: f64) {
        let health_factor = if system_health > 0.8 { 1.2 } else { 0.8 };
        let error_rate = error_rate.clamp(0.0, 1.0);
        let suggested = self.config.base_threshold * health_factor * (1.0 - error_rate);

        let mut inner = self.lock();
        let alpha = self.config.ema_alpha.clamp(0.0, 1.0);
        let blended = inner.adaptive_threshold * (1.0 - alpha) + suggested * alpha;
        inner.adaptive_threshold = blended.clamp(THRESHOLD_MIN, THRESHOLD_MAX);
        debug!(
            breaker = %self.name,
            threshold = inner.adaptive_threshold,
            system_health,
            error_rate,
            "adaptive threshold updated"
        );
    }

    /// Operator override: trip the breaker open for `hold`.
    pub fn force_open(&self, hold: Duration) {
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.opened_until = Some(Instant::now() + hold);
        inner.trial_in_flight = false;
    }

    /// Operator override: close and reset counters.
    pub fn force_close(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.consecutive_successes = 0;
        inner.opened_until = None;
        inner.trial_in_flight = false;
        inner.recovery.reset();
    }

    /// Point-in-time snapshot for telemetry.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            health_score: inner.health_score,
            adaptive_threshold: inner.adaptive_threshold,
        }
    }

    /// Current health score.
    #[must_use]
    pub fn health_score(&self) -> f64 {
        self.lock().health_score
    }

    /// Time of the most recent failure.
    #[must_use]
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.lock().last_failure_at
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abort_trial();
        }
    }
}

/// Named breakers resolved at runtime, fresh instances in tests.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create a registry whose breakers share `config`.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Resolve or create the breaker with this name.
    #[must_use]
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(&existing);
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Resolve an existing breaker.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(&b))
    }

    /// Push a health update into every breaker (S3's periodic feedback).
    pub fn update_health_all(&self, system_health: f64, error_rate: f64) {
        for entry in &self.breakers {
            entry.value().update_health(system_health, error_rate);
        }
    }

    /// Snapshots of every breaker, for the telemetry plane.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|e| e.value().snapshot()).collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
