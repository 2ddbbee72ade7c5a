//! Circuit breaker in front of the message bus.
//!
//! After `failure_threshold` consecutive bus failures the breaker opens and
//! sends fail fast without touching the broker. Once `recovery_timeout` has
//! passed since the last failure, sends are let through again as probes:
//! enough successes close it, one failure reopens it.
//!
//! Independently of the state, the breaker remembers when the current
//! failure streak began. [`CircuitBreaker::failure_span`] is what the
//! supervisor compares against its bus failure limit.
//!
//! | state     | send                         | leaves on                        |
//! |-----------|------------------------------|----------------------------------|
//! | Closed    | goes to the bus              | `failure_threshold` failures     |
//! | Open      | fails with `Open`            | `recovery_timeout` elapsed       |
//! | HalfOpen  | goes to the bus as a probe   | `success_threshold` ok, or 1 err |

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    /// Sends fail fast until the recovery timeout runs out.
    Open,
    /// Sends go through; the outcome decides between Closed and Open.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive bus failures that open the breaker.
    pub failure_threshold: u32,
    /// Successful probes needed to close it again.
    pub success_threshold: u32,
    /// Quiet period after the last failure before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    streak_started: Option<Instant>,
    last_failure: Option<Instant>,
    last_error: Option<String>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probe_successes: 0,
            streak_started: None,
            last_failure: None,
            last_error: None,
        }
    }
}

impl BreakerState {
    fn span(&self) -> Duration {
        match (self.streak_started, self.last_failure) {
            (Some(start), Some(last)) => last.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    fn end_streak(&mut self) {
        self.consecutive_failures = 0;
        self.streak_started = None;
    }
}

/// Snapshot of the breaker for logs and escalation messages.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
    pub failure_span: Duration,
}

#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Rejected without calling the bus.
    Open { name: String, retry_after: Duration },
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => write!(
                f,
                "{name} circuit is open, next probe in {}s",
                retry_after.as_secs()
            ),
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Breaker shared by every publish task; clones see the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(Mutex::new(BreakerState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the state, applying the Open -> HalfOpen transition if it is due.
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        let mut guard = self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        });
        if guard.state == CircuitState::Open
            && guard
                .last_failure
                .is_some_and(|t| t.elapsed() >= self.config.recovery_timeout)
        {
            tracing::info!(circuit = %self.name, "Recovery timeout elapsed, probing the bus");
            guard.state = CircuitState::HalfOpen;
            guard.probe_successes = 0;
        }
        guard
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Time from the first to the latest failure of the current streak.
    /// Zero once any send succeeds.
    pub fn failure_span(&self) -> Duration {
        self.lock().span()
    }

    fn until_probe(&self, state: &BreakerState) -> Duration {
        state
            .last_failure
            .map(|t| self.config.recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.config.recovery_timeout)
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.consecutive_failures,
            success_count: state.probe_successes,
            last_error: state.last_error.clone(),
            time_until_half_open: (state.state == CircuitState::Open)
                .then(|| self.until_probe(&state)),
            failure_span: state.span(),
        }
    }

    /// Run one bus operation unless the breaker is open.
    ///
    /// Only errors that [`AppError::should_trip_circuit`] count as failures;
    /// a rejected message says nothing about broker health.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        {
            let state = self.lock();
            if state.state == CircuitState::Open {
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after: self.until_probe(&state),
                });
            }
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.should_trip_circuit() {
                    self.record_failure(&e);
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => state.end_streak(),
            CircuitState::HalfOpen => {
                state.probe_successes += 1;
                if state.probe_successes >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        probes = state.probe_successes,
                        "Bus recovered, closing circuit"
                    );
                    state.state = CircuitState::Closed;
                    state.probe_successes = 0;
                    state.last_error = None;
                    state.end_streak();
                }
            }
            // A send that started before the breaker opened.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut state = self.lock();
        let now = Instant::now();
        if state.streak_started.is_none() {
            state.streak_started = Some(now);
        }
        state.last_error = Some(error.to_string());

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                state.last_failure = Some(now);
                if state.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = state.consecutive_failures,
                        error = %error,
                        "Bus failing, opening circuit"
                    );
                    state.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Probe failed, reopening circuit"
                );
                state.state = CircuitState::Open;
                state.last_failure = Some(now);
                state.probe_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}
