//! Circuit breaker guarding calls to unreliable external services.
//!
//! After `failure_threshold` consecutive failures the breaker opens and calls
//! are rejected without touching the network until `reset_timeout` elapses.
//! The next call is then let through as a probe; success closes the breaker,
//! failure re-opens it.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Runs `f` unless the breaker is open, in which case the call fails fast
    /// with `CarrierError`.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        if !self.try_acquire() {
            return Err(ServiceError::CarrierError(format!(
                "{} is unavailable (circuit open)",
                self.name
            )));
        }

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    state.state = CircuitState::HalfOpen;
                }
                elapsed
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.lock();
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    fn on_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        let trip = state.state == CircuitState::HalfOpen
            || state.consecutive_failures >= self.failure_threshold;
        if trip && state.state != CircuitState::Open {
            warn!(
                breaker = self.name,
                failures = state.consecutive_failures,
                "Circuit breaker opened"
            );
            state.state = CircuitState::Open;
            state.opened_at = Some(Instant::now());
        }
    }
}
