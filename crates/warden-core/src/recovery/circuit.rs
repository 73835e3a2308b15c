//! Circuit breaker for operations bound to one external dependency.
//!
//! Tracks consecutive failures against a threshold. Once crossed, the
//! circuit flips open and rejects calls immediately for a cooldown period —
//! a distinguishable [`CircuitError::Open`] error, so monitoring can tell
//! "dependency is down" apart from "request failed". After the cooldown one
//! trial call runs half-open: success closes the circuit, failure reopens
//! it.
//!
//! ```text
//! Closed --threshold consecutive failures--> Open
//! Open   --cooldown elapsed--> HalfOpen (one trial)
//! HalfOpen --trial succeeds--> Closed
//! HalfOpen --trial fails-----> Open
//! ```

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RecoveryConfig;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// One trial call is in flight.
    HalfOpen,
}

/// Error from a breaker-guarded call.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the dependency is treated as down and the call
    /// never ran.
    #[error("circuit {name} is open; failing fast")]
    Open {
        /// The breaker's name.
        name: String,
    },

    /// The call ran and failed; the failure counted against the threshold.
    #[error("dependency call failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Stateful guard around calls to one external dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker named after the dependency it guards.
    #[must_use]
    pub fn new(name: impl Into<String>, config: &RecoveryConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold,
            cooldown: Duration::from_millis(config.cooldown_ms),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Current state, transitioning `Open → HalfOpen` is *not* performed by
    /// observation; only a call does that.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Runs `operation` through the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Open`] without running the operation while the
    /// circuit is open (or a half-open trial is already in flight), or
    /// [`CircuitError::Inner`] when the operation ran and failed.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.admit()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Like [`CircuitBreaker::call`], but an open circuit yields the
    /// registered fallback value instead of an error.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Inner`] when the operation ran and failed.
    pub async fn call_with_fallback<T, E, F, Fut, FB>(
        &self,
        operation: F,
        fallback: FB,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
    {
        match self.call(operation).await {
            Err(CircuitError::Open { .. }) => {
                debug!(circuit = %self.name, "open circuit served fallback");
                Ok(fallback())
            }
            other => other,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Decides whether a call may proceed, taking the half-open trial slot
    /// when the cooldown has elapsed.
    fn admit<E>(&self) -> Result<(), CircuitError<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                // A trial is already in flight; reject everyone else.
                Err(CircuitError::Open {
                    name: self.name.clone(),
                })
            }
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.cooldown);
                if cooled_down {
                    debug!(circuit = %self.name, "cooldown elapsed, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(CircuitError::Open {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            debug!(circuit = %self.name, "trial call succeeded, closing circuit");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(circuit = %self.name, "trial call failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold crossed, opening circuit"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }
}
