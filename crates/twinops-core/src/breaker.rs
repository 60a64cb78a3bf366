//! Circuit breaker for downstream endpoints.
//!
//! Wraps calls to a remote endpoint with fail-fast behavior: after a run
//! of consecutive failures the circuit opens and callers get an immediate
//! error instead of a hung request. After a recovery timeout a bounded
//! number of half-open probes may go through; enough successes close the
//! circuit again, any half-open failure reopens it.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

/// Error returned when the circuit rejects a call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakerError {
    /// The circuit is open; the endpoint is considered down.
    #[error("circuit open for {endpoint}, retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Endpoint the circuit guards.
        endpoint: String,
        /// Milliseconds until a half-open probe is allowed.
        retry_after_ms: u64,
    },

    /// All half-open probe slots are taken.
    #[error("circuit half-open for {endpoint}, probe slots exhausted")]
    ProbeLimit {
        /// Endpoint the circuit guards.
        endpoint: String,
    },
}

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// How long the circuit stays open before probing.
    pub recovery_timeout: Duration,

    /// Concurrent probes allowed in half-open, and the number of
    /// successes needed to close.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { in_flight: u32, successes: u32 },
}

/// A per-endpoint circuit breaker.
///
/// Callers bracket each request with [`CircuitBreaker::acquire`] and one
/// of [`CircuitBreaker::record_success`] / [`CircuitBreaker::record_failure`].
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for an endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Admits or rejects a call.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::CircuitOpen`] while the circuit is open
    /// and [`BreakerError::ProbeLimit`] when half-open probe slots are
    /// exhausted.
    pub fn acquire(&self) -> Result<(), BreakerError> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed { .. } => Ok(()),
            State::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.config.recovery_timeout {
                    info!(endpoint = %self.endpoint, "circuit half-open, probing");
                    *state = State::HalfOpen {
                        in_flight: 1,
                        successes: 0,
                    };
                    Ok(())
                } else {
                    let remaining = self.config.recovery_timeout - elapsed;
                    Err(BreakerError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                        retry_after_ms: remaining.as_millis() as u64,
                    })
                }
            },
            State::HalfOpen { in_flight, .. } => {
                if *in_flight >= self.config.half_open_max_calls {
                    Err(BreakerError::ProbeLimit {
                        endpoint: self.endpoint.clone(),
                    })
                } else {
                    *in_flight += 1;
                    Ok(())
                }
            },
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => *consecutive_failures = 0,
            State::HalfOpen {
                in_flight,
                successes,
            } => {
                *in_flight = in_flight.saturating_sub(1);
                *successes += 1;
                if *successes >= self.config.half_open_max_calls {
                    info!(endpoint = %self.endpoint, "circuit closed after recovery");
                    *state = State::Closed {
                        consecutive_failures: 0,
                    };
                }
            },
            State::Open { .. } => {},
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        endpoint = %self.endpoint,
                        failures = *consecutive_failures,
                        "circuit opened"
                    );
                    *state = State::Open {
                        since: Instant::now(),
                    };
                }
            },
            State::HalfOpen { .. } => {
                warn!(endpoint = %self.endpoint, "half-open probe failed, circuit reopened");
                *state = State::Open {
                    since: Instant::now(),
                };
            },
            State::Open { .. } => {},
        }
    }

    /// Whether the circuit currently admits calls without probing.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            &*self.state.lock().unwrap(),
            State::Closed { .. }
        )
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "http://twin:8081",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                half_open_max_calls: 2,
            },
        )
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = breaker(3, Duration::from_secs(30));

        for _ in 0..3 {
            breaker.acquire().unwrap();
            breaker.record_failure();
        }

        let err = breaker.acquire().unwrap_err();
        assert!(matches!(err, BreakerError::CircuitOpen { .. }));
    }

    #[test]
    fn test_success_resets_failure_run() {
        let breaker = breaker(3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        // Never three in a row, so still closed.
        breaker.acquire().unwrap();
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(breaker.acquire().is_err());

        std::thread::sleep(Duration::from_millis(20));

        // First probe admitted, limit bounds the rest.
        breaker.acquire().unwrap();
        breaker.acquire().unwrap();
        assert!(matches!(
            breaker.acquire().unwrap_err(),
            BreakerError::ProbeLimit { .. }
        ));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        breaker.acquire().unwrap();
        breaker.record_failure();

        assert!(matches!(
            breaker.acquire().unwrap_err(),
            BreakerError::CircuitOpen { .. }
        ));
    }

    #[test]
    fn test_half_open_successes_close() {
        let breaker = breaker(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        breaker.acquire().unwrap();
        breaker.record_success();
        breaker.acquire().unwrap();
        breaker.record_success();

        assert!(breaker.is_closed());
    }
}
