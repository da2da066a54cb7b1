//! Per-backend circuit breakers for the JavaScript rendering chain
//!
//! Each rendering backend is guarded by its own breaker so a failing remote
//! service cannot burn the latency budget of every audit: while a breaker is
//! open, calls short-circuit immediately to the next fallback.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Externally observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through; consecutive failures are counted.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// One trial call is admitted to probe recovery.
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: usize },
    Open { since: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: usize,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
            failure_threshold,
            cooldown,
        }
    }

    /// Whether a call may proceed. Transitions `Open -> HalfOpen` once the
    /// cooldown has elapsed, admitting exactly one trial call; further callers
    /// are rejected until the trial resolves via `record_success` or
    /// `record_failure`.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match *inner {
            Inner::Closed { .. } => true,
            Inner::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    *inner = Inner::HalfOpen {
                        trial_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            Inner::HalfOpen {
                ref mut trial_in_flight,
            } => {
                if *trial_in_flight {
                    false
                } else {
                    *trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                } else {
                    *inner = Inner::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            Inner::HalfOpen { .. } => {
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            // A failure report while already open keeps the cooldown running
            // from the original trip.
            Inner::Open { .. } => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        match *self.inner.lock().unwrap() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> usize {
        match *self.inner.lock().unwrap() {
            Inner::Closed {
                consecutive_failures,
            } => consecutive_failures,
            _ => self.failure_threshold,
        }
    }
}
