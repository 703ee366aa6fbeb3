//! # Circuit Breaker
//!
//! Guards connection attempts: after three consecutive failures the breaker
//! opens and refuses further attempts until a recovery timeout elapses,
//! then allows a single probe attempt (half-open). Two successes in
//! half-open close it again; one failure re-opens it.
//!
//! The breaker is touched from user threads as well as the connection
//! driver, so its state sits behind a short critical section.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Consecutive failures that open the breaker.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Half-open successes that close it again.
pub const SUCCESS_THRESHOLD: u32 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

/// The breaker itself. One per connection, shared by reference.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    /// `recovery_timeout` is conventionally twice the connect timeout.
    pub fn new(recovery_timeout: Duration) -> Self {
        CircuitBreaker {
            inner: Mutex::new(Inner::Closed { failures: 0 }),
            recovery_timeout,
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.inner.lock().expect("breaker lock") {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Gate an attempt: `Ok` admits it, `Err(CircuitOpen)` refuses. An
    /// open breaker whose recovery timeout has elapsed admits one probe by
    /// moving to half-open.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match &*inner {
            Inner::Closed { .. } | Inner::HalfOpen { .. } => Ok(()),
            Inner::Open { since } => {
                if since.elapsed() >= self.recovery_timeout {
                    debug!("circuit breaker recovery timeout elapsed, probing");
                    *inner = Inner::HalfOpen { successes: 0 };
                    Ok(())
                } else {
                    Err(Error::CircuitOpen)
                }
            }
        }
    }

    /// Record a successful attempt.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match &mut *inner {
            Inner::Closed { failures } => *failures = 0,
            Inner::HalfOpen { successes } => {
                *successes += 1;
                if *successes >= SUCCESS_THRESHOLD {
                    debug!("circuit breaker closed after successful probes");
                    *inner = Inner::Closed { failures: 0 };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match &mut *inner {
            Inner::Closed { failures } => {
                *failures += 1;
                if *failures >= FAILURE_THRESHOLD {
                    warn!(
                        failures = *failures,
                        "circuit breaker opened after consecutive failures"
                    );
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                }
            }
            Inner::HalfOpen { .. } => {
                warn!("probe attempt failed, circuit breaker re-opened");
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Forget all failure history; used by manual resets.
    pub fn reset(&self) {
        *self.inner.lock().expect("breaker lock") = Inner::Closed { failures: 0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.check(), Err(Error::CircuitOpen)));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_recovery_then_closes_on_successes() {
        let breaker = CircuitBreaker::new(Duration::from_millis(0));
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        // Zero recovery timeout: the next check admits a probe.
        breaker.check().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(Duration::from_millis(0));
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        breaker.check().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn reset_clears_everything() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure();
        }
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.check().unwrap();
    }
}
