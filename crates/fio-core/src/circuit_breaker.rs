//! Circuit breaker guarding each lookup service.
//!
//! After `failure_threshold` consecutive failures the circuit opens and calls
//! are rejected without touching the network. Once `reset_timeout` has passed
//! a single probe is let through (half-open); its result closes or reopens
//! the circuit.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls proceed normally
    Closed,
    /// Calls are rejected
    Open,
    /// One probe call is in flight
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker.
    ///
    /// A threshold of zero disables the breaker.
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed now.
    pub fn try_acquire(&self) -> bool {
        if self.failure_threshold == 0 {
            return true;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            // A probe that never reported back (cancelled call) is replaced
            // once another reset_timeout has passed.
            CircuitState::Open | CircuitState::HalfOpen => {
                let expired = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = Some(Instant::now());
                    info!(service = %self.name, "Circuit half-open, probing service");
                }
                expired
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(service = %self.name, "Circuit closed, service recovered");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        if self.failure_threshold == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                service = %self.name,
                failures = inner.consecutive_failures,
                reset_after_ms = self.reset_timeout.as_millis() as u64,
                "Circuit opened"
            );
        } else {
            debug!(
                service = %self.name,
                failures = inner.consecutive_failures,
                threshold = self.failure_threshold,
                "Circuit recorded failure"
            );
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("age", 3, Duration::from_secs(30));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = CircuitBreaker::new("gender", 2, Duration::from_secs(30));

        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_or_reopens() {
        let cb = CircuitBreaker::new("nationality", 1, Duration::from_millis(10));

        cb.record_failure();
        assert!(!cb.try_acquire());

        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // only one probe at a time
        assert!(!cb.try_acquire());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.try_acquire());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[test]
    fn test_zero_threshold_disables() {
        let cb = CircuitBreaker::new("age", 0, Duration::from_secs(30));
        for _ in 0..10 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }
}
