//! Consecutive-failure circuit breaker.
//!
//! After the configured number of consecutive infrastructure failures the
//! circuit opens: calls are short-circuited with a fixed
//! service-unavailable classification instead of repeatedly invoking a
//! failing database. After the cool-down one probe call is allowed through
//! (half-open); its outcome closes or re-opens the circuit.

use std::sync::Mutex;
use std::time::Instant;

use procgate_core::{GateError, Result};
use procgate_storage::CircuitBreakerConfig;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// The only shared mutable state across invocations.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Gate a call. While the circuit is open and the cool-down has not
    /// elapsed, fails fast; once it has elapsed, lets one probe through in
    /// the half-open state.
    pub fn check(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    info!("Circuit breaker half-open, allowing probe call");
                    inner.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(GateError::circuit_open(inner.consecutive_failures))
                }
            }
        }
    }

    /// Record a successful call: the circuit closes and the failure count
    /// resets.
    pub fn on_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker closed after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record an infrastructure failure. A failed half-open probe re-opens
    /// immediately.
    pub fn on_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if should_open && inner.state != CircuitState::Open {
            warn!(
                consecutive_failures = inner.consecutive_failures,
                reset_secs = self.config.reset_timeout.as_secs(),
                "Circuit breaker opened"
            );
        }
        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock poisoned")
            .state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: reset,
            enabled: true,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, Duration::from_secs(30));
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());

        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        let err = cb.check().unwrap_err();
        assert_eq!(err.code(), "database");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(3, Duration::from_secs(30));
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        // Still below threshold because of the intervening success
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_after_cooldown() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());

        std::thread::sleep(Duration::from_millis(20));
        // Cool-down elapsed: probe allowed
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = breaker(5, Duration::from_millis(10));
        for _ in 0..5 {
            cb.on_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // A single probe failure re-opens regardless of the threshold
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());
    }

    #[test]
    fn test_disabled_breaker_never_trips() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(30),
            enabled: false,
        });
        for _ in 0..10 {
            cb.on_failure();
        }
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
