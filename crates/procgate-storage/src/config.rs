//! Runtime configuration for the procedure executor.
//!
//! Every tunable has a default, an environment override, and a `validate()`
//! that rejects degenerate values at startup.

use std::time::Duration;

/// Default command timeout per statement.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Default timeout for a whole transaction scope.
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u64 = 60;

/// Retry defaults.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 50;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 2_000;
pub const DEFAULT_RETRY_JITTER_MS: u64 = 25;

/// Circuit breaker defaults.
pub const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
pub const DEFAULT_CIRCUIT_BREAKER_RESET_SECS: u64 = 30;

/// Executor configuration.
///
/// # Environment Variables
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `PROCGATE_COMMAND_TIMEOUT_SECS` | 30 | Per-statement timeout |
/// | `PROCGATE_TRANSACTION_TIMEOUT_SECS` | 60 | Whole-scope timeout |
/// | `PROCGATE_RETRY_MAX_ATTEMPTS` | 3 | Attempts incl. the first |
/// | `PROCGATE_RETRY_BASE_DELAY_MS` | 50 | First backoff delay |
/// | `PROCGATE_RETRY_MAX_DELAY_MS` | 2000 | Backoff cap |
/// | `PROCGATE_RETRY_JITTER_MS` | 25 | Max random jitter per delay |
/// | `PROCGATE_CIRCUIT_BREAKER_THRESHOLD` | 5 | Failures before circuit opens |
/// | `PROCGATE_CIRCUIT_BREAKER_RESET_SECS` | 30 | Cool-down before half-open |
/// | `PROCGATE_CIRCUIT_BREAKER_ENABLED` | true | Enable circuit breaker |
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Timeout applied to every statement; the statement is interrupted on
    /// expiry.
    pub command_timeout: Duration,

    /// Timeout applied to a whole transaction scope.
    pub transaction_timeout: Duration,

    /// Retry policy for transient failures.
    pub retry: RetryConfig,

    /// Circuit breaker configuration.
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Bounded exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first. 1 disables retry.
    pub max_attempts: u32,

    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

/// Circuit breaker configuration.
///
/// After `failure_threshold` consecutive failures the circuit opens and
/// calls are short-circuited for `reset_timeout`, after which one probe is
/// allowed through (half-open).
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            jitter: Duration::from_millis(DEFAULT_RETRY_JITTER_MS),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_CIRCUIT_BREAKER_RESET_SECS),
            enabled: true,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            transaction_timeout: Duration::from_secs(DEFAULT_TRANSACTION_TIMEOUT_SECS),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Create configuration from environment variables, falling back to
    /// defaults for any unset variable.
    pub fn from_env() -> Self {
        Self {
            command_timeout: Duration::from_secs(env_parse(
                "PROCGATE_COMMAND_TIMEOUT_SECS",
                DEFAULT_COMMAND_TIMEOUT_SECS,
            )),
            transaction_timeout: Duration::from_secs(env_parse(
                "PROCGATE_TRANSACTION_TIMEOUT_SECS",
                DEFAULT_TRANSACTION_TIMEOUT_SECS,
            )),
            retry: RetryConfig {
                max_attempts: env_parse("PROCGATE_RETRY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
                base_delay: Duration::from_millis(env_parse(
                    "PROCGATE_RETRY_BASE_DELAY_MS",
                    DEFAULT_RETRY_BASE_DELAY_MS,
                )),
                max_delay: Duration::from_millis(env_parse(
                    "PROCGATE_RETRY_MAX_DELAY_MS",
                    DEFAULT_RETRY_MAX_DELAY_MS,
                )),
                jitter: Duration::from_millis(env_parse(
                    "PROCGATE_RETRY_JITTER_MS",
                    DEFAULT_RETRY_JITTER_MS,
                )),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env_parse(
                    "PROCGATE_CIRCUIT_BREAKER_THRESHOLD",
                    DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
                ),
                reset_timeout: Duration::from_secs(env_parse(
                    "PROCGATE_CIRCUIT_BREAKER_RESET_SECS",
                    DEFAULT_CIRCUIT_BREAKER_RESET_SECS,
                )),
                enabled: env_parse("PROCGATE_CIRCUIT_BREAKER_ENABLED", true),
            },
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.command_timeout.is_zero() {
            return Err("command_timeout must be > 0".to_string());
        }
        if self.transaction_timeout < self.command_timeout {
            return Err("transaction_timeout must be >= command_timeout".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".to_string());
        }
        if self.retry.base_delay.is_zero() {
            return Err("retry.base_delay must be > 0".to_string());
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err("retry.max_delay must be >= retry.base_delay".to_string());
        }
        if self.circuit_breaker.enabled {
            if self.circuit_breaker.failure_threshold == 0 {
                return Err("circuit_breaker.failure_threshold must be > 0".to_string());
            }
            if self.circuit_breaker.reset_timeout.is_zero() {
                return Err("circuit_breaker.reset_timeout must be > 0".to_string());
            }
        }
        Ok(())
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker.enabled = false;
        self
    }
}

/// Parse an environment variable with a default fallback.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
