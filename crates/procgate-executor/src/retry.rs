//! Bounded exponential backoff for transient failures.
//!
//! Retry is transparent only when the failure is classified transient AND
//! the procedure is registered idempotent. A transient failure on a
//! non-idempotent write surfaces after the first attempt rather than
//! guessing whether the write took effect.

use std::time::Duration;

use procgate_core::GateError;
use procgate_storage::RetryConfig;
use rand::Rng;

/// Whether another attempt should be made after a failure.
pub fn should_retry(
    config: &RetryConfig,
    idempotent: bool,
    error: &GateError,
    attempt: u32,
) -> bool {
    idempotent && error.is_transient() && attempt < config.max_attempts
}

/// Delay before the retry following `attempt` (1-based): exponential from
/// the base, capped, plus uniform random jitter.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let scaled = config
        .base_delay
        .saturating_mul(2u32.saturating_pow(exponent));
    let capped = scaled.min(config.max_delay);

    let jitter_ms = config.jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return capped;
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
    capped + Duration::from_millis(jitter)
}
