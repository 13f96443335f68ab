//! Retry utilities for resilient operations
//!
//! [`BackoffPolicy`] drives work-item requeues in the scheduler;
//! [`with_retry`] wraps short operations such as connecting to the shared store.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ErrorClass, Result};

/// Capped exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with custom attempts and delays
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            multiplier: 2.0,
        }
    }

    /// Delay before the retry that follows `failed_attempts` failures.
    ///
    /// `delay_for(1)` is the base delay, each further failure multiplies it.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = (failed_attempts - 1).min(i32::MAX as u32) as i32;
        let exponential = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let delay_ms = if exponential.is_finite() {
            (exponential as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        };
        Duration::from_millis(delay_ms)
    }

    /// Whether another attempt is allowed after `failed_attempts` failures
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }
}

/// Execute an operation, retrying recoverable errors with backoff.
///
/// Non-recoverable errors are returned immediately.
pub async fn with_retry<T, F, Fut>(policy: &BackoffPolicy, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if failures > 0 {
                    debug!(failures, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_recoverable() => {
                failures += 1;
                if !policy.should_retry(failures) {
                    warn!(attempts = failures, error = %e, "Retries exhausted");
                    return Err(e);
                }
                let delay = policy.delay_for(failures);
                warn!(
                    attempt = failures,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(error = %e, "Non-retryable error encountered");
                return Err(e);
            }
        }
    }
}
