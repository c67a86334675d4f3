//! Bounded exponential backoff for remote writes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped
    /// at `max_delay_ms`. Delays rise strictly until the cap, then hold.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(retry));
        Duration::from_millis(exp.min(self.max_delay_ms.max(self.base_delay_ms)))
    }

    /// Policy that never waits or retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

/// Last error of an operation that never succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub error: StoreError,
    /// Total attempts made, including the first.
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
///
/// Only transient errors (see [`StoreError::is_transient`]) are retried.
/// `op` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = label, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if error.is_transient() && attempt <= policy.max_retries => {
                let delay = policy.delay(attempt - 1);
                warn!(
                    op = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                })
            }
        }
    }
}
