//! Exponential backoff for transient storage failures

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RegistryResult;

/// A policy for retrying an operation with exponential backoff
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Backoff {
    /// How many times to try in total, including the first attempt
    pub attempts: u32,

    /// The delay before the first retry, in milliseconds
    pub delay_ms: u64,

    /// The factor the delay grows by after each retry
    pub exponent: u32,

    /// The longest delay to wait between attempts, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 100,
            exponent: 2,
            max_delay_ms: 5_000,
        }
    }
}

impl Backoff {
    /// A policy which never retries
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// The delay before retry number `retry` (zero-based), capped at the maximum
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = u64::from(self.exponent.max(1)).saturating_pow(retry);
        Duration::from_millis(self.delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails with an error that is not retryable,
    /// or runs out of attempts.
    ///
    /// `op` must be safe to repeat from scratch.
    pub async fn retry<F, Fut, T>(&self, mut op: F) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RegistryResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    let delay = self.delay(attempt - 1);
                    tracing::warn!(attempt, ?delay, "retrying after transient error: {err}");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}
