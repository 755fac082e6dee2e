//! Exponential backoff for farm requests.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{FarmError, Result};

#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Consecutive transient failures tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl Backoff {
    /// Next delay after `current`, clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }

    /// Wait before the next round of a polling loop that has seen
    /// `failures` transient errors in a row: `base` while healthy, growing
    /// by `multiplier` per failure up to `max_delay` (or `base`, whichever
    /// is longer).
    pub fn poll_delay(&self, base: Duration, failures: u32) -> Duration {
        let cap = self.max_delay.max(base);
        let mut delay = base;
        for _ in 0..failures {
            if delay >= cap {
                break;
            }
            delay = Duration::from_millis((delay.as_millis() as f64 * self.multiplier) as u64);
        }
        delay.min(cap)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or
    /// has failed `max_attempts` times in a row. Exhausting the attempts
    /// yields [`FarmError::NodeOffline`].
    pub async fn retry<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };
            if attempt >= self.max_attempts {
                tracing::warn!(what, attempts = attempt, error = %err, "Giving up on farm request");
                return Err(FarmError::NodeOffline(format!(
                    "{} failed {} times: {}",
                    what, attempt, err
                )));
            }
            tracing::debug!(
                what,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Farm request failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.next_delay(delay);
        }
    }
}
