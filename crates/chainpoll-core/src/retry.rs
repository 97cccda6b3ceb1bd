//! Exponential backoff retry for chain client calls.
//!
//! Every client call made by the head tracker and the poller goes through
//! [`RetryPolicy::run`], which applies the per-call timeout and retries only
//! errors classified as transient.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PollerError;

/// Retry settings for client calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds (caps exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Fixed fraction of the capped backoff added to every delay
    /// (0.0 = none). The padding is deterministic, not random.
    pub backoff_padding: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            backoff_padding: 0.1,
        }
    }
}

impl RetryConfig {
    /// No retries at all; used for the fail-fast startup call.
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), PollerError> {
        if self.multiplier < 1.0 {
            return Err(PollerError::Config("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.backoff_padding) {
            return Err(PollerError::Config("retry.backoff_padding must be within [0, 1]".into()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(PollerError::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Stateless retry policy; computes the next delay given the attempt number.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based), or `None`
    /// once `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff_ms as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        let padding_ms = capped * self.config.backoff_padding;
        Some(Duration::from_millis((capped + padding_ms) as u64))
    }

    /// Runs `op` with a per-attempt `timeout`, retrying transient failures.
    ///
    /// A timed-out attempt counts as [`PollerError::TransientRpc`]. The last
    /// error is returned once retries are exhausted.
    pub async fn run<T, F, Fut>(&self, what: &str, timeout: Duration, mut op: F) -> Result<T, PollerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PollerError>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(timeout, op()).await {
                Ok(r) => r,
                Err(_) => Err(PollerError::TransientRpc(format!(
                    "{what} timed out after {}ms",
                    timeout.as_millis()
                ))),
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    match self.next_delay(attempt) {
                        Some(delay) => {
                            tracing::debug!(call = what, attempt, ?delay, error = %e, "retrying client call");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn unpadded(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
            backoff_padding: 0.0,
        })
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            multiplier: 2.0,
            backoff_padding: 0.0,
        });
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(300)));
        assert!(policy.next_delay(6).is_none());
    }

    #[test]
    fn padding_is_a_fixed_fraction_of_the_delay() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            backoff_padding: 0.5,
        });
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(150)));
        assert_eq!(policy.next_delay(1), policy.next_delay(1));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(300)));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad = RetryConfig { multiplier: 0.5, ..Default::default() };
        assert!(matches!(bad.validate(), Err(PollerError::Config(_))));
        let bad = RetryConfig { backoff_padding: 1.5, ..Default::default() };
        assert!(matches!(bad.validate(), Err(PollerError::Config(_))));
        assert!(RetryConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = unpadded(3)
            .run("test", Duration::from_secs(1), || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PollerError::TransientRpc("flaky".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<(), _> = unpadded(3)
            .run("test", Duration::from_secs(1), || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(PollerError::LimitExceeded("too many".into()))
                }
            })
            .await;
        assert!(matches!(out, Err(PollerError::LimitExceeded(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let out: Result<(), _> = unpadded(1)
            .run("slow", Duration::from_millis(5), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(out, Err(PollerError::TransientRpc(_))));
    }
}
