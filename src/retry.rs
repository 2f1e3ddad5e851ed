use log::{debug, warn};
use rand::random;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{Result, StressError};

/// Configuration for retry behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts
    pub max_attempts: usize,

    /// Initial delay before first retry in milliseconds
    pub initial_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_factor: f64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,

    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            backoff_factor: 1.5,
            max_delay_ms: 30_000, // 30 seconds
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that tries exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next_ms = ((delay.as_millis() as f64 * self.backoff_factor) as u64).min(self.max_delay_ms);
        if self.jitter {
            Duration::from_millis(next_ms + random::<u64>() % 100)
        } else {
            Duration::from_millis(next_ms)
        }
    }
}

/// Execute a future with retry logic
pub async fn execute_with_retry<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<T, E>> + Send,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;
    let mut delay = Duration::from_millis(config.initial_delay_ms);

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempts += 1;

                if attempts >= max_attempts {
                    return Err(StressError::retry(context, attempts, err));
                }

                warn!("{} (attempt {}/{}): {}", context, attempts, max_attempts, err);

                sleep(delay).await;
                delay = config.next_delay(delay);

                debug!("Retrying after {:?} delay", delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            backoff_factor: 1.0,
            max_delay_ms: 1,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = &AtomicUsize::new(0);
        let result = execute_with_retry(
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StressError::Connection("refused".to_string()))
                } else {
                    Ok(7)
                }
            },
            &fast(),
            "probe",
        )
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicUsize::new(0);
        let err = execute_with_retry(
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StressError::Connection("refused".to_string()))
            },
            &fast(),
            "probe",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StressError::Retry { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_tries_once() {
        let calls = &AtomicUsize::new(0);
        let _ = execute_with_retry(
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StressError::Connection("refused".to_string()))
            },
            &RetryConfig::no_retry(),
            "probe",
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
