//! Backoff retry for operations that allocate order numbers.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::api::Metrics;
use crate::contracts::TrackerError;

/// Configuration for retrying whole operations with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try.
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 20,
            max_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    /// Creates a RetryConfig from environment variables.
    ///
    /// Environment variables:
    /// - `INVTRACK_ORDER_MAX_RETRIES`: Maximum retry attempts (default: 3)
    /// - `INVTRACK_ORDER_RETRY_INITIAL_MS`: Initial backoff delay in ms (default: 20)
    /// - `INVTRACK_ORDER_RETRY_MAX_MS`: Maximum backoff delay in ms (default: 500)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_retries: std::env::var("INVTRACK_ORDER_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_retries),
            initial_delay_ms: std::env::var("INVTRACK_ORDER_RETRY_INITIAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.initial_delay_ms),
            max_delay_ms: std::env::var("INVTRACK_ORDER_RETRY_MAX_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_delay_ms),
        }
    }

    /// Creates an exponential backoff builder with jitter.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent. Each attempt must be safe to repeat.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    context: &str,
    metrics: &Metrics,
    operation: F,
) -> Result<T, TrackerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TrackerError>>,
{
    operation
        .retry(config.backoff())
        .when(TrackerError::is_retryable)
        .notify(|err, dur| {
            metrics.record_retry();
            tracing::warn!(
                context = %context,
                error = %err,
                retry_in = ?dur,
                "Operation failed, retrying"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::contracts::{GenerationFailure, StorageError};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay_ms, 20);
        assert_eq!(config.max_delay_ms, 500);
    }

    #[tokio::test]
    async fn retries_lock_timeouts_until_success() {
        let metrics = Metrics::new();
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let result = with_retry(&fast(), "test", &metrics, move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TrackerError::OrderNumber(GenerationFailure::LockTimeout(
                    "busy".into(),
                )))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.order_retries_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let metrics = Metrics::new();
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let result: Result<(), _> = with_retry(&fast(), "test", &metrics, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TrackerError::Storage(StorageError::Conflict("locked".into())))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let metrics = Metrics::new();
        let counter = AtomicUsize::new(0);
        let attempts = &counter;

        let result: Result<(), _> = with_retry(&fast(), "test", &metrics, move || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TrackerError::OrderNumber(GenerationFailure::Overflow))
        })
        .await;

        assert!(matches!(
            result,
            Err(TrackerError::OrderNumber(GenerationFailure::Overflow))
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
