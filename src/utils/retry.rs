//! Retry utilities: backoff builders and transient-error retry loops.
//!
//! Uses `backon` for exponential backoff with jitter. Only errors that
//! report themselves transient are retried; everything else surfaces on the
//! first attempt. [`bounded`] caps a single store call; a call that outlives
//! its deadline fails transiently and is retried like any other.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use crate::error::SyncError;
use crate::storage::StorageError;

/// Backoff for transient I/O against the source, the store or exporters.
///
/// - Min delay: 10ms
/// - Max delay: 2s
/// - Max attempts: `ceiling` retries after the first call
/// - Jitter enabled
pub fn transient_backoff(ceiling: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(ceiling)
        .with_jitter()
}

/// Outcome of a retried call and how many retries it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, SyncError>,
    pub retries: u32,
}

/// Run `op` until it succeeds, fails permanently, or `ceiling` retries of
/// transient failures are spent.
pub async fn retry_transient<T, F, Fut>(what: &str, ceiling: usize, op: F) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut retries = 0u32;
    let result = op
        .retry(transient_backoff(ceiling))
        .when(|e: &SyncError| e.is_transient())
        .notify(|e: &SyncError, delay: Duration| {
            retries += 1;
            warn!(operation = what, retry = retries, ?delay, error = %e, "Transient failure, retrying");
        })
        .await;
    Retried { result, retries }
}

/// Bound one store call by `timeout`; elapsing is a transient storage error.
pub async fn bounded<T, Fut>(timeout: Duration, what: &str, call: Fut) -> Result<T, StorageError>
where
    Fut: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Transient(format!(
            "{} exceeded {:?}",
            what, timeout
        ))),
    }
}
