//! Bounded-wait helper.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| {
            debug!(?timeout, "Operation timed out");
            crate::SwCacheError::Timeout(timeout)
        })
}

/// Run an operation, bounded only when a timeout is given.
pub async fn maybe_with_timeout<T, F, Fut>(timeout: Option<Duration>, operation: F) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    match timeout {
        Some(timeout) => with_timeout(timeout, operation).await,
        None => Ok(operation().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_timeout() {
        let result = with_timeout(Duration::from_millis(10), || async {
            sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(crate::SwCacheError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_completes_within_timeout() {
        let result = with_timeout(Duration::from_secs(1), || async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_unbounded_when_no_timeout() {
        let result = maybe_with_timeout(None, || async {
            sleep(Duration::from_millis(5)).await;
            "done"
        })
        .await;
        assert_eq!(result.unwrap(), "done");
    }
}
