//! Async driver for [`RetryPolicy`].

use std::future::Future;

use imirror_core::error::{MirrorError, Result};
use imirror_core::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;

/// Run `op` until it succeeds, fails permanently, exhausts the policy, or
/// the run is cancelled.
///
/// `op` receives the 1-based attempt number. Cancellation interrupts both
/// an in-flight attempt and a backoff sleep and yields
/// [`MirrorError::Cancelled`].
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
            result = op(attempt) => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !policy.should_retry(attempt, &err) {
            if attempt > 1 {
                tracing::warn!(what, attempt, error = %err, "Giving up");
            }
            return Err(err);
        }

        let delay = policy.delay_for(attempt, err.retry_after(), rand::random::<f64>());
        tracing::warn!(
            what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imirror_core::error::PullFailure;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn transient() -> MirrorError {
        MirrorError::PullFailed {
            reference: "docker.io/library/nginx:1.27.3".to_string(),
            arch: "amd64".to_string(),
            cause: PullFailure::Transient("connection reset".to_string()),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&RetryPolicy::immediate(3), &CancellationToken::new(), "pull", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&RetryPolicy::immediate(2), &CancellationToken::new(), "pull", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&RetryPolicy::immediate(5), &CancellationToken::new(), "tags", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(MirrorError::RegistryError {
                    repository: "library/nginx".to_string(),
                    status: 404,
                    message: "not found".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(MirrorError::RegistryError { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<()> = tokio::time::timeout(
            Duration::from_secs(5),
            retry(&policy, &cancel, "pull", |_| async { Err(transient()) }),
        )
        .await
        .expect("cancellation should interrupt the backoff sleep");

        assert!(matches!(result, Err(MirrorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<u32> = retry(&RetryPolicy::immediate(3), &cancel, "pull", |_| async {
            std::future::pending::<Result<u32>>().await
        })
        .await;
        assert!(matches!(result, Err(MirrorError::Cancelled)));
    }
}
