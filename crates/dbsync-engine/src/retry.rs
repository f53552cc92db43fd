//! Retry operator for reads travelling through the tunnel
//!
//! Scope is exactly one read call: the closure is re-run from scratch on
//! failure. Writes to the target are never retried.

use std::future::Future;
use std::time::Duration;

use dbsync_core::Result;

/// Attempt count and base delay for tunnel reads
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: base_delay * attempt
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Run `op` until it succeeds or the policy is exhausted, returning the last
/// error.
pub async fn retry_read<T, F, Fut>(policy: RetryPolicy, label: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                tracing::warn!(
                    label,
                    attempt,
                    attempts,
                    error = %error,
                    "remote read failed"
                );
                last_error = Some(error);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }

    Err(last_error.expect("at least one attempt ran"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbsync_core::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry_read(quick_policy(), "probe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, SyncError>(7) }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_read(quick_policy(), "probe", || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(SyncError::Query("connection reset".into()))
                } else {
                    Ok(call)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_read(quick_policy(), "probe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::Query("still down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
