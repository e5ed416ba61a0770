use std::future::Future;
use std::time::Duration;

use stowage_types::{Result, StowageError};

/// Exponential-backoff retry policy for ledger calls.
///
/// `base_delay` doubles per attempt and is capped at `max_delay`, with up to
/// one `base_delay` of random jitter added on top.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Batch writes: 5 attempts, 2 s base, 10 s cap.
    pub fn batch() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Individual writes and reads: 3 attempts, 1 s base, 10 s cap.
    pub fn single() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Fast policy for tests.
    #[doc(hidden)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    /// Backoff delay before attempt `attempt` (1-based; attempt 0 never sleeps).
    fn delay_before(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_ms = if self.base_delay.as_millis() > 0 {
            rand::random::<u64>() % self.base_delay.as_millis() as u64
        } else {
            0
        };
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Run `f` under `policy`, retrying transient errors with exponential backoff.
///
/// Permanent errors (validation, not-found, integrity) return immediately.
/// Exhaustion maps to [`StowageError::RetryExhausted`] carrying the final
/// transient error.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, op_name: &'static str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err: Option<StowageError> = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.delay_before(attempt)).await;
        }
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    "transient ledger error, retrying: {e}"
                );
                last_err = Some(e);
            }
            Err(e) if e.is_retryable() => {
                return Err(StowageError::RetryExhausted {
                    op: op_name,
                    attempts: policy.max_attempts,
                    last_error: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    // Reachable only with max_attempts == 0; treat as exhaustion.
    Err(StowageError::RetryExhausted {
        op: op_name,
        attempts: policy.max_attempts,
        last_error: last_err.map(|e| e.to_string()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry(RetryPolicy::immediate(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StowageError>(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry(RetryPolicy::immediate(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StowageError::Connection("reset".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = retry(RetryPolicy::immediate(5), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StowageError::Validation("bad".into()))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_maps_to_retry_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = retry(RetryPolicy::immediate(3), "batch_write", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StowageError::LedgerUnavailable("down".into()))
            }
        })
        .await
        .unwrap_err();
        match err {
            StowageError::RetryExhausted { op, attempts, .. } => {
                assert_eq!(op, "batch_write");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };
        for attempt in 1..10 {
            let d = policy.delay_before(attempt);
            assert!(d <= Duration::from_secs(12), "attempt {attempt}: {d:?}");
        }
    }
}
