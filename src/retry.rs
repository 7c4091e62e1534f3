// ABOUTME: Explicit retry policy value for I/O calls against the source and destination
// ABOUTME: Bounded exponential backoff with jitter, a retryable-error predicate, and per-attempt timeouts

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Endpoint, Result, SyncError};

/// How a failing call is retried.
///
/// The policy is a plain value handed to whoever performs the I/O, so the
/// call sites do not hard-code attempt counts or delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Must be at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub base_delay: Duration,
    /// Upper bound for a single backoff sleep.
    pub max_delay: Duration,
    /// Per-attempt deadline. Elapsing it counts as a transient failure.
    pub attempt_timeout: Option<Duration>,
    /// Decides whether an error is worth another attempt.
    pub retryable: fn(&SyncError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Some(Duration::from_secs(300)),
            retryable: SyncError::is_transient,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    ///
    /// `base * 2^(attempt-1)`, capped at `max_delay`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt cap is reached.
    ///
    /// Non-retryable errors surface immediately and unchanged. When retries
    /// run out, the last error is returned wrapped in
    /// [`SyncError::Unavailable`] for `endpoint`.
    pub async fn run<F, Fut, T>(&self, endpoint: Endpoint, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::transient(
                        endpoint,
                        format!("{} timed out after {:?}", what, limit),
                    )),
                },
                None => operation().await,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !(self.retryable)(&err) {
                return Err(err);
            }

            if attempt >= max_attempts {
                tracing::error!(
                    "{} failed after {} attempts: {}",
                    what,
                    attempt,
                    err
                );
                return Err(SyncError::Unavailable {
                    endpoint,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.with_jitter(self.backoff(attempt));
            tracing::warn!(
                "{} failed (attempt {}/{}): {}, retrying in {:?}...",
                what,
                attempt,
                max_attempts,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() as u64 / 10).max(1);
        let extra = rand::thread_rng().gen_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max_delay.max(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            attempt_timeout: None,
            retryable: SyncError::is_transient,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(5)
            .run(Endpoint::Source, "fetch", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(SyncError::transient(Endpoint::Source, "connection reset"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast_policy(5)
            .run(Endpoint::Source, "fetch", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(SyncError::Source(
                        "You have an error in your SQL syntax".to_string(),
                    ))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Source(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast_policy(3)
            .run(Endpoint::Source, "fetch", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(SyncError::transient(Endpoint::Source, format!("reset #{}", n))) }
            })
            .await;

        match result {
            Err(SyncError::Unavailable {
                endpoint,
                attempts,
                last,
            }) => {
                assert_eq!(endpoint, Endpoint::Source);
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("reset #3"));
            }
            other => panic!("expected Unavailable, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_transient() {
        let policy = RetryPolicy {
            attempt_timeout: Some(Duration::from_millis(10)),
            ..fast_policy(2)
        };
        let result: Result<()> = policy
            .run(Endpoint::Source, "fetch", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(SyncError::Unavailable { attempts: 2, .. })
        ));
    }
}
