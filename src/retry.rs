//! Retry with exponential backoff for transient broker failures.
//!
//! Only errors for which [`Error::is_transient`] returns `true` are retried. Validation,
//! size, missing-resource and command errors are returned on the first attempt.
//!
//! ```text
//! attempt 1: immediate
//! attempt 2: wait initial_backoff
//! attempt 3: wait initial_backoff * multiplier
//! ...        capped at max_backoff
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::Error;

/// Backoff configuration.
///
/// `backoff(n) = min(initial_backoff * backoff_multiplier^n, max_backoff)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` means a single attempt.
    pub max_retries: usize,
    /// Wait before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single wait.
    pub max_backoff: Duration,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    /// 3 retries, 100 ms initial, 5 s cap, doubling.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy allowing `attempts` total attempts with the default backoff curve.
    pub fn with_attempts(attempts: usize) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::with_attempts(1)
    }

    /// Wait before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as usize) as i32);
        if !ms.is_finite() || ms >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(ms as u64)
    }
}

/// Run `operation` until it succeeds, fails permanently, or retries are exhausted.
///
/// Returns the last error when every attempt failed.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(what, attempts = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let wait = policy.backoff(attempt);
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = wait.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(60), Duration::from_secs(1));
    }

    #[test]
    fn with_attempts_counts_first_try() {
        assert_eq!(RetryPolicy::with_attempts(3).max_retries, 2);
        assert_eq!(RetryPolicy::none().max_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result = retry_with_backoff(&RetryPolicy::default(), "test", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Broker("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<(), Error> = retry_with_backoff(&RetryPolicy::default(), "test", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Command("WRONGTYPE".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(Error::Command(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let policy = RetryPolicy::with_attempts(3);
        let result: Result<(), Error> = retry_with_backoff(&policy, "test", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Broker("down".into()))
            }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
