//! Shared retry and timeout plumbing for external calls.
//!
//! Every call to an external dependency (source query, embedding, index
//! write, summarization) goes through [`with_backoff`]: each attempt is
//! bounded by a timeout, a timeout counts as a transient failure rather
//! than a silent success, and only transient failures are re-attempted.
//!
//! Backoff doubles per attempt from `base_delay` with the shift capped,
//! so a 500ms base yields 500ms, 1s, 2s, 4s, ...

use std::future::Future;
use std::time::Duration;

use crate::error::{Dependency, PipelineError, Result};

/// Attempt cap, per-attempt timeout, and backoff base for one dependency.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, call_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            call_timeout,
        }
    }

    /// Delay before the given attempt (attempts are 1-based; the first has
    /// no delay).
    fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt - 2).min(5))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Run `operation` with bounded retries and a per-attempt timeout.
///
/// Returns the first success, the first non-transient error as-is, or the
/// last transient error with its `attempts` count set to how often we
/// actually tried.
pub async fn with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    dependency: Dependency,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_message = String::new();

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.delay_before(attempt)).await;
            tracing::debug!(%dependency, attempt, "retrying after transient failure");
        }

        match tokio::time::timeout(policy.call_timeout, operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if err.is_transient() => {
                last_message = err.to_string();
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                last_message = format!("timed out after {:?}", policy.call_timeout);
            }
        }
    }

    Err(PipelineError::Transient {
        dependency,
        attempts: policy.max_attempts,
        message: last_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_backoff(fast_policy(3), Dependency::Embedding, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_until_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_backoff(fast_policy(3), Dependency::Index, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::transient(Dependency::Index, "HTTP 503"))
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            PipelineError::Transient { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected transient error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_backoff(fast_policy(3), Dependency::Embedding, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::validation("bad input"))
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(10));
        let result: Result<()> = with_backoff(policy, Dependency::Summarization, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        match result.unwrap_err() {
            PipelineError::Transient {
                attempts, message, ..
            } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("timed out"));
            }
            other => panic!("expected transient error, got {other:?}"),
        }
    }
}
