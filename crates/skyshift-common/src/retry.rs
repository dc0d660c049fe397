//! Backoff policy and the retry driver
//!
//! External calls (store I/O, watch reconnects, cluster manager RPCs)
//! retry through one driver that consults [`Error::is_retryable`]: user
//! and permanent errors surface immediately, everything transient backs
//! off. Pauses use equal jitter: half the exponential delay is fixed,
//! the other half uniformly random, so reconnecting controllers fan out
//! instead of stampeding.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::error::{Error, Result};

/// Shape of the exponential backoff between attempts
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any single delay
    pub ceiling: Duration,
    /// Exponent applied per failed attempt
    pub growth: f64,
    /// Total attempts allowed; `None` retries until cancelled
    pub attempt_budget: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            ceiling: Duration::from_secs(20),
            growth: 2.0,
            attempt_budget: None,
        }
    }
}

impl BackoffPolicy {
    /// Retry until the operation succeeds or is cancelled
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Give up after `attempts` total attempts
    pub fn budgeted(attempts: u32) -> Self {
        Self {
            attempt_budget: Some(attempts),
            ..Self::default()
        }
    }

    /// Whether the zero-based `attempt` was the last one allowed
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.attempt_budget
            .map(|budget| attempt + 1 >= budget)
            .unwrap_or(false)
    }

    /// Jittered pause after the zero-based `attempt`.
    ///
    /// The exponential delay is capped at the ceiling; half of it is
    /// kept, the rest drawn uniformly at random (equal jitter).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base.as_secs_f64() * self.growth.powi(attempt as i32);
        let capped = exponential.min(self.ceiling.as_secs_f64());
        let half = capped / 2.0;
        Duration::from_secs_f64(half + rand::thread_rng().gen_range(0.0..=half))
    }
}

/// Drive an operation through the backoff policy.
///
/// Retries only failures that [`Error::is_retryable`] accepts; a
/// validation, not-found or authorization error returns on the first
/// attempt. When the budget runs out the last error is returned.
pub async fn with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let err = match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        if policy.exhausted(attempt) {
            error!(
                operation = %operation,
                attempts = attempt + 1,
                error = %err,
                "retry budget exhausted"
            );
            return Err(err);
        }

        let pause = policy.delay(attempt);
        warn!(
            operation = %operation,
            attempt = attempt + 1,
            pause_ms = pause.as_millis(),
            error = %err,
            "backing off after retryable failure"
        );
        tokio::time::sleep(pause).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            ceiling: Duration::from_millis(4),
            growth: 2.0,
            attempt_budget: Some(attempts),
        }
    }

    #[tokio::test]
    async fn test_conflict_is_retried_until_reread_wins() {
        // A controller losing two optimistic races before its reread
        // lands is the canonical retry path.
        let races = Arc::new(AtomicU32::new(0));
        let counter = races.clone();

        let result = with_backoff(&fast_policy(5), "commit_placement", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::conflict("/registry/jobs/default/j1", 4))
                } else {
                    Ok("committed")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "committed");
        assert_eq!(races.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_backoff(&fast_policy(5), "create_job", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::invalid("Job", "zero replicas"))
            }
        })
        .await;

        // Validation failures surface on the first attempt.
        assert!(matches!(result, Err(Error::InvalidObject { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_backoff(&fast_policy(3), "etcd_put", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::transient("etcd", "connection refused"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_respects_ceiling_and_jitter_band() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            ceiling: Duration::from_secs(1),
            growth: 2.0,
            attempt_budget: None,
        };
        // Far past the ceiling the delay stays within [ceiling/2, ceiling].
        for _ in 0..32 {
            let pause = policy.delay(20);
            assert!(pause >= Duration::from_millis(500));
            assert!(pause <= Duration::from_secs(1));
        }
        // Early attempts stay within their own exponential bound.
        for _ in 0..32 {
            assert!(policy.delay(0) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_exhaustion_accounting() {
        assert!(!BackoffPolicy::unbounded().exhausted(1_000_000));
        let budgeted = BackoffPolicy::budgeted(3);
        assert!(!budgeted.exhausted(0));
        assert!(!budgeted.exhausted(1));
        assert!(budgeted.exhausted(2));
    }
}
