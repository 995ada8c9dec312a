//! Retry and requeue policies.
//!
//! Two kinds of retry live here:
//!
//! - **In-process backoff** ([`RetryPolicy`], [`retry_with_backoff`],
//!   [`retry_with_predicate`]) for short transient failures: publishing a
//!   `SignChanged` notification, fetching a linked document.
//! - **Requeue** ([`RequeuePolicy`]) for handler outcomes that need minutes,
//!   not milliseconds: the message goes back on the bus with a delay and an
//!   incremented attempt counter, and is dead-lettered when the budget runs out.
//!
//! # Example
//!
//! ```rust
//! use marksign_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! let result = retry_with_backoff(policy, || async { Ok::<_, String>(42) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Exponential backoff configuration.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (zero-based), capped at `max_delay`.
    #[must_use]
    // Nanosecond delays are far below f64's exact-integer range
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0) as u64)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: usize,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub const fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Returns the first success, or the last error once `max_retries` retries
/// have failed.
///
/// # Errors
///
/// The operation's last error.
///
/// # Example
///
/// ```rust
/// use marksign_runtime::retry::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let result = retry_with_backoff(RetryPolicy::default(), || async {
///     Ok::<_, String>(42)
/// }).await?;
///
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry an async operation while `is_retryable` accepts the error.
///
/// # Errors
///
/// The first non-retryable error, or the last error once retries run out.
///
/// # Example
///
/// ```rust
/// use marksign_runtime::retry::{RetryPolicy, retry_with_predicate};
///
/// # async fn example() -> Result<(), String> {
/// let result = retry_with_predicate(
///     RetryPolicy::default(),
///     || async { Ok::<_, String>(42) },
///     |err: &String| err.contains("transient"),
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    RetryMetrics::record_success();
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(err) if !is_retryable(&err) => {
                tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                return Err(err);
            },
            Err(err) if attempt >= policy.max_retries => {
                RetryMetrics::record_exhausted();
                tracing::error!(attempt, error = %err, "Operation failed after max retries");
                return Err(err);
            },
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                RetryMetrics::record_attempt();
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}

/// What to do with a message whose handler asked to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Dispatch again after the delay.
    After(Duration),
    /// Budget exhausted; park it.
    DeadLetter,
}

/// Bounded delayed-requeue policy.
///
/// `attempt` is zero-based: a message on its first delivery has attempt 0, and
/// is requeued while `attempt + 1 < max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeuePolicy {
    /// Total deliveries allowed, including the first.
    pub max_attempts: u32,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self { max_attempts: 30 }
    }
}

impl RequeuePolicy {
    /// Decide for a message on delivery `attempt` that asked for `delay`.
    #[must_use]
    pub const fn decide(&self, attempt: u32, delay: Duration) -> Requeue {
        if attempt.saturating_add(1) < self.max_attempts {
            Requeue::After(delay)
        } else {
            Requeue::DeadLetter
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(max_retries: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .build()
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(500))
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(10_000), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_backoff(fast(3), || {
            let c = Arc::clone(&counter);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("broker unavailable".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_the_last_error_when_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_backoff(fast(2), || {
            let c = Arc::clone(&counter);
            async move { Err::<(), _>(format!("failure {}", c.fetch_add(1, Ordering::SeqCst))) }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn predicate_stops_on_permanent_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_predicate(
            fast(5),
            || {
                let c = Arc::clone(&counter);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("404 not found")
                }
            },
            |err: &&str| err.starts_with('5'),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn requeue_budget_counts_the_first_delivery() {
        let policy = RequeuePolicy { max_attempts: 3 };
        let delay = Duration::from_secs(60);
        assert_eq!(policy.decide(0, delay), Requeue::After(delay));
        assert_eq!(policy.decide(1, delay), Requeue::After(delay));
        assert_eq!(policy.decide(2, delay), Requeue::DeadLetter);
        assert_eq!(policy.decide(u32::MAX, delay), Requeue::DeadLetter);
    }
}
