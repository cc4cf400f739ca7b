//! Ordered-delay retry logic for Tally.
//!
//! A [`BackoffPolicy`] is a fixed, ordered list of sleep durations. Each
//! failed attempt is classified as transient or fatal; transient failures
//! consume the next delay and try again, fatal failures and an exhausted
//! policy end the loop with the last error.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default delays used when retries are enabled but not configured.
pub const DEFAULT_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after the next delay
    Transient,
    /// Retrying cannot help; stop immediately
    Fatal,
}

/// Ordered sequence of delays between attempts.
///
/// The number of retries equals the number of delays, so a policy with
/// `n` delays makes at most `n + 1` attempts. An empty policy makes
/// exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    delays: Vec<Duration>,
}

impl BackoffPolicy {
    /// Create a policy from an explicit list of delays
    pub fn new(delays: impl Into<Vec<Duration>>) -> Self {
        Self {
            delays: delays.into(),
        }
    }

    /// A policy that never retries
    pub fn disabled() -> Self {
        Self { delays: Vec::new() }
    }

    /// The configured delays, in the order they are consumed
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Maximum number of attempts this policy allows
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    pub fn is_disabled(&self) -> bool {
        self.delays.is_empty()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DELAYS)
    }
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Execute an operation under `policy`, classifying failures with `classify`.
///
/// The closure receives the 1-based attempt number.
pub async fn with_backoff<T, E, F, Fut, C>(
    op_name: &'static str,
    policy: &BackoffPolicy,
    classify: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> ErrorClass,
    E: Display,
{
    let mut delays = policy.delays().iter();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "attempting operation");

        let err = match op(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = op_name,
                        attempts = attempt,
                        "operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(err) => err,
        };

        if classify(&err) == ErrorClass::Fatal {
            warn!(operation = op_name, attempt, error = %err, "operation failed permanently");
            return Err(err);
        }

        let Some(delay) = delays.next() else {
            warn!(operation = op_name, attempt, error = %err, "retry attempts exhausted");
            return Err(err);
        };

        warn!(
            operation = op_name,
            attempt,
            retry_in = ?delay,
            error = %err,
            "operation failed, retrying"
        );
        tokio::time::sleep(*delay).await;
        attempt += 1;
    }
}

/// [`with_backoff`] for error types that know whether they are transient.
pub async fn with_retryable_backoff<T, E, F, Fut>(
    op_name: &'static str,
    policy: &BackoffPolicy,
    op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
{
    with_backoff(op_name, policy, classify_retryable::<E>, op).await
}

fn classify_retryable<E: RetryableError>(err: &E) -> ErrorClass {
    if err.is_transient() {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            if self.transient {
                write!(f, "connection refused")
            } else {
                write!(f, "permission denied")
            }
        }
    }

    impl RetryableError for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    fn millis(values: &[u64]) -> BackoffPolicy {
        BackoffPolicy::new(
            values
                .iter()
                .map(|v| Duration::from_millis(*v))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let result: Result<&str, TestError> =
            with_retryable_backoff("test_op", &BackoffPolicy::default(), |_attempt| async {
                Ok("success")
            })
            .await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success_sleeps_in_order() {
        let policy = millis(&[100, 300, 500]);
        let start = Instant::now();
        let attempt_times = Arc::new(Mutex::new(Vec::new()));
        let times = Arc::clone(&attempt_times);

        let result = with_retryable_backoff("test_op", &policy, move |attempt| {
            times.lock().unwrap().push(start.elapsed());
            async move {
                if attempt < 3 {
                    Err(TestError { transient: true })
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        let times = attempt_times.lock().unwrap().clone();
        assert_eq!(
            times,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(400),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_returns_without_sleeping() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let start = Instant::now();

        let result: Result<(), TestError> =
            with_retryable_backoff("test_op", &millis(&[100, 300]), move |_attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: false }) }
            })
            .await;

        assert!(result.unwrap_err().is_permanent());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_policy_returns_last_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let start = Instant::now();

        let result: Result<(), TestError> =
            with_retryable_backoff("test_op", &millis(&[10, 20]), move |_attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: true }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_disabled_policy_makes_one_attempt() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), TestError> =
            with_retryable_backoff("test_op", &BackoffPolicy::disabled(), move |_attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { transient: true }) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let result: Result<(), String> = with_backoff(
            "test_op",
            &millis(&[1, 1, 1]),
            |err: &String| {
                if err.contains("timeout") {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            },
            |attempt| async move {
                if attempt == 1 {
                    Err("timeout".to_string())
                } else {
                    Err("bad request".to_string())
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), "bad request");
    }

    #[test]
    fn test_default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delays(), &DEFAULT_DELAYS);
        assert_eq!(policy.max_attempts(), 4);
        assert!(BackoffPolicy::disabled().is_disabled());
    }
}
