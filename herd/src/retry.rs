//! Bounded retry around fallible async operations.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::error::{HerdError, Result};

/// Run `operation` until it succeeds or `policy.max_attempts` is reached.
///
/// The operation receives the 1-based attempt number. Between attempts the
/// policy's delay is slept on `clock`. Cancellation ends the loop at once,
/// including mid-delay, with [`HerdError::Cancelled`]; errors that are
/// themselves cancellations are passed through untouched. Exhaustion returns
/// [`HerdError::RetryExhausted`] wrapping the last failure.
pub async fn retry<F, Fut, T>(
    clock: &dyn Clock,
    policy: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(HerdError::Cancelled);
        }

        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(HerdError::Cancelled),
            outcome = operation(attempt) => outcome,
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if error.is_cancellation() => return Err(error),
            Err(error) => error,
        };

        if attempt >= max_attempts {
            warn!(attempts = attempt, %error, "giving up");
            return Err(HerdError::RetryExhausted {
                attempts: attempt,
                source: Box::new(error),
            });
        }

        let delay = policy.delay_after(attempt);
        debug!(attempt, max_attempts, ?delay, %error, "attempt failed, retrying");
        tokio::select! {
            () = cancel.cancelled() => return Err(HerdError::Cancelled),
            () = clock.sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn policy(attempts: u32) -> RetryConfig {
        RetryConfig::fixed(attempts, Duration::from_millis(500))
    }

    /// Advance the clock each time the retry loop goes to sleep.
    fn drive(clock: &Arc<ManualClock>, sleeps: usize, step: Duration) -> tokio::task::JoinHandle<()> {
        let clock = clock.clone();
        tokio::spawn(async move {
            for _ in 0..sleeps {
                clock.wait_for_sleepers(1).await;
                clock.advance(step);
            }
        })
    }

    #[tokio::test]
    async fn test_succeeds_after_k_minus_one_failures() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let calls = AtomicU32::new(0);
        let driver = drive(&clock, 3, Duration::from_millis(500));

        let value = retry(clock.as_ref(), &policy(4), &CancellationToken::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 4 {
                    Err(HerdError::EmptyResponse)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        driver.await.unwrap();
        assert_eq!(value, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(500); 3]);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let driver = drive(&clock, 2, Duration::from_millis(500));

        let err = retry(clock.as_ref(), &policy(3), &CancellationToken::new(), |attempt| async move {
            Err::<(), _>(HerdError::NonZeroExit {
                code: Some(1),
                output: format!("attempt {attempt}"),
            })
        })
        .await
        .unwrap_err();

        driver.await.unwrap();
        match err {
            HerdError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, HerdError::NonZeroExit { ref output, .. } if output == "attempt 3"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_first_success_never_sleeps() {
        let clock = ManualClock::new(Utc::now());
        let value = retry(&clock, &policy(3), &CancellationToken::new(), |_| async { Ok("ok") })
            .await
            .unwrap();
        assert_eq!(value, "ok");
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_during_delay_is_not_exhaustion() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cancel = CancellationToken::new();

        let canceller = {
            let clock = clock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                clock.wait_for_sleepers(1).await;
                cancel.cancel();
            })
        };

        let err = retry(clock.as_ref(), &policy(5), &cancel, |_| async {
            Err::<(), _>(HerdError::EmptyResponse)
        })
        .await
        .unwrap_err();

        canceller.await.unwrap();
        assert!(matches!(err, HerdError::Cancelled));
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_errors_stop_the_loop() {
        let clock = ManualClock::new(Utc::now());
        let calls = AtomicU32::new(0);
        let err = retry(&clock, &policy(5), &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HerdError::ShuttingDown) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, HerdError::ShuttingDown));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exponential_delays_are_observed_on_the_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let driver = drive(&clock, 3, Duration::from_secs(10));
        let policy = RetryConfig::exponential(4, Duration::from_millis(100), Duration::from_millis(300));

        let _ = retry(clock.as_ref(), &policy, &CancellationToken::new(), |_| async {
            Err::<(), _>(HerdError::EmptyResponse)
        })
        .await;

        driver.await.unwrap();
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
    }
}
