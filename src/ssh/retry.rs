use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{self, TakoError};

/// Exponential backoff policy for remote operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(1.0 + spread)
    }
}

/// Run `op` under the retry policy. Only errors classified retryable
/// (network, deadline) are re-attempted; cancellation aborts the backoff
/// sleep immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(TakoError::Cancelled.into());
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !error::is_retryable(&err) {
                    return Err(err);
                }

                let delay = policy.jittered_delay(attempt);
                debug!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {:#}",
                    op_name, attempt, policy.max_attempts, delay, err
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(TakoError::Cancelled.into()),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
        assert_eq!(policy.base_delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn retries_network_errors_then_succeeds() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = with_retry(&policy, &cancel, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TakoError::Network("reset".into()).into())
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_on_first_attempt() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&policy, &cancel, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TakoError::RemoteExec {
                    exit_code: 1,
                    stderr: "boom".into(),
                }
                .into())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(30),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = with_retry(&policy, &cancel, "test", || async {
            Err(TakoError::Network("reset".into()).into())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TakoError>(),
            Some(TakoError::Cancelled)
        ));
    }
}
