//! Retry policy: decides backoff delays and which failures deserve another try.
//!
//! Backend は自分ではリトライしない。呼び出し側（Dispatcher / Worker / CLI）が
//! このポリシーで包む。Fatal なエラーは 1 回目で即座に返す。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::JobwireError;

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_delay: Duration,

    /// Total attempts including the first one. `1` disables retrying.
    pub max_attempts: u32,

    /// Add up to 10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate delay for the next retry based on attempt number.
    ///
    /// `attempts` is the number of attempts already made (1-indexed):
    /// delay = base_delay * multiplier^(attempts - 1), capped at `max_delay`.
    ///
    /// Example with base_delay=200ms, multiplier=2.0:
    /// - attempt 1 (first failure): 200ms
    /// - attempt 2: 400ms
    /// - attempt 3: 800ms
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // overflow / NaN は上限に倒す
        Duration::try_from_secs_f64(delay_secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=delay.as_secs_f64() * 0.1);
        delay + Duration::from_secs_f64(extra)
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, JobwireError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, JobwireError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempts < self.max_attempts => {
                    let delay = self.jittered(self.next_delay(attempts));
                    warn!(
                        operation,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(300),
            max_attempts,
            jitter: false,
        }
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = fixed_policy(5);

        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        // 400ms は max_delay で頭打ち
        assert_eq!(policy.next_delay(3), Duration::from_millis(300));
        assert_eq!(policy.next_delay(30), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = fixed_policy(5);

        let value = policy
            .run("flaky", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(JobwireError::Connection("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_surface_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = fixed_policy(5);

        let err = policy
            .run("reject", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(JobwireError::validation("nope"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, JobwireError::Validation(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = fixed_policy(3);

        let err = policy
            .run("down", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(JobwireError::Connection("down".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, JobwireError::Connection(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
