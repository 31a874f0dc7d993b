//! Retry configuration and exponential backoff for storage writes.
//!
//! The batch writer wraps every sink write in [`retry_with_backoff`]. A
//! batch gets at most `max_attempts` writes; between attempts the delay
//! grows by `multiplier`, is capped at `max_delay` and gets ±25% jitter so
//! writers restarting together do not hammer the store in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

/// Backoff settings for a bounded retry loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total write attempts, including the first (0 is treated as 1).
    pub max_attempts: u32,

    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of a retried operation together with how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: crate::Result<T>,
    pub attempts: u32,
}

/// Run `operation` until it succeeds or `max_attempts` is used up.
///
/// Every error is treated as transient. The last error is returned once
/// attempts run out.
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    let mut current_delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if attempt >= max_attempts => {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                }
            }
            Err(err) => {
                let delay = apply_jitter(current_delay);
                debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "write failed, backing off"
                );
                sleep(delay).await;

                let next = Duration::from_secs_f64(current_delay.as_secs_f64() * config.multiplier);
                current_delay = next.min(config.max_delay);
            }
        }
    }
}

/// Scale `delay` by a random factor in 0.75..=1.25.
fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_needs_one_attempt() {
        let out = retry_with_backoff(&fast(), || async { Ok::<_, Error>(42) }).await;
        assert_eq!(out.result.unwrap(), 42);
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let out = retry_with_backoff(&fast(), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Storage("down".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(out.result.unwrap(), 7);
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let out = retry_with_backoff(&fast(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Storage("down".into()))
            }
        })
        .await;
        assert!(matches!(out.result, Err(Error::Storage(_))));
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_runs_once() {
        let config = RetryConfig { max_attempts: 0, ..fast() };
        let out = retry_with_backoff(&config, || async { Err::<(), _>(Error::Storage("x".into())) }).await;
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delays_grow_and_are_capped() {
        let config = RetryConfig {
            max_attempts: 5,
            multiplier: 10.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        let start = Instant::now();
        let _ = retry_with_backoff(&config, || async { Err::<(), _>(Error::Storage("x".into())) }).await;
        let elapsed = start.elapsed();

        // 10ms, then 50ms capped three times, each with ±25% jitter
        assert!(elapsed >= Duration::from_millis(7 + 3 * 37), "too short: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(13 + 3 * 63), "too long: {elapsed:?}");
    }

    #[test]
    fn jitter_range() {
        let delay = Duration::from_millis(100);
        for _ in 0..100 {
            let jittered = apply_jitter(delay);
            assert!(jittered >= Duration::from_millis(75), "jitter too low: {jittered:?}");
            assert!(jittered <= Duration::from_millis(125), "jitter too high: {jittered:?}");
        }
    }
}
