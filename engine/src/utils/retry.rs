//! Async retry utilities with exponential backoff

use std::time::Duration;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped at `max`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(2_u32.pow(exp)).min(max)
}

/// Stateful exponential backoff for long-running reconnect loops
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Advance and return the next delay
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        backoff_delay(self.attempt, self.base, self.max)
    }

    /// Consecutive failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Retry an async operation with exponential backoff while `retryable` holds.
///
/// Returns `Ok((value, attempts))` on success, or `Err((error, attempts))` on failure.
pub async fn retry_with_backoff_async<T, E, F, Fut, R>(
    max_attempts: u32,
    base_delay_ms: u64,
    retryable: R,
    mut operation: F,
) -> Result<(T, u32), (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let base = Duration::from_millis(base_delay_ms);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok((value, attempts)),
            Err(e) => {
                if attempts >= max_attempts || !retryable(&e) {
                    return Err((e, attempts));
                }
                let delay = backoff_delay(attempts, base, Duration::MAX);
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(4, base, max), Duration::from_millis(800));
        assert_eq!(backoff_delay(5, base, max), max);
        assert_eq!(backoff_delay(60, base, max), max);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_success_on_first_try() {
        let result = retry_with_backoff_async(3, 10, |_: &&str| true, || async {
            Ok::<_, &str>(7)
        })
        .await;
        assert_eq!(result, Ok((7, 1)));
    }

    #[tokio::test]
    async fn test_success_after_retry() {
        let attempts = RefCell::new(0);
        let result = retry_with_backoff_async(
            3,
            10,
            |_: &&str| true,
            || {
                *attempts.borrow_mut() += 1;
                let n = *attempts.borrow();
                async move { if n < 2 { Err("transient error") } else { Ok(n) } }
            },
        )
        .await;
        assert_eq!(result, Ok((2, 2)));
    }

    #[tokio::test]
    async fn test_failure_after_max_retries() {
        let result = retry_with_backoff_async(3, 10, |_: &&str| true, || async {
            Err::<(), _>("persistent error")
        })
        .await;
        let (error, attempts) = result.unwrap_err();
        assert_eq!(error, "persistent error");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let result = retry_with_backoff_async(5, 10, |_: &&str| false, || async {
            Err::<(), _>("bad request")
        })
        .await;
        assert_eq!(result.unwrap_err().1, 1);
    }
}
