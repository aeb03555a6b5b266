//! Retry-with-back-off helper for commit failures (§4.8: "retry with
//! exponential back-off + jitter on commit failure").

use rand::Rng;
use std::time::Duration;

/// `delay = base * 2^attempt + rand(0..100ms)`, per §4.8.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let scaled = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let jitter = rand::thread_rng().gen_range(0..100);
    scaled + Duration::from_millis(jitter)
}

/// Runs `op` up to `max_retries + 1` times, sleeping with exponential
/// back-off + jitter between attempts whenever `op` returns `Err` and the
/// error is retryable (as judged by `is_retryable`). Returns the first `Ok`,
/// or the last `Err` once retries are exhausted.
pub fn retry_with_backoff<T, E>(
    max_retries: u32,
    base_delay: Duration,
    is_retryable: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && is_retryable(&e) => {
                std::thread::sleep(backoff_delay(base_delay, attempt));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delay_grows_exponentially_with_attempt() {
        let d0 = backoff_delay(Duration::from_millis(10), 0);
        let d1 = backoff_delay(Duration::from_millis(10), 1);
        let d2 = backoff_delay(Duration::from_millis(10), 2);
        // jitter is at most 100ms so the base growth still dominates across attempts.
        assert!(d1 >= Duration::from_millis(10));
        assert!(d2 >= Duration::from_millis(20));
    }

    #[test]
    fn retry_with_backoff_gives_up_after_max_retries() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            2,
            Duration::from_millis(1),
            |_| true,
            || {
                calls += 1;
                Err("always fails")
            },
        );
        assert!(result.is_err());
        assert_eq!(calls, 3); // initial attempt + 2 retries
    }

    #[test]
    fn retry_with_backoff_stops_on_non_retryable_error() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            5,
            Duration::from_millis(1),
            |_| false,
            || {
                calls += 1;
                Err("fatal")
            },
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_with_backoff_returns_first_success() {
        let mut calls = 0;
        let result = retry_with_backoff(
            3,
            Duration::from_millis(1),
            |_: &&str| true,
            || {
                calls += 1;
                if calls < 2 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            },
        );
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 2);
    }
}
