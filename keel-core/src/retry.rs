//! Retry with exponential backoff and jitter
//!
//! Wraps any fallible async operation. The operation classifies each failure
//! through [`RetryableError`]; the policy here only does the counting and the
//! waiting.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Symmetric jitter as a fraction of the delay, in `[0, 1]`
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
            return Err("backoff_factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitter_factor must be within [0, 1]".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("max_delay must not be smaller than initial_delay".to_string());
        }
        Ok(())
    }

    /// `min(max_delay, initial_delay * backoff_factor^attempt)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Base delay shifted by `sample * jitter_factor * base`, where `sample`
    /// lies in `[-1, 1]`. The result stays within `[0, max_delay]`.
    pub fn delay_for(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let sample = sample.clamp(-1.0, 1.0);
        let secs = (base + base * self.jitter_factor * sample).clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_for(attempt, sample)
    }
}

/// How a failed attempt should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Give up immediately
    Fatal,
    /// Retry after the backoff delay
    Retry,
    /// Retry without waiting; only the next delay is skipped
    RetryNow,
}

/// A failed attempt together with its classification
#[derive(Debug)]
pub struct RetryableError<E> {
    pub kind: RetryKind,
    pub error: E,
}

impl<E> RetryableError<E> {
    pub fn fatal(error: E) -> Self {
        Self {
            kind: RetryKind::Fatal,
            error,
        }
    }

    pub fn retry(error: E) -> Self {
        Self {
            kind: RetryKind::Retry,
            error,
        }
    }

    pub fn retry_now(error: E) -> Self {
        Self {
            kind: RetryKind::RetryNow,
            error,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("max retries reached after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("{0}")]
    Fatal(E),

    #[error("retry canceled")]
    Canceled,
}

impl<E> RetryError<E> {
    /// The underlying error of the last attempt, if there was one
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Fatal(last) => Some(last),
            RetryError::Canceled => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, RetryError::Canceled)
    }
}

/// Runs `op` until it succeeds, fails fatally, or `max_retries + 1` attempts
/// have been made.
///
/// Cancelling `token` aborts both an in-progress wait and any further
/// attempts; an attempt that is already running is left to finish.
pub async fn retry<T, E, F, Fut>(
    token: &CancellationToken,
    config: &RetryConfig,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryableError<E>>>,
{
    let mut attempt: u32 = 0;

    loop {
        if token.is_cancelled() {
            return Err(RetryError::Canceled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.kind == RetryKind::Fatal {
            return Err(RetryError::Fatal(err.error));
        }
        if attempt >= config.max_retries {
            return Err(RetryError::Exhausted {
                attempts: attempt + 1,
                last: err.error,
            });
        }

        let delay = match err.kind {
            RetryKind::RetryNow => Duration::ZERO,
            _ => config.jittered_delay(attempt),
        };
        debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "retrying");

        if !delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => return Err(RetryError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn config(max_retries: u32, jitter_factor: f64) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter_factor,
        }
    }

    #[test]
    fn test_default_is_valid() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(config(1, 1.5).validate().is_err());

        let mut c = config(1, 0.2);
        c.backoff_factor = 0.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let c = config(10, 0.0);
        assert_eq!(c.base_delay(0), Duration::from_millis(100));
        assert_eq!(c.base_delay(1), Duration::from_millis(200));
        assert_eq!(c.base_delay(3), Duration::from_millis(800));
        assert_eq!(c.base_delay(4), Duration::from_secs(1));
        assert_eq!(c.base_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let c = config(10, 0.2);
        for attempt in 0..8 {
            let base = c.base_delay(attempt).as_secs_f64();
            for sample in [-1.0, -0.3, 0.0, 0.7, 1.0, 5.0] {
                let d = c.delay_for(attempt, sample);
                assert!(d <= c.max_delay);
                assert!(d.as_secs_f64() >= base * 0.8 - 1e-9);
                assert!(d.as_secs_f64() <= base * 1.2 + 1e-9);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_makes_max_plus_one_attempts() {
        let token = CancellationToken::new();
        let c = config(3, 0.0);
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let result: Result<(), _> = retry(&token, &c, || {
            let attempts = attempts.clone();
            async move {
                attempts.lock().unwrap().push(start.elapsed());
                Err(RetryableError::retry("connection refused"))
            }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last, "connection refused");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let times = attempts.lock().unwrap().clone();
        assert_eq!(times.len(), 4);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_jittered_waits_never_exceed_max_delay() {
        let token = CancellationToken::new();
        let mut c = config(6, 0.2);
        c.max_delay = Duration::from_millis(500);
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let _: Result<(), RetryError<&str>> = retry(&token, &c, || {
            let attempts = attempts.clone();
            async move {
                attempts.lock().unwrap().push(start.elapsed());
                Err(RetryableError::retry("unavailable"))
            }
        })
        .await;

        let times = attempts.lock().unwrap().clone();
        assert_eq!(times.len(), 7);
        for gap in times.windows(2).map(|w| w[1] - w[0]) {
            assert!(gap <= Duration::from_millis(501), "gap {gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_immediately() {
        let token = CancellationToken::new();
        let calls = Arc::new(Mutex::new(0));

        let result: Result<(), _> = retry(&token, &config(5, 0.0), || {
            let calls = calls.clone();
            async move {
                *calls.lock().unwrap() += 1;
                Err(RetryableError::fatal("bad request"))
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal("bad request"))));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_now_skips_only_next_delay() {
        let token = CancellationToken::new();
        let c = config(3, 0.0);
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let result = retry(&token, &c, || {
            let attempts = attempts.clone();
            async move {
                let mut attempts = attempts.lock().unwrap();
                attempts.push(start.elapsed());
                match attempts.len() {
                    1 => Err(RetryableError::retry_now("reset")),
                    2 => Err(RetryableError::retry("timeout")),
                    _ => Ok(42),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        let times = attempts.lock().unwrap().clone();
        assert_eq!(times[1] - times[0], Duration::ZERO);
        assert_eq!(times[2] - times[1], Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait() {
        let token = CancellationToken::new();
        let mut c = config(5, 0.0);
        c.initial_delay = Duration::from_secs(10);
        c.max_delay = Duration::from_secs(60);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> =
            retry(&token, &c, || async { Err(RetryableError::retry("down")) }).await;

        assert!(matches!(result, Err(RetryError::Canceled)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
