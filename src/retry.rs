//! Retry mechanism with exponential backoff
//!
//! Retry re-runs a single async operation and performs no error
//! classification: every failure is retried until `max_retries` is used up,
//! then the last error is returned exactly as the operation produced it.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::clock::{RandomSource, SharedRandom, ThreadRandom};
pub use crate::config::RetryOptions;

/// Backoff delay before re-attempt number `attempt + 1` (zero-based `attempt`).
///
/// `min(max_delay, base_delay * 2^attempt)`, scaled by `random` in `[0, 1]`
/// when jitter is on.
pub fn delay_for_attempt(options: &RetryOptions, attempt: u32, random: &dyn RandomSource) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    let delay = options
        .base_delay
        .checked_mul(factor)
        .unwrap_or(options.max_delay)
        .min(options.max_delay);
    if options.jitter {
        delay.mul_f64(random.next_f64().clamp(0.0, 1.0))
    } else {
        delay
    }
}

/// Runs operations with bounded, backed-off re-attempts.
#[derive(Clone)]
pub struct Retry {
    random: SharedRandom,
}

impl Default for Retry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry").finish_non_exhaustive()
    }
}

impl Retry {
    pub fn new() -> Self {
        Self::with_random(Arc::new(ThreadRandom))
    }

    /// Use a specific jitter source
    pub fn with_random(random: SharedRandom) -> Self {
        Self { random }
    }

    /// Run `operation`, retrying failures per `options`.
    pub async fn run<F, Fut, T, E>(&self, mut operation: F, options: &RetryOptions) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if attempt >= options.max_retries {
                        if options.max_retries > 0 {
                            warn!(
                                max_retries = options.max_retries,
                                %error,
                                "retries exhausted"
                            );
                        }
                        return Err(error);
                    }
                    let delay = delay_for_attempt(options, attempt, self.random.as_ref());
                    attempt += 1;
                    warn!(attempt, %error, ?delay, "attempt failed, backing off");
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Retry with the default thread-local jitter source
pub async fn retry<F, Fut, T, E>(operation: F, options: &RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    Retry::new().run(operation, options).await
}

/// Builder for retry operations
pub struct RetryBuilder {
    options: RetryOptions,
    retry: Retry,
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            options: RetryOptions::default(),
            retry: Retry::new(),
        }
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.options.max_retries = max;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.options.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.options.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.options.jitter = enabled;
        self
    }

    pub fn random(mut self, random: SharedRandom) -> Self {
        self.retry = Retry::with_random(random);
        self
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    pub async fn run<F, Fut, T, E>(self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.retry.run(operation, &self.options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedRandom;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn opts(max_retries: u32, jitter: bool) -> RetryOptions {
        RetryOptions {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let o = opts(10, false);
        let r = FixedRandom(0.5);
        assert_eq!(delay_for_attempt(&o, 0, &r), Duration::from_millis(100));
        assert_eq!(delay_for_attempt(&o, 1, &r), Duration::from_millis(200));
        assert_eq!(delay_for_attempt(&o, 3, &r), Duration::from_millis(800));
        assert_eq!(delay_for_attempt(&o, 4, &r), Duration::from_millis(1000));
        assert_eq!(delay_for_attempt(&o, 40, &r), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_scales_within_delay() {
        let o = opts(10, true);
        assert_eq!(
            delay_for_attempt(&o, 1, &FixedRandom(0.5)),
            Duration::from_millis(100)
        );
        assert_eq!(delay_for_attempt(&o, 1, &FixedRandom(0.0)), Duration::ZERO);
        assert!(delay_for_attempt(&o, 2, &ThreadRandom) <= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_eventually_succeeds() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let result = Retry::new()
            .run(
                || {
                    let c = c.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("flaky")
                        } else {
                            Ok(42)
                        }
                    }
                },
                &opts(5, false),
            )
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_propagates_unchanged() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let start = tokio::time::Instant::now();
        let result: Result<(), String> = retry(
            || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    Err(format!("failure #{n}"))
                }
            },
            &opts(2, false),
        )
        .await;
        assert_eq!(result, Err("failure #2".to_string()));
        // initial + 2 retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_zero_retries_calls_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let result: Result<(), &str> = Retry::new()
            .run(
                || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err("nope") }
                },
                &opts(0, true),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_builder() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let result = RetryBuilder::new()
            .max_retries(5)
            .base_delay(Duration::from_millis(1))
            .with_jitter(true)
            .random(Arc::new(FixedRandom(1.0)))
            .run(|| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("timeout")
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;
        assert_eq!(result, Ok("success"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
