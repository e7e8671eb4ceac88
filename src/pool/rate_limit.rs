//! Token bucket used for pool admission

use std::time::{Duration, Instant};

use crate::clock::deadline_after;
use crate::config::RateLimitConfig;

/// Refills `tokens_per_interval` at every whole `interval`, up to `max_burst`.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    config: RateLimitConfig,
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub(crate) fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.max_burst,
            config,
            last_refill: now,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub(crate) fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn refill(&mut self, now: Instant) {
        if self.config.interval.is_zero() {
            self.tokens = self.config.max_burst;
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = elapsed.as_nanos() / self.config.interval.as_nanos();
        if intervals == 0 {
            return;
        }
        let added = intervals.saturating_mul(self.config.tokens_per_interval as u128);
        self.tokens = (self.tokens as u128 + added).min(self.config.max_burst as u128) as u32;
        // keep the refill grid aligned to whole intervals
        let step = u32::try_from(intervals).unwrap_or(u32::MAX);
        self.last_refill += self.config.interval.saturating_mul(step);
    }

    /// Take one token if available; always succeeds when disabled.
    pub(crate) fn try_take(&mut self, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn available(&mut self, now: Instant) -> Option<u32> {
        if !self.config.enabled {
            return None;
        }
        self.refill(now);
        Some(self.tokens)
    }

    /// Time until the next refill is due.
    pub(crate) fn until_next_refill(&self, now: Instant) -> Duration {
        deadline_after(self.last_refill, self.config.interval).saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(tokens: u32, interval_ms: u64, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            tokens_per_interval: tokens,
            interval: Duration::from_millis(interval_ms),
            max_burst: burst,
        }
    }

    #[test]
    fn starts_full_and_empties() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(cfg(1, 100, 2), t0);
        assert!(bucket.try_take(t0));
        assert!(bucket.try_take(t0));
        assert!(!bucket.try_take(t0));
        assert_eq!(bucket.until_next_refill(t0), Duration::from_millis(100));
    }

    #[test]
    fn refills_per_whole_interval_capped_at_burst() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(cfg(2, 100, 3), t0);
        for _ in 0..3 {
            assert!(bucket.try_take(t0));
        }
        // half an interval adds nothing
        assert_eq!(bucket.available(t0 + Duration::from_millis(50)), Some(0));
        assert_eq!(bucket.available(t0 + Duration::from_millis(100)), Some(2));
        // a long idle period never exceeds max_burst
        assert_eq!(bucket.available(t0 + Duration::from_secs(10)), Some(3));
    }

    #[test]
    fn disabled_bucket_always_admits() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(
            RateLimitConfig {
                enabled: false,
                ..cfg(1, 1000, 1)
            },
            t0,
        );
        for _ in 0..100 {
            assert!(bucket.try_take(t0));
        }
        assert_eq!(bucket.available(t0), None);
    }
}
