//! Injectable time and randomness sources
//!
//! Every component that reasons about expiry, cooldowns or backoff reads time
//! through a [`Clock`], so tests can freeze and advance it. Jitter draws from a
//! [`RandomSource`] for the same reason.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Source of monotonic time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Reads Tokio's clock.
///
/// Outside of paused-time tests this is the system monotonic clock; under
/// `tokio::time::pause` it advances together with Tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }

    /// Time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}

/// Uniform random numbers in `[0, 1)`.
pub trait RandomSource: Send + Sync + 'static {
    fn next_f64(&self) -> f64;
}

pub type SharedRandom = Arc<dyn RandomSource>;

/// Thread-local `rand` generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        use rand::Rng;
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

/// Always yields the same value; clamped into `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

pub(crate) fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + span` without overflow; spans past the representable range land
/// roughly thirty years out.
pub(crate) fn deadline_after(start: Instant, span: Duration) -> Instant {
    start
        .checked_add(span)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}
