//! Bounded concurrent execution with rate-limited admission
//!
//! A [`Pool`] lets at most `max_concurrent` operations run at once. Callers that
//! cannot start immediately wait in a FIFO queue of at most `max_queue_size`
//! entries, each for at most `acquire_timeout`. With rate limiting enabled an
//! admission additionally consumes one token from a [`TokenBucket`].
//!
//! Slots come from a fair [`Semaphore`], so waiters are served in arrival
//! order. A waiter that has its slot then takes its turn at the bucket and
//! sleeps until the next refill if it is empty.
//!
//! Admission is handed over as an RAII permit: whoever holds the permit owns
//! the slot, and dropping it (completion, failure or cancellation) releases the
//! slot to the next waiter.
//!
//! `acquire_timeout` bounds the whole wait, whether the caller is blocked on a
//! free slot or on a token.

mod rate_limit;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::clock::{system_clock, SharedClock};
pub use crate::config::{PoolConfig, RateLimitConfig};
use crate::config::ReliabilityConfig;
use crate::error::{ReliabilityError, Result};
use rate_limit::TokenBucket;

/// Snapshot of pool occupancy and configuration.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    #[serde(with = "crate::config::millis")]
    pub acquire_timeout: Duration,
    pub draining: bool,
    /// `None` when rate limiting is disabled
    pub available_tokens: Option<u32>,
    pub rate_limit: RateLimitConfig,
    pub admitted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

struct Shared {
    config: PoolConfig,
    clock: SharedClock,
    slots: Arc<Semaphore>,
    bucket: Mutex<TokenBucket>,
    // slot holders queue here for tokens in the order they got their slot
    token_turn: AsyncMutex<()>,
    active: AtomicUsize,
    queued: AtomicUsize,
    draining: AtomicBool,
    admitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    idle: Notify,
    drained: Notify,
}

/// Concurrency-bounded executor; clones share the same slots and queue.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}

impl Pool {
    pub fn new(config: PoolConfig, rate_limit: RateLimitConfig) -> Result<Self> {
        Self::with_clock(config, rate_limit, system_clock())
    }

    pub fn from_config(config: &ReliabilityConfig) -> Result<Self> {
        Self::new(config.pool.clone(), config.rate_limit.clone())
    }

    /// Token refills are measured on `clock`; waiting itself uses Tokio timers.
    pub fn with_clock(
        config: PoolConfig,
        rate_limit: RateLimitConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        rate_limit.validate()?;
        if config.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ReliabilityError::invalid_config(format!(
                "pool.max_concurrent must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        let bucket = TokenBucket::new(rate_limit, clock.now());
        Ok(Self {
            shared: Arc::new(Shared {
                slots: Arc::new(Semaphore::new(config.max_concurrent)),
                bucket: Mutex::new(bucket),
                token_turn: AsyncMutex::new(()),
                active: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                admitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                idle: Notify::new(),
                drained: Notify::new(),
                config,
                clock,
            }),
        })
    }

    /// Run `operation` once admitted.
    ///
    /// Admission failures are converted into the caller's error type; the
    /// operation's own result is returned untouched.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<ReliabilityError>,
    {
        let _permit = self.acquire().await?;
        operation().await
    }

    /// Wait for a slot and hold it until the permit is dropped.
    pub async fn acquire(&self) -> Result<PoolPermit> {
        let shared = &self.shared;
        if shared.draining.load(Ordering::Acquire) {
            shared.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ReliabilityError::Draining);
        }
        if let Some(permit) = shared.try_admit_now() {
            return Ok(permit);
        }

        let Some(_waiter) = QueuedWaiter::join(shared) else {
            shared.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(
                queued = shared.queued.load(Ordering::Relaxed),
                active = shared.active.load(Ordering::Relaxed),
                "pool queue full, rejecting"
            );
            return Err(ReliabilityError::QueueFull {
                max_queue_size: shared.config.max_queue_size,
            });
        };
        debug!(queued = shared.queued.load(Ordering::Relaxed), "pool saturated, queueing");

        let timeout = shared.config.acquire_timeout;
        match tokio::time::timeout(timeout, shared.wait_for_admission()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(err)) => {
                shared.rejected.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
            Err(_) => {
                shared.timed_out.fetch_add(1, Ordering::Relaxed);
                debug!(?timeout, "pool acquire timed out");
                Err(ReliabilityError::AcquireTimeout { waited: timeout })
            }
        }
    }

    /// Stop admitting, reject everyone queued, and wait for in-flight work.
    pub async fn drain(&self) {
        let shared = &self.shared;
        shared.draining.store(true, Ordering::Release);
        shared.slots.close();
        shared.drained.notify_waiters();
        info!(
            queued = shared.queued.load(Ordering::Relaxed),
            "pool draining"
        );

        loop {
            let notified = shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if shared.active.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        debug!("pool drained");
    }

    pub fn status(&self) -> PoolStatus {
        let shared = &self.shared;
        let now = shared.clock.now();
        let (available_tokens, rate_limit) = {
            let mut bucket = shared.bucket();
            (bucket.available(now), bucket.config().clone())
        };
        PoolStatus {
            active: shared.active.load(Ordering::Acquire),
            queued: shared.queued.load(Ordering::Acquire),
            max_concurrent: shared.config.max_concurrent,
            max_queue_size: shared.config.max_queue_size,
            acquire_timeout: shared.config.acquire_timeout,
            draining: shared.draining.load(Ordering::Acquire),
            available_tokens,
            rate_limit,
            admitted: shared.admitted.load(Ordering::Relaxed),
            completed: shared.completed.load(Ordering::Relaxed),
            rejected: shared.rejected.load(Ordering::Relaxed),
            timed_out: shared.timed_out.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

impl Shared {
    fn bucket(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit without waiting when nobody is queued and a slot and a token are
    /// both free.
    fn try_admit_now(self: &Arc<Self>) -> Option<PoolPermit> {
        if self.queued.load(Ordering::Acquire) > 0 {
            return None;
        }
        let slot = self.slots.clone().try_acquire_owned().ok()?;
        if !self.bucket().try_take(self.clock.now()) {
            return None;
        }
        Some(self.admit(slot))
    }

    fn admit(self: &Arc<Self>, slot: OwnedSemaphorePermit) -> PoolPermit {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        PoolPermit {
            shared: self.clone(),
            _slot: slot,
        }
    }

    async fn wait_for_admission(self: &Arc<Self>) -> Result<PoolPermit> {
        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ReliabilityError::Draining)?;
        self.wait_for_token().await?;
        Ok(self.admit(slot))
    }

    async fn wait_for_token(&self) -> Result<()> {
        if !self.bucket().enabled() {
            return Ok(());
        }
        let _turn = self.token_turn.lock().await;
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.draining.load(Ordering::Acquire) {
                return Err(ReliabilityError::Draining);
            }
            let wait = {
                let now = self.clock.now();
                let mut bucket = self.bucket();
                if bucket.try_take(now) {
                    return Ok(());
                }
                bucket.until_next_refill(now)
            };
            tokio::select! {
                _ = sleep(wait.max(Duration::from_millis(1))) => {}
                _ = drained => {}
            }
        }
    }

    fn release(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// A place in the wait queue; leaving it (admitted, timed out or cancelled)
/// frees the place.
struct QueuedWaiter {
    shared: Arc<Shared>,
}

impl QueuedWaiter {
    fn join(shared: &Arc<Shared>) -> Option<Self> {
        let limit = shared.config.max_queue_size;
        shared
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()?;
        Some(Self {
            shared: shared.clone(),
        })
    }
}

impl Drop for QueuedWaiter {
    fn drop(&mut self) {
        self.shared.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An occupied pool slot; released on drop.
pub struct PoolPermit {
    shared: Arc<Shared>,
    _slot: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PoolPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPermit").finish_non_exhaustive()
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.shared.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(max_concurrent: usize, max_queue_size: usize, timeout_ms: u64) -> Pool {
        Pool::new(
            PoolConfig {
                max_concurrent,
                max_queue_size,
                acquire_timeout: Duration::from_millis(timeout_ms),
            },
            RateLimitConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn enforces_concurrency_limit() {
        let pool = pool(2, 16, 10_000);
        let current = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8).map(|_| {
            let pool = pool.clone();
            let current = current.clone();
            let max_observed = max_observed.clone();
            async move {
                pool.execute(|| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_observed.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ReliabilityError>(())
                })
                .await
            }
        });
        let results = futures::future::join_all(tasks).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(max_observed.load(Ordering::SeqCst), 2);
        let status = pool.status();
        assert_eq!(status.active, 0);
        assert_eq!(status.completed, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_when_queue_full() {
        let pool = pool(1, 0, 1000);
        let held = pool.acquire().await.unwrap();
        let err = pool
            .execute(|| async { Ok::<_, ReliabilityError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ReliabilityError::QueueFull { max_queue_size: 0 }));
        drop(held);
        assert_eq!(pool.status().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_and_leaves_queue() {
        let pool = pool(1, 4, 50);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ReliabilityError::AcquireTimeout { .. }));
        let status = pool.status();
        assert_eq!(status.queued, 0);
        assert_eq!(status.timed_out, 1);
        assert_eq!(status.active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_waiter_admitted_on_release() {
        let pool = pool(1, 4, 1000);
        let held = pool.acquire().await.unwrap();
        let p = pool.clone();
        let waiter = tokio::spawn(async move {
            p.execute(|| async { Ok::<_, ReliabilityError>("ran") }).await
        });
        tokio::task::yield_now().await;
        assert_eq!(pool.status().queued, 1);
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), "ran");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_delays_admission_until_refill() {
        let pool = Pool::new(
            PoolConfig {
                max_concurrent: 10,
                max_queue_size: 10,
                acquire_timeout: Duration::from_secs(5),
            },
            RateLimitConfig {
                enabled: true,
                tokens_per_interval: 1,
                interval: Duration::from_millis(100),
                max_burst: 1,
            },
        )
        .unwrap();
        let start = tokio::time::Instant::now();
        pool.execute(|| async { Ok::<_, ReliabilityError>(()) })
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        pool.execute(|| async { Ok::<_, ReliabilityError>(()) })
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(pool.status().available_tokens, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_wait_is_bounded_by_acquire_timeout() {
        let pool = Pool::new(
            PoolConfig {
                max_concurrent: 10,
                max_queue_size: 10,
                acquire_timeout: Duration::from_millis(50),
            },
            RateLimitConfig {
                enabled: true,
                tokens_per_interval: 1,
                interval: Duration::from_secs(10),
                max_burst: 1,
            },
        )
        .unwrap();
        let _first = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ReliabilityError::AcquireTimeout { .. }));
    }

    fn limited(max_concurrent: usize, interval: Duration, timeout: Duration) -> Pool {
        Pool::new(
            PoolConfig {
                max_concurrent,
                max_queue_size: 4,
                acquire_timeout: timeout,
            },
            RateLimitConfig {
                enabled: true,
                tokens_per_interval: 1,
                interval,
                max_burst: 1,
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_behind_full_pool_is_admitted_at_next_refill() {
        let pool = limited(1, Duration::from_millis(100), Duration::from_secs(5));
        let start = tokio::time::Instant::now();

        let p = pool.clone();
        let first = tokio::spawn(async move {
            p.execute(|| async {
                sleep(Duration::from_millis(10)).await;
                Ok::<_, ReliabilityError>(())
            })
            .await
        });
        tokio::task::yield_now().await;
        let p = pool.clone();
        let second = tokio::spawn(async move {
            p.execute(|| async { Ok::<_, ReliabilityError>(tokio::time::Instant::now()) })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(pool.status().queued, 1);

        first.await.unwrap().unwrap();
        // the slot frees at 10ms but the bucket is empty until 100ms
        let admitted_at = second.await.unwrap().unwrap();
        assert!(admitted_at - start >= Duration::from_millis(100));
        assert!(admitted_at - start < Duration::from_millis(200));

        let status = pool.status();
        assert_eq!(status.timed_out, 0);
        assert_eq!(status.admitted, 2);
        assert_eq!(status.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_rejects_waiter_blocked_on_token() {
        let pool = limited(2, Duration::from_secs(10), Duration::from_secs(60));
        let first = pool.acquire().await.unwrap();

        let p = pool.clone();
        let second = tokio::spawn(async move { p.acquire().await.map(|_| ()) });
        tokio::task::yield_now().await;
        assert_eq!(pool.status().queued, 1);

        drop(first);
        pool.drain().await;
        assert!(matches!(
            second.await.unwrap(),
            Err(ReliabilityError::Draining)
        ));
        assert_eq!(pool.status().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_rejects_queued_and_waits_for_in_flight() {
        let pool = pool(1, 4, 10_000);
        let finished = Arc::new(AtomicUsize::new(0));

        let p = pool.clone();
        let f = finished.clone();
        let running = tokio::spawn(async move {
            p.execute(|| async move {
                sleep(Duration::from_millis(100)).await;
                f.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ReliabilityError>(())
            })
            .await
        });
        tokio::task::yield_now().await;
        let p = pool.clone();
        let queued = tokio::spawn(async move {
            p.execute(|| async { Ok::<_, ReliabilityError>(()) }).await
        });
        tokio::task::yield_now().await;
        assert_eq!(pool.status().queued, 1);

        pool.drain().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(running.await.unwrap().is_ok());
        assert!(matches!(
            queued.await.unwrap(),
            Err(ReliabilityError::Draining)
        ));
        assert!(matches!(
            pool.acquire().await,
            Err(ReliabilityError::Draining)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_operation_releases_slot() {
        let pool = pool(1, 4, 1000);
        let p = pool.clone();
        let stuck = tokio::spawn(async move {
            p.execute(|| async {
                sleep(Duration::from_secs(3600)).await;
                Ok::<_, ReliabilityError>(())
            })
            .await
        });
        tokio::task::yield_now().await;
        assert_eq!(pool.status().active, 1);
        stuck.abort();
        let _ = stuck.await;
        assert_eq!(pool.status().active, 0);
        pool.execute(|| async { Ok::<_, ReliabilityError>(()) })
            .await
            .unwrap();
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = Pool::new(
            PoolConfig {
                max_concurrent: 0,
                ..Default::default()
            },
            RateLimitConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ReliabilityError::InvalidConfig { .. }));
    }
}
