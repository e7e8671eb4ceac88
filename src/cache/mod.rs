//! Time-bounded memoization with LRU/FIFO eviction
//!
//! Expiry is evaluated lazily on read: an entry is absent once `now >=
//! expires_at` whether or not it has been physically removed. [`TtlCache::prune`]
//! removes expired entries eagerly to bound memory.
//!
//! Eviction happens only when inserting a new key into a full cache. Expired
//! entries are dropped first; if the cache is still full, exactly one live
//! entry goes from the cold end of an [`LruCache`]. Under
//! [`EvictionPolicy::Lru`] reads promote the entry, so the cold end is the
//! least recently read; under [`EvictionPolicy::Fifo`] reads only peek and the
//! cold end is the oldest insert.

mod health;

use std::borrow::Borrow;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use crate::clock::{deadline_after, system_clock, SharedClock};
pub use crate::config::{CacheConfig, EvictionPolicy, HealthCacheConfig};
use crate::error::Result;
pub use health::{HealthCheckCache, StaleRead};

/// Cumulative cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before any lookup
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub max_size: usize,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_accessed_at: Instant,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Result of a successful internal read.
pub(crate) struct Hit<V> {
    pub(crate) value: V,
    pub(crate) inserted_at: Instant,
    pub(crate) now: Instant,
}

struct CacheInner<K, V> {
    // capacity is enforced by `set`, after expired entries are dropped
    entries: LruCache<K, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K: Eq + Hash + Clone, V> CacheInner<K, V> {
    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    fn evict_one(&mut self) -> Option<K> {
        let (victim, _) = self.entries.pop_lru()?;
        self.evictions += 1;
        Some(victim)
    }

    fn live(&self, now: Instant) -> usize {
        self.entries.iter().filter(|(_, e)| !e.is_expired(now)).count()
    }
}

/// In-memory TTL cache; all methods take `&self` and serialize internally.
pub struct TtlCache<K, V> {
    config: CacheConfig,
    clock: SharedClock,
    inner: Mutex<CacheInner<K, V>>,
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: CacheConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Insert or overwrite `key`; `ttl` defaults to the configured lifetime.
    ///
    /// An overwrite counts as a fresh insert for both eviction orders.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let now = self.clock.now();
        let ttl = ttl.unwrap_or(self.config.ttl);
        let mut inner = self.lock();

        if !inner.entries.contains(&key) && inner.entries.len() >= self.config.max_size {
            inner.remove_expired(now);
            if inner.entries.len() >= self.config.max_size {
                inner.evict_one();
                debug!(
                    policy = ?self.config.eviction_policy,
                    max_size = self.config.max_size,
                    "cache full, evicted one entry"
                );
            }
        }

        inner.entries.put(
            key,
            Entry {
                value,
                inserted_at: now,
                last_accessed_at: now,
                expires_at: deadline_after(now, ttl),
            },
        );
    }

    /// Read a live entry, counting a hit or a miss.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.read(key, |_, _| true).map(|hit| hit.value)
    }

    /// Shared read path: `accept(inserted_at, now)` may reject a live entry,
    /// which then counts as a miss but stays stored without being promoted.
    pub(crate) fn read<Q, A>(&self, key: &Q, accept: A) -> Option<Hit<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        A: FnOnce(Instant, Instant) -> bool,
    {
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let state = match inner.entries.peek(key) {
            None => None,
            Some(e) if e.is_expired(now) => Some(false),
            Some(e) => Some(accept(e.inserted_at, now)),
        };
        match state {
            Some(true) => {
                inner.hits += 1;
                let entry = match self.config.eviction_policy {
                    EvictionPolicy::Lru => inner.entries.get_mut(key)?,
                    EvictionPolicy::Fifo => inner.entries.peek_mut(key)?,
                };
                entry.last_accessed_at = now;
                Some(Hit {
                    value: entry.value.clone(),
                    inserted_at: entry.inserted_at,
                    now,
                })
            }
            Some(false) => {
                inner.misses += 1;
                if inner.entries.peek(key).map_or(false, |e| e.is_expired(now)) {
                    inner.entries.pop(key);
                    inner.expirations += 1;
                }
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Whether a live entry exists; does not touch stats or recency.
    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.clock.now();
        self.lock()
            .entries
            .peek(key)
            .map_or(false, |e| !e.is_expired(now))
    }

    /// Time of insertion of a live entry.
    pub(crate) fn inserted_at<Q>(&self, key: &Q) -> Option<Instant>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.clock.now();
        self.lock()
            .entries
            .peek(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.inserted_at)
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().entries.pop(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Number of live entries.
    pub fn size(&self) -> usize {
        let now = self.clock.now();
        self.lock().live(now)
    }

    /// Physically remove expired entries; returns how many went.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let removed = self.lock().remove_expired(now);
        if removed > 0 {
            debug!(removed, "pruned expired cache entries");
        }
        removed
    }

    /// Return the cached value or compute, store and return it.
    ///
    /// A failed fetch stores nothing and its error is returned as is.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: K,
        fetcher: F,
        ttl: Option<Duration>,
    ) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = fetcher().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            evictions: inner.evictions,
            expirations: inner.expirations,
            size: inner.live(now),
            max_size: self.config.max_size,
        }
    }

    /// Reset hit/miss counters.
    pub fn reset_stats(&self) {
        let mut inner = self.lock();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
        inner.expirations = 0;
    }

    /// Last read (or insertion) time of a live entry.
    pub fn last_accessed<Q>(&self, key: &Q) -> Option<Instant>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.clock.now();
        self.lock()
            .entries
            .peek(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.last_accessed_at)
    }
}
