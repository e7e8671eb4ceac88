//! Health-check cache with a stale-while-revalidate window
//!
//! Entries are fresh for `ttl` and stale-readable until `stale_ttl`. Plain
//! reads honour the fresh window only; [`HealthCheckCache::get_with_stale`]
//! keeps serving the last known value, flagged as stale, until the longer
//! window runs out.

use std::borrow::Borrow;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use serde::Serialize;

use super::{CacheConfig, CacheStats, HealthCacheConfig, TtlCache};
use crate::clock::{deadline_after, system_clock, SharedClock};
use crate::error::Result;

/// Value read from a health cache, possibly past its fresh window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleRead<V> {
    pub data: V,
    pub is_stale: bool,
}

pub struct HealthCheckCache<K, V> {
    entries: TtlCache<K, V>,
    ttl: Duration,
    stale_ttl: Duration,
}

impl<K, V> std::fmt::Debug for HealthCheckCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckCache")
            .field("ttl", &self.ttl)
            .field("stale_ttl", &self.stale_ttl)
            .finish_non_exhaustive()
    }
}

impl<K, V> HealthCheckCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(config: HealthCacheConfig) -> Result<Self> {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: HealthCacheConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        // physical lifetime is the stale window; freshness is checked on read
        let entries = TtlCache::with_clock(
            CacheConfig {
                ttl: config.stale_ttl,
                max_size: config.max_size,
                eviction_policy: config.eviction_policy,
            },
            clock,
        )?;
        Ok(Self {
            entries,
            ttl: config.ttl,
            stale_ttl: config.stale_ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stale_ttl(&self) -> Duration {
        self.stale_ttl
    }

    pub fn set(&self, key: K, value: V) {
        self.entries.set(key, value, Some(self.stale_ttl));
    }

    /// Fresh value only.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let ttl = self.ttl;
        self.entries
            .read(key, |inserted_at, now| now < deadline_after(inserted_at, ttl))
            .map(|hit| hit.value)
    }

    /// Fresh or stale value, absent once the stale window has passed.
    pub fn get_with_stale<Q>(&self, key: &Q) -> Option<StaleRead<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let ttl = self.ttl;
        self.entries.read(key, |_, _| true).map(|hit| StaleRead {
            is_stale: hit.now >= deadline_after(hit.inserted_at, ttl),
            data: hit.value,
        })
    }

    /// Whether a fresh entry exists.
    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.entries.now();
        self.entries
            .inserted_at(key)
            .map_or(false, |inserted| now < deadline_after(inserted, self.ttl))
    }

    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.delete(key)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Entries still within the stale window.
    pub fn size(&self) -> usize {
        self.entries.size()
    }

    pub fn prune(&self) -> usize {
        self.entries.prune()
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.stats()
    }

    /// Probe only when no fresh value exists; failed probes are not cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, probe: F) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = probe().await?;
        self.set(key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EvictionPolicy;
    use std::sync::Arc;

    fn health(clock: &ManualClock) -> HealthCheckCache<&'static str, bool> {
        HealthCheckCache::with_clock(
            HealthCacheConfig {
                ttl: Duration::from_secs(10),
                stale_ttl: Duration::from_secs(60),
                max_size: 8,
                eviction_policy: EvictionPolicy::Lru,
            },
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    #[test]
    fn stale_window_round_trip() {
        let clock = ManualClock::new();
        let cache = health(&clock);
        cache.set("ollama", true);

        assert_eq!(cache.get("ollama"), Some(true));
        assert_eq!(
            cache.get_with_stale("ollama"),
            Some(StaleRead {
                data: true,
                is_stale: false
            })
        );

        clock.advance(Duration::from_secs(11));
        assert_eq!(cache.get("ollama"), None);
        assert!(!cache.has("ollama"));
        assert_eq!(
            cache.get_with_stale("ollama"),
            Some(StaleRead {
                data: true,
                is_stale: true
            })
        );
        assert_eq!(cache.size(), 1);

        clock.advance(Duration::from_secs(50));
        assert_eq!(cache.get_with_stale("ollama"), None);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn get_or_fetch_reprobes_once_stale() {
        let clock = ManualClock::new();
        let cache = health(&clock);
        let first = cache
            .get_or_fetch("gemini", || async { Ok::<_, &str>(true) })
            .await
            .unwrap();
        assert!(first);

        clock.advance(Duration::from_secs(20));
        let second = cache
            .get_or_fetch("gemini", || async { Ok::<_, &str>(false) })
            .await
            .unwrap();
        assert!(!second);

        // a failing probe leaves the previous entry in place
        clock.advance(Duration::from_secs(20));
        let err = cache
            .get_or_fetch("gemini", || async { Err::<bool, _>("probe failed") })
            .await
            .unwrap_err();
        assert_eq!(err, "probe failed");
        assert_eq!(
            cache.get_with_stale("gemini").map(|r| r.data),
            Some(false)
        );
    }

    #[test]
    fn rejects_stale_shorter_than_ttl() {
        let err = HealthCheckCache::<String, bool>::new(HealthCacheConfig {
            ttl: Duration::from_secs(30),
            stale_ttl: Duration::from_secs(5),
            ..Default::default()
        });
        assert!(err.is_err());
    }
}
