//! Configuration for the reliability core
//!
//! Every component takes its own config struct; [`ReliabilityConfig`] groups
//! them for loading from the environment or a TOML file. Durations are written
//! as integer milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ReliabilityError, Result};

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Pool concurrency settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum operations executing at once
    pub max_concurrent: usize,

    /// Maximum callers waiting for a slot
    pub max_queue_size: usize,

    /// Upper bound on a caller's total wait for admission
    #[serde(with = "millis")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_queue_size: 100,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(ReliabilityError::invalid_config(
                "pool.max_concurrent must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Token bucket admission settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Tokens added every `interval`
    pub tokens_per_interval: u32,

    #[serde(with = "millis")]
    pub interval: Duration,

    /// Bucket capacity
    pub max_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tokens_per_interval: 10,
            interval: Duration::from_secs(1),
            max_burst: 20,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.tokens_per_interval == 0 {
            return Err(ReliabilityError::invalid_config(
                "rate_limit.tokens_per_interval must be greater than 0",
            ));
        }
        if self.interval.is_zero() {
            return Err(ReliabilityError::invalid_config(
                "rate_limit.interval must be non-zero",
            ));
        }
        if self.max_burst < self.tokens_per_interval {
            return Err(ReliabilityError::invalid_config(format!(
                "rate_limit.max_burst ({}) must be >= tokens_per_interval ({})",
                self.max_burst, self.tokens_per_interval
            )));
        }
        Ok(())
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,

    /// Cooldown spent open before trials are allowed
    #[serde(with = "millis")]
    pub timeout: Duration,

    /// Concurrent trial calls while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("failure_threshold", self.failure_threshold),
            ("success_threshold", self.success_threshold),
            ("half_open_max_calls", self.half_open_max_calls),
        ] {
            if value == 0 {
                return Err(ReliabilityError::invalid_config(format!(
                    "breaker.{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Re-attempts after the first call
    pub max_retries: u32,

    #[serde(with = "millis")]
    pub base_delay: Duration,

    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Randomize each delay within `[0, delay]`
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_delay < self.base_delay {
            return Err(ReliabilityError::invalid_config(
                "retry.max_delay must be >= retry.base_delay",
            ));
        }
        Ok(())
    }
}

/// Which entry goes when the cache is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently read
    #[default]
    Lru,
    /// Oldest insertion
    Fifo,
}

impl std::str::FromStr for EvictionPolicy {
    type Err = ReliabilityError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "fifo" => Ok(EvictionPolicy::Fifo),
            other => Err(ReliabilityError::invalid_config(format!(
                "unknown eviction policy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default entry lifetime
    #[serde(with = "millis")]
    pub ttl: Duration,

    pub max_size: usize,

    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_size: 1000,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(ReliabilityError::invalid_config(
                "cache.max_size must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Health-check cache: a fresh window plus a longer stale window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCacheConfig {
    #[serde(with = "millis")]
    pub ttl: Duration,

    #[serde(with = "millis")]
    pub stale_ttl: Duration,

    pub max_size: usize,

    pub eviction_policy: EvictionPolicy,
}

impl Default for HealthCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            stale_ttl: Duration::from_secs(300),
            max_size: 100,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

impl HealthCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stale_ttl < self.ttl {
            return Err(ReliabilityError::invalid_config(
                "health_cache.stale_ttl must be >= health_cache.ttl",
            ));
        }
        if self.max_size == 0 {
            return Err(ReliabilityError::invalid_config(
                "health_cache.max_size must be at least 1",
            ));
        }
        Ok(())
    }
}

/// All component settings in one document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryOptions,
    pub cache: CacheConfig,
    pub health_cache: HealthCacheConfig,
}

impl ReliabilityConfig {
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.rate_limit.validate()?;
        self.breaker.validate()?;
        self.retry.validate()?;
        self.cache.validate()?;
        self.health_cache.validate()
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: ReliabilityConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ReliabilityConfig::default(),
        }
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.config.pool.max_concurrent = n;
        self
    }

    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.config.pool.max_queue_size = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.acquire_timeout = timeout;
        self
    }

    pub fn rate_limit(mut self, tokens_per_interval: u32, interval: Duration, max_burst: u32) -> Self {
        self.config.rate_limit = RateLimitConfig {
            enabled: true,
            tokens_per_interval,
            interval,
            max_burst,
        };
        self
    }

    pub fn breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.config.breaker = breaker;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    pub fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.retry.base_delay = base;
        self.config.retry.max_delay = max;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.retry.jitter = enabled;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn health_cache(mut self, health: HealthCacheConfig) -> Self {
        self.config.health_cache = health;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<ReliabilityConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

const ENV_PREFIX: &str = "RELIABILITY_";

/// Load configuration from `RELIABILITY_*` environment variables over defaults
pub fn from_env() -> Result<ReliabilityConfig> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Same as [`from_env`] with an explicit variable source.
pub fn from_lookup<F>(lookup: F) -> Result<ReliabilityConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ReliabilityConfig::default();
    let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
        raw.trim().parse::<T>().map_err(|_| {
            ReliabilityError::invalid_config(format!("{ENV_PREFIX}{name}: cannot parse '{raw}'"))
        })
    }
    fn parse_bool(name: &str, raw: &str) -> Result<bool> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ReliabilityError::invalid_config(format!(
                "{ENV_PREFIX}{name}: expected a boolean, got '{raw}'"
            ))),
        }
    }
    let ms = |name: &str, raw: &str| parse::<u64>(name, raw).map(Duration::from_millis);

    if let Some(v) = get("MAX_CONCURRENT") {
        config.pool.max_concurrent = parse("MAX_CONCURRENT", &v)?;
    }
    if let Some(v) = get("MAX_QUEUE_SIZE") {
        config.pool.max_queue_size = parse("MAX_QUEUE_SIZE", &v)?;
    }
    if let Some(v) = get("ACQUIRE_TIMEOUT_MS") {
        config.pool.acquire_timeout = ms("ACQUIRE_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = get("RATE_LIMIT") {
        config.rate_limit.enabled = parse_bool("RATE_LIMIT", &v)?;
    }
    if let Some(v) = get("TOKENS_PER_INTERVAL") {
        config.rate_limit.tokens_per_interval = parse("TOKENS_PER_INTERVAL", &v)?;
    }
    if let Some(v) = get("RATE_INTERVAL_MS") {
        config.rate_limit.interval = ms("RATE_INTERVAL_MS", &v)?;
    }
    if let Some(v) = get("MAX_BURST") {
        config.rate_limit.max_burst = parse("MAX_BURST", &v)?;
    }
    if let Some(v) = get("FAILURE_THRESHOLD") {
        config.breaker.failure_threshold = parse("FAILURE_THRESHOLD", &v)?;
    }
    if let Some(v) = get("SUCCESS_THRESHOLD") {
        config.breaker.success_threshold = parse("SUCCESS_THRESHOLD", &v)?;
    }
    if let Some(v) = get("BREAKER_TIMEOUT_MS") {
        config.breaker.timeout = ms("BREAKER_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = get("HALF_OPEN_MAX_CALLS") {
        config.breaker.half_open_max_calls = parse("HALF_OPEN_MAX_CALLS", &v)?;
    }
    if let Some(v) = get("MAX_RETRIES") {
        config.retry.max_retries = parse("MAX_RETRIES", &v)?;
    }
    if let Some(v) = get("BASE_DELAY_MS") {
        config.retry.base_delay = ms("BASE_DELAY_MS", &v)?;
    }
    if let Some(v) = get("MAX_DELAY_MS") {
        config.retry.max_delay = ms("MAX_DELAY_MS", &v)?;
    }
    if let Some(v) = get("JITTER") {
        config.retry.jitter = parse_bool("JITTER", &v)?;
    }
    if let Some(v) = get("CACHE_TTL_MS") {
        config.cache.ttl = ms("CACHE_TTL_MS", &v)?;
    }
    if let Some(v) = get("CACHE_MAX_SIZE") {
        config.cache.max_size = parse("CACHE_MAX_SIZE", &v)?;
    }
    if let Some(v) = get("CACHE_EVICTION") {
        config.cache.eviction_policy = v.parse()?;
    }

    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file; missing keys take defaults
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<ReliabilityConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: ReliabilityConfig = toml::from_str(&contents)
        .map_err(|e| ReliabilityError::invalid_config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
