//! # Agent Reliability
//!
//! Resilience and scheduling primitives for LLM-backed agent workloads:
//! bounded admission, failure isolation, retries, TTL caching and
//! dependency-aware task ordering. Everything is in-process and async on
//! Tokio; nothing here talks to the network.
//!
//! ## Components
//!
//! - **Pool**: at most `max_concurrent` operations in flight, a bounded FIFO
//!   wait queue, optional token-bucket rate limiting, graceful drain
//! - **CircuitBreaker**: `Closed -> Open -> HalfOpen` state machine that fails
//!   fast while a dependency is unhealthy
//! - **Retry**: exponential backoff with optional jitter
//! - **TtlCache / HealthCheckCache**: expiring memoization with LRU or FIFO
//!   eviction, plus a stale-while-revalidate window for health probes
//! - **TaskQueue**: priority, deadline and dependency aware scheduling with
//!   priority degradation on repeated failure
//! - **Layers**: Tower middleware for the pool, breaker and retry
//!
//! ## Getting Started
//!
//! ```rust
//! use agent_reliability::{detect_priority, Priority, PrioritizedTask, TaskQueue};
//!
//! let mut queue = TaskQueue::new();
//! queue.add(PrioritizedTask::new("fetch", detect_priority("urgent: fetch docs"), "docs"));
//! queue.add(PrioritizedTask::new("summarize", Priority::High, "summary").depends_on("fetch"));
//!
//! let task = queue.get_next().unwrap();
//! assert_eq!(task.priority, Priority::Critical);
//! assert!(queue.get_next().is_none());
//!
//! queue.complete(task.id);
//! assert_eq!(queue.get_next().unwrap().payload, "summary");
//! ```
//!
//! Running work through the full stack:
//!
//! ```rust,no_run
//! use agent_reliability::{config, BoxError, ResilienceStack};
//!
//! # async fn example() -> Result<(), BoxError> {
//! let stack = ResilienceStack::from_config("provider", &config::from_env()?)?;
//! let answer = stack
//!     .execute(|| async { Ok::<_, BoxError>("pong".to_string()) })
//!     .await?;
//! assert_eq!(answer, "pong");
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod layers;
pub mod pool;
pub mod retry;
pub mod scheduler;
mod stack;

pub use breaker::{BreakerStatus, CallTicket, CircuitBreaker, CircuitState};
pub use cache::{CacheStats, HealthCheckCache, StaleRead, TtlCache};
pub use clock::{Clock, FixedRandom, ManualClock, RandomSource, SystemClock, ThreadRandom};
pub use config::{
    CacheConfig, CircuitBreakerConfig, ConfigBuilder, EvictionPolicy, HealthCacheConfig,
    PoolConfig, RateLimitConfig, ReliabilityConfig, RetryOptions,
};
pub use error::{classify_error, BoxError, ErrorKind, ReliabilityError, Result};
pub use pool::{Pool, PoolPermit, PoolStatus};
pub use retry::{delay_for_attempt, retry, Retry, RetryBuilder};
pub use scheduler::{
    degrade, detect_priority, prioritize_tasks, FailOutcome, PrioritizedTask, Priority,
    QueueStats, TaskDraft, TaskId, TaskQueue,
};
pub use stack::{ResilienceStack, StackStatus};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};
