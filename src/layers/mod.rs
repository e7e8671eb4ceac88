//! Tower middleware over the pool, breaker and retry primitives
//!
//! Each layer wraps any `Service<Req, Error = BoxError>`:
//! - [`PoolLayer`] admits requests through a shared [`Pool`] and holds the
//!   slot until the inner response resolves
//! - [`CircuitBreakerLayer`] fails fast while the [`CircuitBreaker`] is open
//!   and reports every response as a success or failure
//! - [`RetryLayer`] re-sends a cloned request per [`RetryOptions`]
//!
//! Admission and fail-fast errors surface as boxed [`ReliabilityError`]s, so
//! callers can `downcast_ref` them. Inner services are shared behind an async
//! mutex that is held only while the service is polled ready and called, never
//! while its response is awaited.
//!
//! Composition mirrors [`ResilienceStack`](crate::ResilienceStack): breaker
//! outermost, retry innermost.
//!
//! ```rust,no_run
//! # use agent_reliability::{CircuitBreaker, Pool, ReliabilityConfig, RetryOptions};
//! # use agent_reliability::layers::{CircuitBreakerLayer, PoolLayer, RetryLayer};
//! # use tower::{BoxError, ServiceBuilder};
//! # fn build() -> Result<(), BoxError> {
//! let config = ReliabilityConfig::default();
//! let svc = ServiceBuilder::new()
//!     .layer(CircuitBreakerLayer::new(CircuitBreaker::new("provider", config.breaker.clone())?))
//!     .layer(PoolLayer::new(Pool::from_config(&config)?))
//!     .layer(RetryLayer::new(config.retry.clone()))
//!     .service(tower::service_fn(|prompt: String| async move { Ok::<_, BoxError>(prompt.len()) }));
//! # let _ = svc;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tower::{BoxError, Layer, Service, ServiceExt};

use crate::breaker::CircuitBreaker;
use crate::pool::Pool;
use crate::retry::{Retry, RetryOptions};

#[cfg(doc)]
use crate::error::ReliabilityError;

async fn call_shared<S, Req>(inner: Arc<Mutex<S>>, req: Req) -> Result<S::Response, BoxError>
where
    S: Service<Req, Error = BoxError>,
{
    let fut = {
        let mut svc = inner.lock().await;
        ServiceExt::<Req>::ready(&mut *svc).await?.call(req)
    };
    fut.await
}

// ===== Pool =====

#[derive(Clone, Debug)]
pub struct PoolLayer {
    pool: Pool,
}

impl PoolLayer {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl<S> Layer<S> for PoolLayer {
    type Service = PoolService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PoolService {
            inner: Arc::new(Mutex::new(inner)),
            pool: self.pool.clone(),
        }
    }
}

pub struct PoolService<S> {
    inner: Arc<Mutex<S>>,
    pool: Pool,
}

impl<S> Clone for PoolService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<S> PoolService<S> {
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl<S, Req> Service<Req> for PoolService<S>
where
    Req: Send + 'static,
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // admission happens per call, where waiting is bounded by the pool
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let pool = self.pool.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let _permit = pool.acquire().await?;
            call_shared(inner, req).await
        })
    }
}

// ===== Circuit breaker =====

#[derive(Clone, Debug)]
pub struct CircuitBreakerLayer {
    breaker: CircuitBreaker,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner: Arc::new(Mutex::new(inner)),
            breaker: self.breaker.clone(),
        }
    }
}

pub struct CircuitBreakerService<S> {
    inner: Arc<Mutex<S>>,
    breaker: CircuitBreaker,
}

impl<S> Clone for CircuitBreakerService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            breaker: self.breaker.clone(),
        }
    }
}

impl<S> CircuitBreakerService<S> {
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl<S, Req> Service<Req> for CircuitBreakerService<S>
where
    Req: Send + 'static,
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let breaker = self.breaker.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            let ticket = breaker.admit()?;
            let result = call_shared(inner, req).await;
            match &result {
                Ok(_) => ticket.succeed(),
                Err(_) => ticket.fail(),
            }
            result
        })
    }
}

// ===== Retry =====

#[derive(Clone, Debug)]
pub struct RetryLayer {
    options: RetryOptions,
    retry: Retry,
}

impl RetryLayer {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            retry: Retry::new(),
        }
    }

    /// Use an explicit retry runner, e.g. one with fixed jitter.
    pub fn with_retry(options: RetryOptions, retry: Retry) -> Self {
        Self { options, retry }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner: Arc::new(Mutex::new(inner)),
            options: self.options.clone(),
            retry: self.retry.clone(),
        }
    }
}

pub struct RetryService<S> {
    inner: Arc<Mutex<S>>,
    options: RetryOptions,
    retry: Retry,
}

impl<S> Clone for RetryService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            options: self.options.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<S, Req> Service<Req> for RetryService<S>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let options = self.options.clone();
        let retry = self.retry.clone();
        Box::pin(async move {
            retry
                .run(move || call_shared(inner.clone(), req.clone()), &options)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedRandom, ManualClock};
    use crate::config::{CircuitBreakerConfig, PoolConfig, RateLimitConfig};
    use crate::error::ReliabilityError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::service_fn;

    fn no_jitter(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_layer_eventually_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let svc = service_fn(move |n: u32| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err::<u32, BoxError>("transient".into())
                } else {
                    Ok(n * 2)
                }
            }
        });
        let mut svc = RetryLayer::with_retry(no_jitter(5), Retry::with_random(Arc::new(FixedRandom(1.0))))
            .layer(svc);

        let out = ServiceExt::<u32>::ready(&mut svc).await.unwrap().call(21).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_layer_returns_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let svc = service_fn(move |()| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), BoxError>(format!("failure {n}").into()) }
        });
        let mut svc = RetryLayer::new(no_jitter(2)).layer(svc);

        let err = ServiceExt::<()>::ready(&mut svc).await.unwrap().call(()).await.unwrap_err();
        assert_eq!(err.to_string(), "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_layer_accepts_send_only_requests() {
        // `Cell` is `Send` but not `Sync`
        #[derive(Clone)]
        struct Prompt(std::cell::Cell<u32>);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let svc = service_fn(move |prompt: Prompt| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let tokens = prompt.0.get();
            async move {
                if n == 0 {
                    Err::<u32, BoxError>("overloaded".into())
                } else {
                    Ok(tokens + 1)
                }
            }
        });
        let svc = RetryLayer::new(no_jitter(1)).layer(svc);

        let fut: BoxFuture<'static, Result<u32, BoxError>> = {
            let mut svc = svc.clone();
            svc.call(Prompt(std::cell::Cell::new(41)))
        };
        let out = tokio::spawn(fut).await.unwrap().unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn breaker_layer_fails_fast_when_open() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock(
            "flaky",
            CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                timeout: Duration::from_secs(5),
                half_open_max_calls: 1,
            },
            Arc::new(clock.clone()),
        )
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let svc = service_fn(move |fail: bool| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if fail {
                    Err::<&str, BoxError>("boom".into())
                } else {
                    Ok("ok")
                }
            }
        });
        let mut svc = CircuitBreakerLayer::new(breaker.clone()).layer(svc);

        for _ in 0..2 {
            let _ = ServiceExt::<bool>::ready(&mut svc).await.unwrap().call(true).await;
        }
        let err = ServiceExt::<bool>::ready(&mut svc).await.unwrap().call(false).await.unwrap_err();
        let err = err.downcast_ref::<ReliabilityError>().unwrap();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        clock.advance(Duration::from_secs(5));
        let ok = ServiceExt::<bool>::ready(&mut svc).await.unwrap().call(false).await.unwrap();
        assert_eq!(ok, "ok");
        assert!(svc.breaker().is_available());
    }

    #[tokio::test]
    async fn pool_layer_limits_concurrency() {
        let pool = Pool::new(
            PoolConfig {
                max_concurrent: 2,
                max_queue_size: 10,
                acquire_timeout: Duration::from_secs(5),
            },
            RateLimitConfig::default(),
        )
        .unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let svc = service_fn(move |ms: u64| {
            let (a, p) = (a.clone(), p.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok::<u64, BoxError>(ms)
            }
        });
        let svc = PoolLayer::new(pool.clone()).layer(svc);

        let calls = (0..6).map(|i| {
            let mut svc = svc.clone();
            async move { svc.call(5 + i).await }
        });
        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.status().active, 0);
    }

    #[tokio::test]
    async fn pool_layer_surfaces_queue_full() {
        let pool = Pool::new(
            PoolConfig {
                max_concurrent: 1,
                max_queue_size: 0,
                acquire_timeout: Duration::from_secs(1),
            },
            RateLimitConfig::default(),
        )
        .unwrap();
        let _held = pool.acquire().await.unwrap();
        let mut svc = PoolLayer::new(pool).layer(service_fn(|()| async { Ok::<_, BoxError>(()) }));

        let err = svc.call(()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReliabilityError>(),
            Some(ReliabilityError::QueueFull { .. })
        ));
    }
}
