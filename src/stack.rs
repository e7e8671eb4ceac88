//! Breaker, pool and retry composed in one call
//!
//! `execute` runs `breaker(pool(retry(op)))`: an open breaker rejects before
//! any slot is taken, the slot is held across every retry of one logical
//! call, and the breaker sees a single outcome per call.

use std::fmt::Display;
use std::future::Future;

use serde::Serialize;
use tower::ServiceBuilder;

use crate::breaker::{BreakerStatus, CircuitBreaker};
use crate::config::ReliabilityConfig;
use crate::error::{ReliabilityError, Result};
use crate::layers::{
    CircuitBreakerLayer, CircuitBreakerService, PoolLayer, PoolService, RetryLayer, RetryService,
};
use crate::pool::{Pool, PoolStatus};
use crate::retry::{Retry, RetryOptions};

#[derive(Debug, Clone, Serialize)]
pub struct StackStatus {
    pub breaker: BreakerStatus,
    pub pool: PoolStatus,
}

#[derive(Debug, Clone)]
pub struct ResilienceStack {
    breaker: CircuitBreaker,
    pool: Pool,
    retry: Retry,
    options: RetryOptions,
}

impl ResilienceStack {
    pub fn new(breaker: CircuitBreaker, pool: Pool, options: RetryOptions) -> Self {
        Self {
            breaker,
            pool,
            retry: Retry::new(),
            options,
        }
    }

    /// Build every part from one validated config; `name` labels the breaker.
    pub fn from_config(name: impl Into<String>, config: &ReliabilityConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            CircuitBreaker::new(name, config.breaker.clone())?,
            Pool::from_config(config)?,
            config.retry.clone(),
        ))
    }

    /// Replace the retry runner, e.g. to pin jitter.
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn retry_options(&self) -> &RetryOptions {
        &self.options
    }

    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<ReliabilityError> + Display,
    {
        self.breaker
            .execute(|| {
                self.pool
                    .execute(|| self.retry.run(operation, &self.options))
            })
            .await
    }

    /// Wrap a Tower service in the same three layers.
    pub fn service<S>(&self, inner: S) -> CircuitBreakerService<PoolService<RetryService<S>>> {
        ServiceBuilder::new()
            .layer(CircuitBreakerLayer::new(self.breaker.clone()))
            .layer(PoolLayer::new(self.pool.clone()))
            .layer(RetryLayer::with_retry(self.options.clone(), self.retry.clone()))
            .service(inner)
    }

    pub fn status(&self) -> StackStatus {
        StackStatus {
            breaker: self.breaker.status(),
            pool: self.pool.status(),
        }
    }
}
