//! Circuit breaker: isolate a failing dependency
//!
//! State machine:
//! - `Closed` -> `Open` after `failure_threshold` consecutive failures
//! - `Open` -> `HalfOpen` once `timeout` has elapsed (checked lazily on the
//!   next call or query)
//! - `HalfOpen` -> `Closed` after `success_threshold` consecutive trial successes
//! - `HalfOpen` -> `Open` on any trial failure, restarting the cooldown
//!
//! While open, calls fail fast with [`ReliabilityError::CircuitOpen`] and the
//! wrapped operation is never invoked. While half-open, at most
//! `half_open_max_calls` trials run concurrently.
//!
//! Every transition bumps a generation counter. Outcomes reported for a
//! generation that is no longer current only update the totals, so a slow call
//! admitted while closed cannot close a breaker that has since reopened.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{deadline_after, system_clock, SharedClock};
pub use crate::config::CircuitBreakerConfig;
use crate::error::{ReliabilityError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Breaker snapshot for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    /// When an open breaker lets the next trial through
    #[serde(skip)]
    pub next_attempt_at: Option<Instant>,
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

struct Inner {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    state: Mutex<BreakerState>,
}

/// Failure isolator; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self> {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                clock,
                state: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    generation: 0,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    half_open_in_flight: 0,
                    opened_at: None,
                    total_calls: 0,
                    total_successes: 0,
                    total_failures: 0,
                    total_rejections: 0,
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run `operation` unless the breaker rejects it.
    ///
    /// Any `Err` from the operation counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<ReliabilityError>,
    {
        let ticket = self.admit()?;
        let result = operation().await;
        match &result {
            Ok(_) => ticket.succeed(),
            Err(_) => ticket.fail(),
        }
        result
    }

    /// Reserve a call; report its outcome through the returned ticket.
    ///
    /// Dropping the ticket without reporting (cancellation) frees a half-open
    /// trial slot and records nothing.
    pub fn admit(&self) -> Result<CallTicket> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut st = inner.lock();
        inner.maybe_half_open(&mut st, now);
        match st.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                st.total_rejections += 1;
                let retry_in = inner
                    .next_attempt_at(&st)
                    .map(|at| at.saturating_duration_since(now));
                debug!(breaker = %inner.name, ?retry_in, "circuit open, rejecting call");
                return Err(ReliabilityError::CircuitOpen {
                    name: inner.name.clone(),
                    retry_in,
                });
            }
            CircuitState::HalfOpen => {
                if st.half_open_in_flight >= inner.config.half_open_max_calls {
                    st.total_rejections += 1;
                    debug!(breaker = %inner.name, "half-open trial budget exhausted");
                    return Err(ReliabilityError::CircuitOpen {
                        name: inner.name.clone(),
                        retry_in: None,
                    });
                }
                st.half_open_in_flight += 1;
            }
        }
        st.total_calls += 1;
        Ok(CallTicket {
            inner: inner.clone(),
            generation: st.generation,
            trial: st.state == CircuitState::HalfOpen,
            settled: false,
        })
    }

    /// Whether a call made now would be attempted.
    pub fn is_available(&self) -> bool {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut st = inner.lock();
        inner.maybe_half_open(&mut st, now);
        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => st.half_open_in_flight < inner.config.half_open_max_calls,
        }
    }

    pub fn state(&self) -> CircuitState {
        let now = self.inner.clock.now();
        let mut st = self.inner.lock();
        self.inner.maybe_half_open(&mut st, now);
        st.state
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut st = inner.lock();
        inner.maybe_half_open(&mut st, now);
        let next_attempt_at = inner.next_attempt_at(&st);
        BreakerStatus {
            name: inner.name.clone(),
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            consecutive_successes: st.consecutive_successes,
            half_open_in_flight: st.half_open_in_flight,
            total_calls: st.total_calls,
            total_successes: st.total_successes,
            total_failures: st.total_failures,
            total_rejections: st.total_rejections,
            next_attempt_at,
            retry_in_ms: next_attempt_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }

    /// Force the breaker closed and clear its streak counters.
    pub fn reset(&self) {
        let now = self.inner.clock.now();
        let mut st = self.inner.lock();
        self.inner.transition(&mut st, CircuitState::Closed, now);
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_attempt_at(&self, st: &BreakerState) -> Option<Instant> {
        match (st.state, st.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some(deadline_after(opened, self.config.timeout))
            }
            _ => None,
        }
    }

    fn maybe_half_open(&self, st: &mut BreakerState, now: Instant) {
        if let Some(at) = self.next_attempt_at(st) {
            if now >= at {
                self.transition(st, CircuitState::HalfOpen, now);
            }
        }
    }

    fn transition(&self, st: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = st.state;
        st.state = to;
        st.generation += 1;
        st.consecutive_successes = 0;
        st.half_open_in_flight = 0;
        match to {
            CircuitState::Open => {
                st.opened_at = Some(now);
                warn!(
                    breaker = %self.name,
                    %from,
                    failures = st.consecutive_failures,
                    cooldown = ?self.config.timeout,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                st.opened_at = None;
                info!(breaker = %self.name, "circuit half-open, allowing trial calls");
            }
            CircuitState::Closed => {
                st.opened_at = None;
                st.consecutive_failures = 0;
                if from != CircuitState::Closed {
                    info!(breaker = %self.name, %from, "circuit closed");
                }
            }
        }
    }

    fn record(&self, generation: u64, trial: bool, success: bool) {
        let now = self.clock.now();
        let mut st = self.lock();
        if success {
            st.total_successes += 1;
        } else {
            st.total_failures += 1;
        }
        if generation != st.generation {
            return;
        }
        if trial {
            st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
        }
        match (st.state, success) {
            (CircuitState::Closed, true) => st.consecutive_failures = 0,
            (CircuitState::Closed, false) => {
                st.consecutive_failures += 1;
                if st.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut st, CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, true) => {
                st.consecutive_successes += 1;
                if st.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut st, CircuitState::Closed, now);
                }
            }
            (CircuitState::HalfOpen, false) => {
                st.consecutive_failures += 1;
                self.transition(&mut st, CircuitState::Open, now);
            }
            (CircuitState::Open, _) => {}
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut st = self.lock();
        if generation == st.generation {
            st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// An admitted call awaiting its outcome.
#[must_use = "report the outcome with succeed() or fail()"]
pub struct CallTicket {
    inner: Arc<Inner>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CallTicket {
    /// Whether this call is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.inner.record(self.generation, self.trial, true);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.inner.record(self.generation, self.trial, false);
    }
}

impl Drop for CallTicket {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.inner.release_trial(self.generation);
        }
    }
}
