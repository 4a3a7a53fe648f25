//! Circuit breaker that stops calling a failing database.
//!
//! State is tracked per generation: every transition starts a new generation
//! and clears the counters, and results reported for an older generation are
//! ignored. Only errors the classifier considers transient count as failures;
//! application errors count as successes so bad input cannot trip the breaker.

use crate::config::CircuitBreakerConfig;
use crate::error::{DbError, DbResult};
use crate::retry::{ErrorClassifier, SqliteClassifier};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// Counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Totals since the breaker was created or last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifetimeTotals {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub trips: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub generation: u64,
    pub counts: Counts,
    pub totals: LifetimeTotals,
    pub last_trip: Option<DateTime<Utc>>,
    /// When an open breaker will admit a probe
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    totals: LifetimeTotals,
    expiry: Option<Instant>,
    last_trip: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            counts: Counts::default(),
            totals: LifetimeTotals::default(),
            expiry: None,
            last_trip: None,
            next_attempt_at: None,
        }
    }
}

/// Called with `(breaker name, from, to)` on every transition. Runs while the
/// breaker lock is held, so it must not call back into the breaker.
pub type StateListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    classifier: Arc<dyn ErrorClassifier>,
    state: Mutex<BreakerState>,
    listener: Option<StateListener>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Self {
        let name = name.into();
        let mut config = config;
        if let Err(e) = config.validate() {
            warn!(breaker = %name, error = %e, "clamping circuit breaker limits to 1");
            config.max_failures = config.max_failures.max(1);
            config.max_requests = config.max_requests.max(1);
        }
        Self {
            name,
            config,
            classifier,
            state: Mutex::new(BreakerState::new()),
            listener: None,
        }
    }

    /// Breaker using the SQLite classifier.
    pub fn sqlite(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::new(name, config, Arc::new(SqliteClassifier))
    }

    pub fn with_state_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose timeout elapsed reports half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.state.lock();
        self.current_state(&mut inner, Instant::now())
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let mut inner = self.state.lock();
        let state = self.current_state(&mut inner, Instant::now());
        BreakerMetrics {
            name: self.name.clone(),
            state,
            generation: inner.generation,
            counts: inner.counts,
            totals: inner.totals,
            last_trip: inner.last_trip,
            next_attempt_at: inner.next_attempt_at,
        }
    }

    /// Force the breaker closed and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.state.lock();
        self.transition(&mut inner, CircuitState::Closed, Instant::now());
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.totals = LifetimeTotals::default();
        inner.last_trip = None;
        info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Whether `err` counts against the breaker.
    pub fn is_failure(&self, err: &DbError) -> bool {
        self.classifier.is_retryable(err.root_cause())
    }

    /// Run `op` if the breaker admits it and record the outcome.
    ///
    /// Rejected calls return [`DbError::BreakerOpen`] without running `op`.
    /// A panic in `op` is recorded as a failure and then resumed. A cancelled
    /// call records nothing and frees its slot.
    pub async fn execute<T, F, Fut>(&self, op: F) -> DbResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let generation = self.before_call()?;
        let mut call = PendingCall {
            breaker: self,
            generation,
            done: false,
        };

        match AssertUnwindSafe(op()).catch_unwind().await {
            Ok(result) => {
                match &result {
                    // Dropping `call` unfinished abandons it.
                    Err(err) if err.is_cancelled() => {}
                    Ok(_) => call.finish(true),
                    Err(err) => call.finish(!self.is_failure(err)),
                }
                result
            }
            Err(payload) => {
                call.finish(false);
                std::panic::resume_unwind(payload)
            }
        }
    }

    /// Like [`execute`](Self::execute), but hands any error, including a
    /// rejection, to `fallback` and returns its result instead.
    pub async fn execute_with_fallback<T, F, Fut, FB, FbFut>(&self, op: F, fallback: FB) -> DbResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
        FB: FnOnce(DbError) -> FbFut,
        FbFut: Future<Output = DbResult<T>>,
    {
        match self.execute(op).await {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(breaker = %self.name, error = %err, "using fallback");
                fallback(err).await
            }
        }
    }

    fn before_call(&self) -> DbResult<u64> {
        let mut inner = self.state.lock();
        let state = self.current_state(&mut inner, Instant::now());

        let rejected = match state {
            CircuitState::Open => true,
            CircuitState::HalfOpen => inner.counts.requests >= self.config.max_requests,
            CircuitState::Closed => false,
        };
        if rejected {
            inner.totals.rejections += 1;
            return Err(DbError::BreakerOpen {
                breaker: self.name.clone(),
                state,
            });
        }

        inner.counts.on_request();
        inner.totals.requests += 1;
        Ok(inner.generation)
    }

    fn after_call(&self, generation: u64, success: bool) {
        let mut inner = self.state.lock();
        let now = Instant::now();
        let state = self.current_state(&mut inner, now);
        if generation != inner.generation {
            return;
        }

        if success {
            inner.counts.on_success();
            inner.totals.successes += 1;
            if state == CircuitState::HalfOpen
                && inner.counts.consecutive_successes >= self.config.max_requests
            {
                self.transition(&mut inner, CircuitState::Closed, now);
            }
        } else {
            inner.counts.on_failure();
            inner.totals.failures += 1;
            let trip = match state {
                CircuitState::Closed => inner.counts.consecutive_failures >= self.config.max_failures,
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            };
            if trip {
                self.transition(&mut inner, CircuitState::Open, now);
            }
        }
    }

    // A call that never reported back frees its half-open slot.
    fn abandon(&self, generation: u64) {
        let mut inner = self.state.lock();
        if inner.generation == generation {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
    }

    fn current_state(&self, inner: &mut BreakerState, now: Instant) -> CircuitState {
        if inner.state == CircuitState::Open && inner.expiry.map_or(false, |at| at <= now) {
            self.transition(inner, CircuitState::HalfOpen, now);
        }
        inner.state
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.generation += 1;
        inner.counts = Counts::default();

        match to {
            CircuitState::Open => {
                let timeout = self.config.timeout();
                inner.expiry = Some(now + timeout);
                inner.last_trip = Some(Utc::now());
                inner.next_attempt_at = chrono::Duration::from_std(timeout)
                    .ok()
                    .map(|d| Utc::now() + d);
                inner.totals.trips += 1;
                warn!(
                    breaker = %self.name,
                    from = %from,
                    timeout_ms = self.config.timeout_ms,
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.expiry = None;
                inner.next_attempt_at = None;
                info!(breaker = %self.name, "circuit breaker half-open, probing");
            }
            CircuitState::Closed => {
                inner.expiry = None;
                inner.next_attempt_at = None;
                info!(breaker = %self.name, from = %from, "circuit breaker closed");
            }
        }

        if let Some(listener) = &self.listener {
            listener(&self.name, from, to);
        }
    }
}

struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    done: bool,
}

impl PendingCall<'_> {
    fn finish(&mut self, success: bool) {
        self.done = true;
        self.breaker.after_call(self.generation, success);
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.abandon(self.generation);
        }
    }
}
