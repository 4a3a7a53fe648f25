//! Retry with exponential backoff, and transient-error classification.

use crate::error::{DbError, DbResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound of the random extra delay, as a fraction of the base backoff.
pub const MAX_JITTER_FRACTION: f64 = 0.3;

/// Decides which failures are transient and worth another attempt.
///
/// Implementors only need to map driver error codes; the provided methods
/// handle timeouts, I/O and pool exhaustion the same way for every backend.
pub trait ErrorClassifier: Send + Sync + fmt::Debug {
    /// Whether a driver error code names a transient condition.
    fn is_retryable_code(&self, code: &str) -> bool;

    fn is_retryable(&self, err: &DbError) -> bool {
        match err {
            DbError::Sqlx(e) | DbError::CommitFailed(e) => self.is_retryable_sqlx(e),
            DbError::Timeout { .. } => true,
            _ => false,
        }
    }

    fn is_retryable_sqlx(&self, err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => {
                db.code()
                    .as_deref()
                    .map_or(false, |code| self.is_retryable_code(code))
                    || db.message().to_lowercase().contains("too many connections")
            }
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            _ => false,
        }
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_PROTOCOL: i32 = 15;

/// SQLite result codes: BUSY, LOCKED and PROTOCOL, including extended codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteClassifier;

impl ErrorClassifier for SqliteClassifier {
    fn is_retryable_code(&self, code: &str) -> bool {
        code.parse::<i32>().map_or(false, |code| {
            matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED | SQLITE_PROTOCOL)
        })
    }
}

/// PostgreSQL SQLSTATEs: serialization failure, deadlock, connection
/// exceptions, too many connections and cannot-connect-now.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresClassifier;

impl ErrorClassifier for PostgresClassifier {
    fn is_retryable_code(&self, code: &str) -> bool {
        matches!(code, "40001" | "40P01" | "53300" | "57P03") || code.starts_with("08")
    }
}

/// Classify with the given classifier. Free function for call sites that do
/// not hold an executor.
pub fn is_retryable_error(classifier: &dyn ErrorClassifier, err: &DbError) -> bool {
    classifier.is_retryable(err)
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    /// Add up to 30% random extra delay to each backoff
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval_ms: 100,
            max_interval_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval_ms: initial.as_millis() as u64,
            max_interval_ms: max.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.max_attempts == 0 {
            return Err(DbError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(DbError::Config(format!(
                "retry.multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_interval_ms > self.max_interval_ms {
            return Err(DbError::Config(
                "retry.initial_interval_ms exceeds retry.max_interval_ms".into(),
            ));
        }
        Ok(())
    }

    /// Base delay after failed attempt `attempt` (1-based), before jitter:
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval_ms as f64 * self.multiplier.powi(exponent);
        let capped = if base.is_finite() {
            base.min(self.max_interval_ms as f64)
        } else {
            self.max_interval_ms as f64
        };
        Duration::from_micros((capped * 1000.0).round() as u64)
    }

    /// Delay to sleep after failed attempt `attempt`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if !self.jitter {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=MAX_JITTER_FRACTION);
        base.mul_f64(1.0 + extra)
    }
}

/// Sleep for `delay`, returning early with `Cancelled` if the token fires.
pub(crate) async fn sleep_or_cancel(
    cancel: &CancellationToken,
    delay: Duration,
    operation: &'static str,
) -> DbResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DbError::Cancelled { operation }),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Runs operations under a retry policy.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: Arc<dyn ErrorClassifier>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self { policy, classifier }
    }

    pub fn sqlite(policy: RetryPolicy) -> Self {
        Self::new(policy, Arc::new(SqliteClassifier))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_retryable(&self, err: &DbError) -> bool {
        self.classifier.is_retryable(err)
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts or
    /// `cancel` fires. Exhaustion wraps the last error with the attempt count.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DbError::Cancelled { operation: "retryable operation" }),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.classifier.is_retryable(&err) {
                debug!(attempt, error = %err, "permanent error, not retrying");
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %err, "retries exhausted");
                return Err(DbError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.delay(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient database error, retrying"
            );
            sleep_or_cancel(cancel, delay, "retry backoff").await?;
        }
    }
}
