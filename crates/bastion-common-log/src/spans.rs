//! Span helpers for database operations.

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info_span, Instrument, Span};

/// Span for a single database operation (`query`, `exec`, `ping`, ...).
pub fn db_span(operation: &str) -> Span {
    info_span!("db", op = %operation)
}

/// Span for one schema migration step.
pub fn migration_span(version: i64, direction: &str) -> Span {
    info_span!("migration", version, direction = %direction)
}

/// Span for one health monitor tick.
pub fn health_span(tick: u64) -> Span {
    info_span!("health_check", tick)
}

/// Instrument a future with a span.
pub fn instrument_future<F: Future>(future: F, span: Span) -> impl Future<Output = F::Output> {
    future.instrument(span)
}

/// Measures how long an operation takes and logs it at debug level.
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start a new timer.
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    /// Time elapsed so far.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Complete the timer, returning the elapsed duration.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::debug!(
            operation = %self.operation,
            elapsed_ms = elapsed.as_millis() as u64,
            "operation completed"
        );
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_measures_elapsed() {
        let timer = Timer::start("sleep");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.finish() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_instrumented_future_returns_output() {
        let value = instrument_future(async { 7 }, migration_span(3, "up")).await;
        assert_eq!(value, 7);
    }

    #[test]
    fn test_spans_can_nest() {
        let outer = db_span("transaction");
        let _outer = outer.enter();
        let inner = health_span(1);
        let _inner = inner.enter();
    }
}
