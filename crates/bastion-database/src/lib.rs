//! Bastion database resilience layer.
//!
//! Wraps a SQLite connection pool with the pieces a long-running service
//! needs to survive a flaky database:
//!
//! - [`Database`]: pool setup, retried connects, health checks and statistics
//! - [`TransactionManager`]: scoped transactions that always commit or roll back
//! - [`RetryExecutor`]: exponential backoff for transient errors
//! - [`CircuitBreaker`] and [`GuardedDatabase`]: stop calling a failing database
//! - [`HealthMonitor`]: periodic checks with alert callbacks
//! - [`MigrationManager`]: versioned migrations under a cross-process lock

pub mod breaker;
pub mod config;
pub mod connection;
pub mod error;
pub mod guarded;
pub mod migration;
pub mod monitor;
pub mod params;
pub mod retry;
pub mod transaction;

#[cfg(test)]
mod test_support;

pub use breaker::{BreakerMetrics, CircuitBreaker, CircuitState};
pub use config::{
    CircuitBreakerConfig, DatabaseConfig, HealthMonitorConfig, ResilienceConfig, SynchronousMode,
};
pub use connection::{Database, PoolStats};
pub use error::{DbError, DbResult};
pub use guarded::GuardedDatabase;
pub use migration::{Migration, MigrationManager, MigrationReport};
pub use monitor::{AlertSeverity, HealthAlert, HealthMetrics, HealthMonitor};
pub use params::Param;
pub use retry::{
    is_retryable_error, ErrorClassifier, PostgresClassifier, RetryExecutor, RetryPolicy,
    SqliteClassifier,
};
pub use transaction::{IsolationLevel, TransactionManager, Tx, TxOptions};

pub use futures::future::BoxFuture;
pub use tokio_util::sync::CancellationToken;
