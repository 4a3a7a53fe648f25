//! Error types for the database layer.

use crate::breaker::CircuitState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type DbResult<T> = Result<T, DbError>;

/// Which half of a health check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStep {
    Ping,
    Query,
}

impl fmt::Display for HealthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping => f.write_str("ping"),
            Self::Query => f.write_str("query"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid database configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("connection failed after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("health check failed at {step}: {source}")]
    HealthCheck {
        step: HealthStep,
        #[source]
        source: Box<DbError>,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    #[error("operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("circuit breaker '{breaker}' is {state}, call rejected")]
    BreakerOpen {
        breaker: String,
        state: CircuitState,
    },

    #[error("transaction commit failed: {0}")]
    CommitFailed(#[source] sqlx::Error),

    #[error("{source} (rollback also failed: {rollback})")]
    RollbackFailed {
        #[source]
        source: Box<DbError>,
        rollback: sqlx::Error,
    },

    #[error("invalid savepoint name {0:?}")]
    InvalidSavepoint(String),

    #[error("savepoint {0:?} is already active in this transaction")]
    DuplicateSavepoint(String),

    #[error("migration lock is held by {holder}")]
    LockHeld {
        holder: String,
        since: Option<DateTime<Utc>>,
    },

    #[error("migration lock is not held by {0}")]
    LockNotHeld(String),

    #[error("migration {version} ({description}) failed: {source}")]
    MigrationFailed {
        version: i64,
        description: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("migration {0} is not registered")]
    MigrationNotFound(i64),

    #[error("migration {0} is already registered")]
    DuplicateMigration(i64),

    #[error("migration version must be positive, got {0}")]
    InvalidMigrationVersion(i64),

    #[error("health monitor is already running")]
    MonitorRunning,

    /// An error produced by caller code inside a wrapped operation.
    #[error(transparent)]
    Application(#[from] anyhow::Error),
}

impl DbError {
    /// Wrap a caller-side failure message.
    pub fn app<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::Application(anyhow::Error::msg(message))
    }

    /// The innermost error, looking through retry, connection, health check
    /// and rollback wrappers.
    pub fn root_cause(&self) -> &DbError {
        let mut current = self;
        loop {
            current = match current {
                Self::ConnectionFailed { source, .. }
                | Self::HealthCheck { source, .. }
                | Self::RetriesExhausted { source, .. }
                | Self::RollbackFailed { source, .. } => source,
                other => return other,
            };
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled { .. })
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    pub fn is_lock_held(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }

    pub fn is_application(&self) -> bool {
        matches!(self.root_cause(), Self::Application(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_nested_wrappers() {
        let err = DbError::RetriesExhausted {
            attempts: 3,
            source: Box::new(DbError::RollbackFailed {
                source: Box::new(DbError::Sqlx(sqlx::Error::PoolTimedOut)),
                rollback: sqlx::Error::PoolClosed,
            }),
        };

        assert!(matches!(
            err.root_cause(),
            DbError::Sqlx(sqlx::Error::PoolTimedOut)
        ));
    }

    #[test]
    fn test_connection_failed_message_names_attempts_and_cause() {
        let err = DbError::ConnectionFailed {
            attempts: 4,
            source: Box::new(DbError::Sqlx(sqlx::Error::PoolTimedOut)),
        };
        let message = err.to_string();
        assert!(message.contains("after 4 attempts"));
        assert!(message.contains("pool timed out"));
    }

    #[test]
    fn test_application_errors_are_recognisable() {
        let err = DbError::app("insufficient balance");
        assert!(err.is_application());
        assert_eq!(err.to_string(), "insufficient balance");
        assert!(!DbError::MonitorRunning.is_application());
    }

    #[test]
    fn test_breaker_open_display() {
        let err = DbError::BreakerOpen {
            breaker: "primary".into(),
            state: CircuitState::Open,
        };
        assert!(err.is_breaker_open());
        assert_eq!(err.to_string(), "circuit breaker 'primary' is open, call rejected");
    }
}
