//! Migration definitions and run reports.

use crate::error::DbResult;
use crate::transaction::Tx;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// One direction of a migration. Runs inside the transaction that also
/// updates the ledger.
pub type MigrationFn = Arc<dyn for<'t> Fn(&'t mut Tx) -> BoxFuture<'t, DbResult<()>> + Send + Sync>;

/// A versioned, reversible schema change.
#[derive(Clone)]
pub struct Migration {
    pub version: i64,
    pub description: String,
    pub(crate) up: MigrationFn,
    pub(crate) down: MigrationFn,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl Migration {
    pub fn new<U, D>(version: i64, description: impl Into<String>, up: U, down: D) -> Self
    where
        U: for<'t> Fn(&'t mut Tx) -> BoxFuture<'t, DbResult<()>> + Send + Sync + 'static,
        D: for<'t> Fn(&'t mut Tx) -> BoxFuture<'t, DbResult<()>> + Send + Sync + 'static,
    {
        Self {
            version,
            description: description.into(),
            up: Arc::new(up),
            down: Arc::new(down),
        }
    }

    /// Migration from SQL scripts. Each script may hold several statements.
    pub fn sql(
        version: i64,
        description: impl Into<String>,
        up_sql: impl Into<String>,
        down_sql: impl Into<String>,
    ) -> Self {
        let up_sql: Arc<str> = up_sql.into().into();
        let down_sql: Arc<str> = down_sql.into().into();
        Self::new(
            version,
            description,
            move |tx| {
                let sql = Arc::clone(&up_sql);
                Box::pin(async move { tx.execute_batch(&sql).await })
            },
            move |tx| {
                let sql = Arc::clone(&down_sql);
                Box::pin(async move { tx.execute_batch(&sql).await })
            },
        )
    }
}

/// A row of the migration ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i64,
}

/// A registered migration and whether it is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub version: i64,
    pub description: String,
    pub applied_at: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockStatus {
    pub locked: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    Up,
    Down,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStep {
    pub version: i64,
    pub description: String,
    /// `None` for dry runs
    pub execution_time_ms: Option<i64>,
}

/// What a migrate or rollback call did, or would do on a dry run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    pub direction: MigrationDirection,
    pub dry_run: bool,
    pub from_version: i64,
    pub to_version: i64,
    pub steps: Vec<MigrationStep>,
}

impl MigrationReport {
    pub(crate) fn new(direction: MigrationDirection, dry_run: bool, from_version: i64) -> Self {
        Self {
            direction,
            dry_run,
            from_version,
            to_version: from_version,
            steps: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, migration: &Migration, execution_time_ms: Option<i64>) {
        self.steps.push(MigrationStep {
            version: migration.version,
            description: migration.description.clone(),
            execution_time_ms,
        });
    }

    pub fn versions(&self) -> Vec<i64> {
        self.steps.iter().map(|s| s.version).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
