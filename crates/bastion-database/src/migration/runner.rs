//! Versioned migrations applied under the migration lock.

use super::lock::LockGuard;
use super::types::{
    AppliedMigration, Migration, MigrationDirection, MigrationReport, MigrationStatus,
};
use crate::connection::Database;
use crate::error::{DbError, DbResult};
use crate::params;
use crate::transaction::{panic_message, TransactionManager};
use bastion_common_log::spans::{instrument_future, migration_span};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use sqlx::Row;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const CREATE_LEDGER: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL,
    execution_time_ms INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS schema_migration_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    locked INTEGER NOT NULL DEFAULT 0,
    locked_at TEXT,
    locked_by TEXT
);
INSERT OR IGNORE INTO schema_migration_lock (id, locked) VALUES (1, 0);
"#;

/// Applies and rolls back registered migrations.
///
/// Every state-changing run holds the migration lock for its whole duration
/// and applies each migration, together with its ledger row, in one
/// transaction. Cancellation is honoured between migrations only.
#[derive(Debug)]
pub struct MigrationManager {
    pub(crate) db: Database,
    transactions: TransactionManager,
    migrations: BTreeMap<i64, Migration>,
    identifier: String,
}

impl MigrationManager {
    pub fn new(db: Database) -> Self {
        let identifier = format!("migrator-{}-{}", std::process::id(), uuid::Uuid::new_v4().simple());
        Self {
            transactions: TransactionManager::new(db.clone()),
            db,
            migrations: BTreeMap::new(),
            identifier,
        }
    }

    /// Lock holder name for this manager.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn register(&mut self, migration: Migration) -> DbResult<()> {
        if migration.version <= 0 {
            return Err(DbError::InvalidMigrationVersion(migration.version));
        }
        if self.migrations.contains_key(&migration.version) {
            return Err(DbError::DuplicateMigration(migration.version));
        }
        self.migrations.insert(migration.version, migration);
        Ok(())
    }

    pub fn register_all(&mut self, migrations: impl IntoIterator<Item = Migration>) -> DbResult<()> {
        migrations.into_iter().try_for_each(|m| self.register(m))
    }

    /// Registered migrations in version order.
    pub fn migrations(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    pub fn latest_version(&self) -> i64 {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    /// Create the ledger and lock tables if missing. Safe to call repeatedly.
    pub async fn initialize(&self, cancel: &CancellationToken) -> DbResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DbError::Cancelled { operation: "initialize migrations" }),
            result = self.db.execute_batch(CREATE_LEDGER) => result,
        }
    }

    /// Highest applied version, or 0.
    pub async fn current_version(&self) -> DbResult<i64> {
        let row = self
            .db
            .fetch_optional("SELECT COALESCE(MAX(version), 0) AS version FROM schema_migrations", &[])
            .await?;
        Ok(row.map(|r| r.try_get::<i64, _>("version")).transpose()?.unwrap_or(0))
    }

    /// Ledger rows in version order.
    pub async fn applied(&self) -> DbResult<Vec<AppliedMigration>> {
        let rows = self
            .db
            .fetch_all(
                "SELECT version, description, applied_at, execution_time_ms \
                 FROM schema_migrations ORDER BY version",
                &[],
            )
            .await?;

        rows.iter()
            .map(|row| -> DbResult<AppliedMigration> {
                Ok(AppliedMigration {
                    version: row.try_get("version")?,
                    description: row.try_get("description")?,
                    applied_at: row.try_get::<DateTime<Utc>, _>("applied_at")?,
                    execution_time_ms: row.try_get("execution_time_ms")?,
                })
            })
            .collect()
    }

    /// Registered migrations newer than the current version. A version
    /// registered below the current one is never applied and is not pending.
    pub async fn pending(&self) -> DbResult<Vec<Migration>> {
        let current = self.current_version().await?;
        Ok(self
            .migrations
            .range(current.saturating_add(1)..)
            .map(|(_, m)| m.clone())
            .collect())
    }

    /// Every registered migration with its applied time, if any.
    pub async fn status(&self) -> DbResult<Vec<MigrationStatus>> {
        let applied = self.applied().await?;
        Ok(self
            .migrations
            .values()
            .map(|m| MigrationStatus {
                version: m.version,
                description: m.description.clone(),
                applied_at: applied
                    .iter()
                    .find(|a| a.version == m.version)
                    .map(|a| a.applied_at),
            })
            .collect())
    }

    pub async fn migrate_latest(&self, cancel: &CancellationToken, dry_run: bool) -> DbResult<MigrationReport> {
        self.migrate_to(cancel, self.latest_version(), dry_run).await
    }

    /// Apply pending migrations up to and including `target`, in version
    /// order. A dry run reports the plan without locking or writing.
    #[instrument(skip(self, cancel), fields(identifier = %self.identifier))]
    pub async fn migrate_to(
        &self,
        cancel: &CancellationToken,
        target: i64,
        dry_run: bool,
    ) -> DbResult<MigrationReport> {
        self.initialize(cancel).await?;

        if dry_run {
            let current = self.current_version().await?;
            let plan = self.plan_up(current, target);
            let mut report = MigrationReport::new(MigrationDirection::Up, true, current);
            for migration in &plan {
                info!(version = migration.version, description = %migration.description, "dry run: would apply");
                report.record(migration, None);
                report.to_version = migration.version;
            }
            return Ok(report);
        }

        self.locked(cancel, async {
            let current = self.current_version().await?;
            let plan = self.plan_up(current, target);
            if plan.is_empty() {
                info!(current, target, "schema is up to date");
            }

            let mut report = MigrationReport::new(MigrationDirection::Up, false, current);
            for migration in &plan {
                if cancel.is_cancelled() {
                    warn!(applied = report.steps.len(), "migration run cancelled");
                    return Err(DbError::Cancelled { operation: "migration run" });
                }
                let elapsed = self.apply(migration, MigrationDirection::Up).await?;
                report.record(migration, Some(elapsed));
                report.to_version = migration.version;
            }
            Ok(report)
        })
        .await
    }

    /// Roll back the `steps` most recently applied migrations, newest first.
    #[instrument(skip(self, cancel), fields(identifier = %self.identifier))]
    pub async fn rollback(&self, cancel: &CancellationToken, steps: usize) -> DbResult<MigrationReport> {
        self.initialize(cancel).await?;

        self.locked(cancel, async {
            let applied = self.applied().await?;
            let keep = applied.len().saturating_sub(steps);

            let mut plan = Vec::with_capacity(applied.len() - keep);
            for record in applied[keep..].iter().rev() {
                let migration = self
                    .migrations
                    .get(&record.version)
                    .ok_or(DbError::MigrationNotFound(record.version))?;
                plan.push(migration);
            }

            let current = applied.last().map_or(0, |a| a.version);
            let mut report = MigrationReport::new(MigrationDirection::Down, false, current);
            for migration in plan {
                if cancel.is_cancelled() {
                    warn!(rolled_back = report.steps.len(), "rollback cancelled");
                    return Err(DbError::Cancelled { operation: "migration rollback" });
                }
                let elapsed = self.apply(migration, MigrationDirection::Down).await?;
                report.record(migration, Some(elapsed));
            }
            report.to_version = keep.checked_sub(1).map_or(0, |i| applied[i].version);
            Ok(report)
        })
        .await
    }

    /// Registered versions in `(current, target]`, ascending.
    fn plan_up(&self, current: i64, target: i64) -> Vec<&Migration> {
        if target <= current {
            return Vec::new();
        }
        self.migrations
            .range(current.saturating_add(1)..=target)
            .map(|(_, m)| m)
            .collect()
    }

    /// Run `work` while holding the lock. The lock is released on every
    /// exit path; a panic in `work` is re-raised after the release.
    async fn locked<T, F>(&self, cancel: &CancellationToken, work: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        self.acquire_lock(cancel, &self.identifier).await?;
        let guard = LockGuard::new(self.db.clone(), self.identifier.clone());

        let outcome = AssertUnwindSafe(work).catch_unwind().await;
        let released = guard.release().await;

        match outcome {
            Ok(Ok(value)) => released.map(|()| value),
            Ok(Err(err)) => {
                if let Err(e) = released {
                    error!(error = %e, "failed to release migration lock");
                }
                Err(err)
            }
            Err(payload) => {
                error!(panic = %panic_message(payload.as_ref()), "panic during migration run");
                if let Err(e) = released {
                    error!(error = %e, "failed to release migration lock");
                }
                std::panic::resume_unwind(payload)
            }
        }
    }

    /// Apply one migration and its ledger change in a single transaction.
    async fn apply(&self, migration: &Migration, direction: MigrationDirection) -> DbResult<i64> {
        let version = migration.version;
        let description = migration.description.clone();
        let step = match direction {
            MigrationDirection::Up => migration.up.clone(),
            MigrationDirection::Down => migration.down.clone(),
        };
        let start = Instant::now();
        // Cancellation is not honoured inside a migration transaction.
        let uncancellable = CancellationToken::new();

        let work = self.transactions.with_transaction(&uncancellable, move |tx| {
            Box::pin(async move {
                step(tx).await?;
                let elapsed = start.elapsed().as_millis() as i64;
                match direction {
                    MigrationDirection::Up => {
                        tx.execute(
                            "INSERT INTO schema_migrations (version, description, applied_at, execution_time_ms) \
                             VALUES (?, ?, ?, ?)",
                            params![version, description, Utc::now(), elapsed],
                        )
                        .await?;
                    }
                    MigrationDirection::Down => {
                        tx.execute("DELETE FROM schema_migrations WHERE version = ?", params![version])
                            .await?;
                    }
                }
                Ok(elapsed)
            })
        });

        match instrument_future(work, migration_span(version, &direction.to_string())).await {
            Ok(elapsed) => {
                info!(version, description = %migration.description, %direction, elapsed_ms = elapsed, "migration applied");
                Ok(elapsed)
            }
            Err(e) => {
                error!(version, description = %migration.description, %direction, error = %e, "migration failed");
                Err(DbError::MigrationFailed {
                    version,
                    description: migration.description.clone(),
                    source: Box::new(e),
                })
            }
        }
    }
}
