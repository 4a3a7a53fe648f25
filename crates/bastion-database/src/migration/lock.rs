//! Cross-process migration lock.
//!
//! The lock is a single row that moves from unlocked to locked with one
//! conditional UPDATE, so two runners can never both succeed.

use super::runner::MigrationManager;
use super::types::LockStatus;
use crate::connection::Database;
use crate::error::{DbError, DbResult};
use crate::params;
use crate::params::Param;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

impl MigrationManager {
    /// Take the lock for `identifier`. Fails with [`DbError::LockHeld`] when
    /// anyone holds it, including `identifier` itself.
    pub async fn acquire_lock(&self, cancel: &CancellationToken, identifier: &str) -> DbResult<()> {
        let args = [Param::from(Utc::now()), Param::from(identifier)];
        let claimed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DbError::Cancelled { operation: "acquire migration lock" }),
            result = self.db.execute(
                "UPDATE schema_migration_lock SET locked = 1, locked_at = ?, locked_by = ? \
                 WHERE id = 1 AND locked = 0",
                &args,
            ) => result?,
        };

        if claimed == 1 {
            info!(identifier, "migration lock acquired");
            return Ok(());
        }

        let status = self.lock_status().await?;
        warn!(
            identifier,
            holder = status.locked_by.as_deref().unwrap_or("unknown"),
            "migration lock busy"
        );
        Err(DbError::LockHeld {
            holder: status.locked_by.unwrap_or_else(|| "unknown".to_string()),
            since: status.locked_at,
        })
    }

    /// Release the lock if `identifier` holds it.
    pub async fn release_lock(&self, identifier: &str) -> DbResult<()> {
        release(&self.db, identifier).await
    }

    /// Clear the lock regardless of holder, for recovering from a runner
    /// that died while holding it.
    pub async fn force_release_lock(&self) -> DbResult<()> {
        let status = self.lock_status().await?;
        self.db
            .execute(
                "UPDATE schema_migration_lock SET locked = 0, locked_at = NULL, locked_by = NULL \
                 WHERE id = 1",
                &[],
            )
            .await?;
        warn!(
            previous_holder = status.locked_by.as_deref().unwrap_or("none"),
            "migration lock force-released"
        );
        Ok(())
    }

    pub async fn lock_status(&self) -> DbResult<LockStatus> {
        let row = self
            .db
            .fetch_optional(
                "SELECT locked, locked_at, locked_by FROM schema_migration_lock WHERE id = 1",
                &[],
            )
            .await?;

        let Some(row) = row else {
            return Ok(LockStatus {
                locked: false,
                locked_by: None,
                locked_at: None,
            });
        };

        Ok(LockStatus {
            locked: row.try_get::<bool, _>("locked")?,
            locked_at: row.try_get::<Option<DateTime<Utc>>, _>("locked_at")?,
            locked_by: row.try_get::<Option<String>, _>("locked_by")?,
        })
    }
}

async fn release(db: &Database, identifier: &str) -> DbResult<()> {
    let released = db
        .execute(
            "UPDATE schema_migration_lock SET locked = 0, locked_at = NULL, locked_by = NULL \
             WHERE id = 1 AND locked = 1 AND locked_by = ?",
            params![identifier],
        )
        .await?;

    if released == 0 {
        return Err(DbError::LockNotHeld(identifier.to_string()));
    }
    info!(identifier, "migration lock released");
    Ok(())
}

/// Releases the lock if a run is dropped before it could release normally.
pub(crate) struct LockGuard {
    db: Database,
    identifier: String,
    armed: bool,
}

impl LockGuard {
    pub(crate) fn new(db: Database, identifier: String) -> Self {
        Self {
            db,
            identifier,
            armed: true,
        }
    }

    /// Release now and disarm.
    pub(crate) async fn release(mut self) -> DbResult<()> {
        self.armed = false;
        release(&self.db, &self.identifier).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(identifier = %self.identifier, "migration lock left held, no runtime to release it");
            return;
        };
        let db = self.db.clone();
        let identifier = std::mem::take(&mut self.identifier);
        handle.spawn(async move {
            if let Err(e) = release(&db, &identifier).await {
                error!(identifier = %identifier, error = %e, "failed to release abandoned migration lock");
            }
        });
    }
}
