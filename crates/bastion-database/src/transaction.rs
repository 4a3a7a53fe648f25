//! Transaction scopes with guaranteed rollback and savepoint nesting.
//!
//! A scope commits only when its callback returns `Ok`. An `Err`, a cancelled
//! token or a panic inside the callback rolls back; panics are re-raised once
//! the rollback has run.

use crate::connection::Database;
use crate::error::{DbError, DbResult};
use crate::params::{bind_params, Param};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{Sqlite, SqliteConnection, SqliteRow};
use sqlx::{Executor, Transaction};
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    /// SQLite transactions are serializable unless uncommitted reads are enabled.
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    pub fn read_only() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            read_only: true,
        }
    }

    pub fn serializable() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            read_only: false,
        }
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }
}

/// An open transaction handed to scope callbacks.
pub struct Tx {
    inner: Transaction<'static, Sqlite>,
    savepoints: Vec<String>,
    options: TxOptions,
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("savepoints", &self.savepoints)
            .field("options", &self.options)
            .finish()
    }
}

impl Tx {
    fn new(inner: Transaction<'static, Sqlite>, options: TxOptions) -> Self {
        Self {
            inner,
            savepoints: Vec::new(),
            options,
        }
    }

    /// The underlying connection, for sqlx queries this type does not wrap.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.inner
    }

    pub fn options(&self) -> TxOptions {
        self.options
    }

    /// Active savepoints, outermost first.
    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    /// Nesting depth: 0 at the top level.
    pub fn depth(&self) -> usize {
        self.savepoints.len()
    }

    pub async fn execute(&mut self, sql: &str, params: &[Param]) -> DbResult<u64> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut *self.inner)
            .await?;
        Ok(result.rows_affected())
    }

    /// Run several `;`-separated statements without parameters.
    pub async fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        (&mut *self.inner).execute(sql).await?;
        Ok(())
    }

    pub async fn fetch_all(&mut self, sql: &str, params: &[Param]) -> DbResult<Vec<SqliteRow>> {
        Ok(bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *self.inner)
            .await?)
    }

    pub async fn fetch_optional(&mut self, sql: &str, params: &[Param]) -> DbResult<Option<SqliteRow>> {
        Ok(bind_params(sqlx::query(sql), params)
            .fetch_optional(&mut *self.inner)
            .await?)
    }

    pub async fn fetch_one(&mut self, sql: &str, params: &[Param]) -> DbResult<SqliteRow> {
        Ok(bind_params(sqlx::query(sql), params)
            .fetch_one(&mut *self.inner)
            .await?)
    }

    async fn apply_options(&mut self) -> Result<(), sqlx::Error> {
        if self.options.read_only {
            (&mut *self.inner).execute("PRAGMA query_only = ON").await?;
        }
        if self.options.isolation == IsolationLevel::ReadUncommitted {
            (&mut *self.inner).execute("PRAGMA read_uncommitted = ON").await?;
        }
        Ok(())
    }

    // Pragmas outlive the transaction on a pooled connection.
    async fn reset_options(&mut self) -> Result<(), sqlx::Error> {
        if self.options.read_only {
            (&mut *self.inner).execute("PRAGMA query_only = OFF").await?;
        }
        if self.options.isolation == IsolationLevel::ReadUncommitted {
            (&mut *self.inner).execute("PRAGMA read_uncommitted = OFF").await?;
        }
        Ok(())
    }

    async fn commit(mut self) -> DbResult<()> {
        if let Err(e) = self.reset_options().await {
            return Err(self.rollback_with(DbError::Sqlx(e)).await);
        }
        self.inner.commit().await.map_err(DbError::CommitFailed)
    }

    async fn rollback(mut self) -> Result<(), sqlx::Error> {
        let reset = self.reset_options().await;
        self.inner.rollback().await?;
        if let Err(e) = reset {
            warn!(error = %e, "failed to reset transaction pragmas");
        }
        Ok(())
    }

    /// Roll back, attaching any rollback failure to `cause`.
    async fn rollback_with(self, cause: DbError) -> DbError {
        match self.rollback().await {
            Ok(()) => cause,
            Err(rollback) => DbError::RollbackFailed {
                source: Box::new(cause),
                rollback,
            },
        }
    }

    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        if !is_valid_savepoint_name(name) {
            return Err(DbError::InvalidSavepoint(name.to_string()));
        }
        if self.savepoints.iter().any(|s| s == name) {
            return Err(DbError::DuplicateSavepoint(name.to_string()));
        }
        (&mut *self.inner)
            .execute(format!("SAVEPOINT {name}").as_str())
            .await?;
        self.savepoints.push(name.to_string());
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), sqlx::Error> {
        (&mut *self.inner)
            .execute(format!("RELEASE SAVEPOINT {name}").as_str())
            .await?;
        self.pop_savepoint(name);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), sqlx::Error> {
        (&mut *self.inner)
            .execute(format!("ROLLBACK TO SAVEPOINT {name}").as_str())
            .await?;
        // ROLLBACK TO leaves the savepoint open.
        (&mut *self.inner)
            .execute(format!("RELEASE SAVEPOINT {name}").as_str())
            .await?;
        self.pop_savepoint(name);
        Ok(())
    }

    async fn rollback_savepoint_with(&mut self, name: &str, cause: DbError) -> DbError {
        match self.rollback_to_savepoint(name).await {
            Ok(()) => cause,
            Err(rollback) => DbError::RollbackFailed {
                source: Box::new(cause),
                rollback,
            },
        }
    }

    fn pop_savepoint(&mut self, name: &str) {
        if let Some(pos) = self.savepoints.iter().rposition(|s| s == name) {
            self.savepoints.truncate(pos);
        }
    }
}

/// Savepoint names are spliced into SQL, so only plain identifiers pass.
pub fn is_valid_savepoint_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

enum Outcome<T> {
    Finished(DbResult<T>),
    Cancelled,
    Panicked(Box<dyn Any + Send>),
}

/// Run a scope callback, racing it against the token and catching panics.
async fn run_scope<T, F>(cancel: &CancellationToken, tx: &mut Tx, f: F) -> Outcome<T>
where
    F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, DbResult<T>>,
{
    let work = AssertUnwindSafe(f(tx)).catch_unwind();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        result = work => match result {
            Ok(result) => Outcome::Finished(result),
            Err(payload) => Outcome::Panicked(payload),
        },
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs callbacks inside transactions on a [`Database`].
#[derive(Debug, Clone)]
pub struct TransactionManager {
    db: Database,
}

impl TransactionManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Run `f` in a default (serializable, read-write) transaction.
    ///
    /// ```ignore
    /// let total = manager
    ///     .with_transaction(&cancel, |tx| Box::pin(async move {
    ///         tx.execute("UPDATE accounts SET balance = balance - 10 WHERE id = ?", params![1]).await?;
    ///         tx.execute("UPDATE accounts SET balance = balance + 10 WHERE id = ?", params![2]).await?;
    ///         Ok(())
    ///     }))
    ///     .await?;
    /// ```
    pub async fn with_transaction<T, F>(&self, cancel: &CancellationToken, f: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, DbResult<T>> + Send,
    {
        self.with_transaction_options(cancel, TxOptions::default(), f)
            .await
    }

    pub async fn read_only_transaction<T, F>(&self, cancel: &CancellationToken, f: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, DbResult<T>> + Send,
    {
        self.with_transaction_options(cancel, TxOptions::read_only(), f)
            .await
    }

    pub async fn serializable_transaction<T, F>(&self, cancel: &CancellationToken, f: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, DbResult<T>> + Send,
    {
        self.with_transaction_options(cancel, TxOptions::serializable(), f)
            .await
    }

    #[instrument(skip_all, fields(isolation = opts.isolation.as_sql(), read_only = opts.read_only))]
    pub async fn with_transaction_options<T, F>(
        &self,
        cancel: &CancellationToken,
        opts: TxOptions,
        f: F,
    ) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, DbResult<T>> + Send,
    {
        let inner = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DbError::Cancelled { operation: "begin transaction" }),
            tx = self.db.begin() => tx?,
        };
        let mut tx = Tx::new(inner, opts);

        if let Err(e) = tx.apply_options().await {
            return Err(tx.rollback_with(DbError::Sqlx(e)).await);
        }

        match run_scope(cancel, &mut tx, f).await {
            Outcome::Finished(Ok(value)) => {
                tx.commit().await?;
                debug!("transaction committed");
                Ok(value)
            }
            Outcome::Finished(Err(err)) => {
                debug!(error = %err, "transaction rolled back");
                Err(tx.rollback_with(err).await)
            }
            Outcome::Cancelled => {
                debug!("transaction cancelled, rolling back");
                Err(tx
                    .rollback_with(DbError::Cancelled { operation: "transaction" })
                    .await)
            }
            Outcome::Panicked(payload) => {
                error!(
                    panic = %panic_message(payload.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "panic inside transaction, rolling back"
                );
                if let Err(e) = tx.rollback().await {
                    error!(error = %e, "rollback after panic failed");
                }
                std::panic::resume_unwind(payload)
            }
        }
    }

    /// Run `f` inside savepoint `name` of an open transaction. Failure rolls
    /// back to the savepoint and leaves the outer transaction usable.
    #[instrument(skip(self, cancel, tx, f), fields(depth = tx.depth()))]
    pub async fn with_nested_transaction<T, F>(
        &self,
        cancel: &CancellationToken,
        tx: &mut Tx,
        name: &str,
        f: F,
    ) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, DbResult<T>> + Send,
    {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled { operation: "savepoint" });
        }
        tx.savepoint(name).await?;

        match run_scope(cancel, tx, f).await {
            Outcome::Finished(Ok(value)) => {
                tx.release_savepoint(name).await?;
                Ok(value)
            }
            Outcome::Finished(Err(err)) => {
                debug!(savepoint = name, error = %err, "rolled back to savepoint");
                Err(tx.rollback_savepoint_with(name, err).await)
            }
            Outcome::Cancelled => Err(tx
                .rollback_savepoint_with(name, DbError::Cancelled { operation: "savepoint" })
                .await),
            Outcome::Panicked(payload) => {
                error!(
                    savepoint = name,
                    panic = %panic_message(payload.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "panic inside savepoint, rolling back"
                );
                if let Err(e) = tx.rollback_to_savepoint(name).await {
                    error!(error = %e, "rollback to savepoint after panic failed");
                }
                std::panic::resume_unwind(payload)
            }
        }
    }
}
