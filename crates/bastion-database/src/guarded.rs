//! Database operations routed through a circuit breaker.

use crate::breaker::CircuitBreaker;
use crate::config::CircuitBreakerConfig;
use crate::connection::Database;
use crate::error::{DbError, DbResult};
use crate::params::Param;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::transaction::{TransactionManager, Tx};
use bastion_common_log::spans::{db_span, instrument_future, Timer};
use futures::future::BoxFuture;
use sqlx::sqlite::SqliteRow;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Breaker-guarded access to a [`Database`], with optional retries inside
/// the breaker.
///
/// With retries enabled the breaker sees one outcome per call: a call that
/// succeeds on its third attempt is a single success.
#[derive(Debug, Clone)]
pub struct GuardedDatabase {
    db: Database,
    transactions: TransactionManager,
    breaker: Arc<CircuitBreaker>,
    retry: Option<RetryExecutor>,
}

impl GuardedDatabase {
    pub fn new(db: Database, config: CircuitBreakerConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new("database", config, db.classifier()));
        Self::with_breaker(db, breaker)
    }

    /// Share an existing breaker, e.g. between several handles to one server.
    pub fn with_breaker(db: Database, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            transactions: TransactionManager::new(db.clone()),
            db,
            breaker,
            retry: None,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(RetryExecutor::new(policy, self.db.classifier()));
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn query(
        &self,
        cancel: &CancellationToken,
        sql: &str,
        params: &[Param],
    ) -> DbResult<Vec<SqliteRow>> {
        self.guarded(cancel, "query", move || self.db.fetch_all(sql, params))
            .await
    }

    pub async fn query_one(
        &self,
        cancel: &CancellationToken,
        sql: &str,
        params: &[Param],
    ) -> DbResult<Option<SqliteRow>> {
        self.guarded(cancel, "query_one", move || self.db.fetch_optional(sql, params))
            .await
    }

    pub async fn execute(&self, cancel: &CancellationToken, sql: &str, params: &[Param]) -> DbResult<u64> {
        self.guarded(cancel, "execute", move || self.db.execute(sql, params))
            .await
    }

    pub async fn ping(&self, cancel: &CancellationToken) -> DbResult<()> {
        self.guarded(cancel, "ping", move || self.db.ping()).await
    }

    /// Run `f` in a transaction. With retries enabled a transient failure
    /// reruns the whole transaction, so `f` may be called more than once.
    pub async fn transaction<T, F>(&self, cancel: &CancellationToken, f: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> Fn(&'t mut Tx) -> BoxFuture<'t, DbResult<T>> + Send + Sync,
    {
        let f = &f;
        self.guarded(cancel, "transaction", move || self.transactions.with_transaction(cancel, f))
            .await
    }

    async fn guarded<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &'static str,
        op: F,
    ) -> DbResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let retry = self.retry.as_ref();
        let op = &op;
        let timer = Timer::start(operation);
        let call = self.breaker.execute(move || async move {
            match retry {
                Some(executor) => executor.run(cancel, op).await,
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(DbError::Cancelled { operation }),
                    result = op() => result,
                },
            }
        });
        let result = instrument_future(call, db_span(operation)).await;
        if result.is_ok() {
            timer.finish();
        }
        result
    }
}
