//! Connection management: pool creation, retried connects, health checks and
//! pool statistics.

use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult, HealthStep};
use crate::params::{bind_params, Param};
use crate::retry::{sleep_or_cancel, ErrorClassifier, RetryPolicy, SqliteClassifier};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Connection, Executor, Transaction};
use parking_lot::RwLock;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Snapshot of pool counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub max_open: u32,
    pub max_idle: u32,
    pub open: u32,
    pub idle: u32,
    pub in_use: u32,
    /// Acquires that had to wait for a connection
    pub wait_count: u64,
    pub wait_duration_ms: f64,
    pub max_lifetime_secs: u64,
    pub max_idle_time_secs: u64,
}

impl PoolStats {
    pub fn avg_wait(&self) -> Duration {
        if self.wait_count == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.wait_duration_ms / 1000.0 / self.wait_count as f64)
    }

    /// Idle connections as a percentage of open ones; 0 when none are open.
    pub fn idle_percent(&self) -> f64 {
        if self.open == 0 {
            return 0.0;
        }
        f64::from(self.idle) * 100.0 / f64::from(self.open)
    }
}

/// Checkouts faster than this were served without waiting.
const WAIT_THRESHOLD: Duration = Duration::from_millis(1);

/// Undoes per-transaction session pragmas before a connection goes idle.
const RESET_SESSION: &str = "PRAGMA query_only = OFF; PRAGMA read_uncommitted = OFF";

#[derive(Debug, Default)]
struct WaitStats {
    count: AtomicU64,
    nanos: AtomicU64,
}

impl WaitStats {
    fn record(&self, waited: Duration) {
        if waited < WAIT_THRESHOLD {
            return;
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.nanos
            .fetch_add(waited.as_nanos().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
    }
}

/// Release-time idle limit, checked against the pool's current idle count.
///
/// Concurrent releases can each see room for one more, so the idle set may
/// briefly exceed the limit by the number of connections released at once.
#[derive(Debug)]
struct IdleGate {
    limit: AtomicU32,
    pool: RwLock<Option<SqlitePool>>,
}

impl IdleGate {
    fn admits(&self) -> bool {
        let limit = self.limit.load(Ordering::Acquire) as usize;
        if limit == 0 {
            return false;
        }
        self.pool
            .read()
            .as_ref()
            .map_or(true, |pool| pool.num_idle() < limit)
    }
}

/// Clears the gate's pool handle when the last [`Database`] clone drops, so
/// the release hook does not keep the pool alive.
#[derive(Debug)]
struct GateOwner(Arc<IdleGate>);

impl Drop for GateOwner {
    fn drop(&mut self) {
        self.0.pool.write().take();
    }
}

/// Shared handle to a SQLite connection pool.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    config: Arc<DatabaseConfig>,
    idle: Arc<GateOwner>,
    waits: Arc<WaitStats>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl Database {
    /// Open a pool and verify it with a bounded ping. No retries.
    #[instrument(skip(config), fields(path = %config.path))]
    pub async fn connect(config: DatabaseConfig) -> DbResult<Self> {
        config.validate()?;
        let options = connect_options(&config)?;

        let gate = Arc::new(IdleGate {
            limit: AtomicU32::new(config.max_idle_connections),
            pool: RwLock::new(None),
        });
        let hook_gate = Arc::clone(&gate);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_open_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.max_idle_time())
            .max_lifetime(config.max_lifetime())
            .after_release(move |conn, _meta| {
                let keep = hook_gate.admits();
                Box::pin(async move {
                    if !keep {
                        return Ok(false);
                    }
                    // A transaction dropped mid-flight skips its own reset.
                    conn.execute(RESET_SESSION).await?;
                    Ok(true)
                })
            })
            .connect_with(options)
            .await?;
        *gate.pool.write() = Some(pool.clone());

        let db = Self {
            pool,
            config: Arc::new(config),
            idle: Arc::new(GateOwner(gate)),
            waits: Arc::new(WaitStats::default()),
            classifier: Arc::new(SqliteClassifier),
        };

        let timeout = db.config.connect_timeout();
        let verified = match tokio::time::timeout(timeout, db.ping()).await {
            Ok(result) => result,
            Err(_) => Err(DbError::Timeout {
                operation: "connect ping",
                after: timeout,
            }),
        };
        if let Err(e) = verified {
            db.pool.close().await;
            return Err(e);
        }

        info!(
            max_open = db.config.max_open_connections,
            min = db.config.min_connections,
            wal = db.config.wal_mode,
            "database pool ready"
        );
        Ok(db)
    }

    /// Connect, retrying failed attempts with the policy's backoff until one
    /// succeeds, attempts run out or `cancel` fires. Configuration errors are
    /// returned immediately.
    #[instrument(skip_all, fields(path = %config.path, max_attempts = policy.max_attempts))]
    pub async fn connect_with_retry(
        cancel: &CancellationToken,
        config: DatabaseConfig,
        policy: &RetryPolicy,
    ) -> DbResult<Self> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DbError::Cancelled { operation: "connect" }),
                result = Self::connect(config.clone()) => result,
            };

            let err = match result {
                Ok(db) => {
                    if attempt > 1 {
                        info!(attempt, "connected after retry");
                    }
                    return Ok(db);
                }
                Err(e @ DbError::Config(_)) => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                return Err(DbError::ConnectionFailed {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = policy.delay(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "database connection attempt failed"
            );
            sleep_or_cancel(cancel, delay, "connect backoff").await?;
        }
    }

    /// Replace the classifier used by components built on this handle.
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn classifier(&self) -> Arc<dyn ErrorClassifier> {
        Arc::clone(&self.classifier)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Ping, then `SELECT 1`. The error names the step that failed.
    pub async fn health_check(&self) -> DbResult<()> {
        self.ping().await.map_err(|e| DbError::HealthCheck {
            step: HealthStep::Ping,
            source: Box::new(e),
        })?;
        self.select_one().await.map_err(|e| DbError::HealthCheck {
            step: HealthStep::Query,
            source: Box::new(e),
        })
    }

    pub async fn ping(&self) -> DbResult<()> {
        let mut conn = self.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    pub async fn select_one(&self) -> DbResult<()> {
        let mut conn = self.acquire().await?;
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&mut *conn).await?;
        debug_assert_eq!(one, 1);
        Ok(())
    }

    /// Check out a connection, recording how long the checkout took.
    pub async fn acquire(&self) -> DbResult<PoolConnection<Sqlite>> {
        let start = Instant::now();
        let conn = self.pool.acquire().await;
        self.waits.record(start.elapsed());
        Ok(conn?)
    }

    /// Start a driver transaction on a pooled connection.
    pub async fn begin(&self) -> DbResult<Transaction<'static, Sqlite>> {
        let start = Instant::now();
        let tx = self.pool.begin().await;
        self.waits.record(start.elapsed());
        Ok(tx?)
    }

    /// Run a statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[Param]) -> DbResult<u64> {
        let mut conn = self.acquire().await?;
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Run several `;`-separated statements without parameters.
    pub async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let mut conn = self.acquire().await?;
        (&mut *conn).execute(sql).await?;
        Ok(())
    }

    pub async fn fetch_all(&self, sql: &str, params: &[Param]) -> DbResult<Vec<SqliteRow>> {
        let mut conn = self.acquire().await?;
        Ok(bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *conn)
            .await?)
    }

    pub async fn fetch_optional(&self, sql: &str, params: &[Param]) -> DbResult<Option<SqliteRow>> {
        let mut conn = self.acquire().await?;
        Ok(bind_params(sqlx::query(sql), params)
            .fetch_optional(&mut *conn)
            .await?)
    }

    pub fn stats(&self) -> PoolStats {
        let open = self.pool.size();
        let idle = self.pool.num_idle().min(u32::MAX as usize) as u32;
        let wait_count = self.waits.count.load(Ordering::Relaxed);
        let wait_nanos = self.waits.nanos.load(Ordering::Relaxed);

        PoolStats {
            max_open: self.config.max_open_connections,
            max_idle: self.max_idle(),
            open,
            idle,
            in_use: open.saturating_sub(idle),
            wait_count,
            wait_duration_ms: wait_nanos as f64 / 1_000_000.0,
            max_lifetime_secs: self.config.max_lifetime_secs,
            max_idle_time_secs: self.config.max_idle_time_secs,
        }
    }

    pub fn max_idle(&self) -> u32 {
        self.idle.0.limit.load(Ordering::Acquire)
    }

    /// Change the idle limit, returning the previous one. Released
    /// connections are closed while the idle set is at the limit, so zero
    /// closes every connection as it comes back.
    pub fn set_max_idle(&self, limit: u32) -> u32 {
        self.idle.0.limit.swap(limit, Ordering::AcqRel)
    }

    /// Close idle connections until at most `keep` remain. Connections in use
    /// are untouched. Returns how many were closed.
    pub async fn evict_idle(&self, keep: u32) -> usize {
        let surplus = self.pool.num_idle().saturating_sub(keep as usize);
        let mut evicted = 0;

        for _ in 0..surplus {
            let Some(conn) = self.pool.try_acquire() else {
                break;
            };
            if let Err(e) = conn.detach().close().await {
                debug!(error = %e, "error closing evicted connection");
            }
            evicted += 1;
        }

        if evicted > 0 {
            debug!(evicted, "evicted idle connections");
        }
        evicted
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("database pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

fn connect_options(config: &DatabaseConfig) -> DbResult<SqliteConnectOptions> {
    let base = if config.is_in_memory() {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DbError::Config(format!("invalid in-memory options: {e}")))?
    } else {
        SqliteConnectOptions::new().filename(&config.path)
    };

    let mut options = base
        .create_if_missing(config.create_if_missing)
        .busy_timeout(config.busy_timeout())
        .foreign_keys(config.foreign_keys)
        .synchronous(config.synchronous.into());

    if config.wal_mode && !config.is_in_memory() {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{file_config, open};
    use bastion_test_utils::TempDatabase;
    use sqlx::Row;

    #[tokio::test]
    async fn test_connect_and_health_check() {
        let (_tmp, db) = open().await;
        db.health_check().await.unwrap();
        assert!(!db.is_closed());
    }

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::connect(DatabaseConfig::in_memory()).await.unwrap();
        db.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        db.execute("INSERT INTO t (v) VALUES (?)", crate::params![41])
            .await
            .unwrap();
        let row = db.fetch_optional("SELECT v + 1 AS v FROM t", &[]).await.unwrap().unwrap();
        assert_eq!(row.get::<i64, _>("v"), 42);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_without_retry() {
        let config = DatabaseConfig::new("x.db").max_connections(0);
        let policy = RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(10));

        let started = Instant::now();
        let err = Database::connect_with_retry(&CancellationToken::new(), config, &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Config(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let tmp = TempDatabase::new();
        let mut config = file_config(&tmp);
        config.path = tmp.dir().join("missing/nested/db.sqlite").to_string_lossy().into_owned();
        config.create_if_missing = false;
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)).without_jitter();

        let err = Database::connect_with_retry(&CancellationToken::new(), config, &policy)
            .await
            .unwrap_err();

        match err {
            DbError::ConnectionFailed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_with_retry_honours_cancellation() {
        let tmp = TempDatabase::new();
        let mut config = file_config(&tmp);
        config.create_if_missing = false;
        let policy = RetryPolicy::new(10, Duration::from_secs(30), Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = Database::connect_with_retry(&cancel, config, &policy)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_stats_track_usage() {
        let (_tmp, db) = open().await;

        let held = db.acquire().await.unwrap();
        let stats = db.stats();
        assert_eq!(stats.max_open, 4);
        assert!(stats.open >= 1);
        assert!(stats.in_use >= 1);
        drop(held);
    }

    #[tokio::test]
    async fn test_wait_stats_count_contended_acquires() {
        let tmp = TempDatabase::new();
        let config = file_config(&tmp).max_connections(1).max_idle(1);
        let db = Database::connect(config).await.unwrap();

        let held = db.acquire().await.unwrap();
        let before = db.stats().wait_count;

        let waiter = {
            let db = db.clone();
            tokio::spawn(async move { db.ping().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);
        waiter.await.unwrap().unwrap();

        let stats = db.stats();
        assert_eq!(stats.wait_count, before + 1);
        assert!(stats.avg_wait() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_path_with_uri_characters() {
        let tmp = TempDatabase::new();
        let mut config = file_config(&tmp);
        config.path = tmp.dir().join("odd?name#1.db").to_string_lossy().into_owned();

        let db = Database::connect(config.clone()).await.unwrap();
        db.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        db.close().await;

        assert!(std::path::Path::new(&config.path).exists());
    }

    #[tokio::test]
    async fn test_evict_idle_closes_surplus_connections() {
        let (_tmp, db) = open().await;

        let a = db.acquire().await.unwrap();
        let b = db.acquire().await.unwrap();
        let c = db.acquire().await.unwrap();
        drop((a, b, c));
        // Connections return to the idle queue asynchronously.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(db.stats().idle >= 2);

        let evicted = db.evict_idle(0).await;
        assert!(evicted >= 2);
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_limit_caps_idle_set() {
        let (_tmp, db) = open().await;
        db.set_max_idle(1);

        let conns = vec![
            db.acquire().await.unwrap(),
            db.acquire().await.unwrap(),
            db.acquire().await.unwrap(),
        ];
        // Releases race each other, so hand connections back one at a time.
        for conn in conns {
            drop(conn);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        let stats = db.stats();
        assert!(stats.idle <= 1, "idle = {}", stats.idle);
        assert!(stats.open <= 1, "open = {}", stats.open);
        db.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_released_connection_is_writable_after_abandoned_read_only_session() {
        let tmp = TempDatabase::new();
        let config = file_config(&tmp).max_connections(1).max_idle(1);
        let db = Database::connect(config).await.unwrap();
        db.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();

        let mut conn = db.acquire().await.unwrap();
        (&mut *conn).execute("PRAGMA query_only = ON").await.unwrap();
        drop(conn);
        tokio::time::sleep(Duration::from_millis(30)).await;

        db.execute("INSERT INTO t (v) VALUES (1)", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_idle_limit_closes_released_connections() {
        let (_tmp, db) = open().await;
        assert_eq!(db.set_max_idle(0), 2);

        let conn = db.acquire().await.unwrap();
        drop(conn);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(db.stats().idle, 0);

        db.set_max_idle(2);
        db.ping().await.unwrap();
    }

    #[test]
    fn test_pool_stats_math() {
        let stats = PoolStats {
            max_open: 10,
            max_idle: 5,
            open: 4,
            idle: 3,
            in_use: 1,
            wait_count: 4,
            wait_duration_ms: 20.0,
            max_lifetime_secs: 0,
            max_idle_time_secs: 0,
        };
        assert_eq!(stats.idle_percent(), 75.0);
        assert_eq!(stats.avg_wait(), Duration::from_millis(5));

        let empty = PoolStats { open: 0, wait_count: 0, ..stats };
        assert_eq!(empty.idle_percent(), 0.0);
        assert_eq!(empty.avg_wait(), Duration::ZERO);
    }
}
