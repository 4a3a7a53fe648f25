//! Periodic database health monitoring.
//!
//! Each tick samples pool statistics, pings, runs a test query, publishes the
//! snapshot and raises alerts for any threshold breaches.

pub mod alerts;

pub use alerts::{AlertDispatcher, AlertSeverity, HealthAlert};

use crate::config::HealthMonitorConfig;
use crate::connection::{Database, PoolStats};
use crate::error::{DbError, DbResult};
use bastion_common_log::spans::{health_span, instrument_future};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub timestamp: DateTime<Utc>,
    pub tick: u64,
    pub pool: PoolStats,
    pub ping_latency_ms: Option<f64>,
    pub query_latency_ms: Option<f64>,
    pub ping_error: Option<String>,
    pub query_error: Option<String>,
    /// Both probes succeeded
    pub healthy: bool,
}

struct MonitorInner {
    db: Database,
    config: HealthMonitorConfig,
    alerts: AlertDispatcher,
    latest: watch::Sender<Option<Arc<HealthMetrics>>>,
    ticks: AtomicU64,
}

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    task: Mutex<Option<MonitorTask>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(db: Database, config: HealthMonitorConfig) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(MonitorInner {
                db,
                config,
                alerts: AlertDispatcher::default(),
                latest,
                ticks: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the background loop. The first check runs immediately.
    pub fn start(&self) -> DbResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(DbError::MonitorRunning);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(shutdown_rx).await });
        *task = Some(MonitorTask { shutdown, handle });

        info!(
            interval_ms = self.inner.config.interval_ms,
            "health monitor started"
        );
        Ok(())
    }

    /// Signal the loop to exit and wait for it. A check already in progress
    /// finishes first. Stopping a stopped monitor does nothing.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };

        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            if e.is_panic() {
                error!(error = %e, "health monitor task panicked");
            }
        }
        info!("health monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn register_alert_callback<F>(&self, callback: F)
    where
        F: Fn(HealthAlert) + Send + Sync + 'static,
    {
        self.inner.alerts.register(callback);
    }

    /// Most recent snapshot, if a check has completed.
    pub fn latest(&self) -> Option<Arc<HealthMetrics>> {
        self.inner.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<HealthMetrics>>> {
        self.inner.latest.subscribe()
    }

    /// Run one check now, outside the schedule.
    pub async fn check_now(&self) -> Arc<HealthMetrics> {
        self.inner.tick().await
    }

    /// Close every idle connection and verify the database is reachable on
    /// a fresh one. Connections in use are left alone. Returns how many
    /// connections were closed.
    ///
    /// In-memory databases live only as long as their connection, so nothing
    /// is evicted there.
    pub async fn recycle_stale_connections(&self, cancel: &CancellationToken) -> DbResult<usize> {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled { operation: "recycle connections" });
        }

        let db = &self.inner.db;
        let evicted = if db.config().is_in_memory() {
            debug!("in-memory database, skipping connection recycle");
            0
        } else {
            let _restore = IdleLimitGuard {
                db,
                previous: db.set_max_idle(0),
            };
            db.evict_idle(0).await
        };
        info!(evicted, "recycled idle connections");

        let timeout = self.inner.config.ping_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DbError::Cancelled { operation: "recycle connections" }),
            result = tokio::time::timeout(timeout, db.ping()) => match result {
                Ok(Ok(())) => Ok(evicted),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(DbError::Timeout { operation: "ping after recycle", after: timeout }),
            },
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            let _ = task.shutdown.send(true);
        }
    }
}

struct IdleLimitGuard<'a> {
    db: &'a Database,
    previous: u32,
}

impl Drop for IdleLimitGuard<'_> {
    fn drop(&mut self) {
        self.db.set_max_idle(self.previous);
    }
}

impl MonitorInner {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!("health monitor loop exited");
    }

    async fn tick(&self) -> Arc<HealthMetrics> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        instrument_future(self.check(tick), health_span(tick)).await
    }

    async fn check(&self, tick: u64) -> Arc<HealthMetrics> {
        let pool = self.db.stats();
        let (ping_latency, ping_error) = probe(self.config.ping_timeout(), self.db.ping()).await;
        let (query_latency, query_error) =
            probe(self.config.query_timeout(), self.db.select_one()).await;

        let healthy = ping_error.is_none() && query_error.is_none();
        let metrics = Arc::new(HealthMetrics {
            timestamp: Utc::now(),
            tick,
            pool,
            ping_latency_ms: ping_latency.map(as_millis_f64),
            query_latency_ms: query_latency.map(as_millis_f64),
            ping_error,
            query_error,
            healthy,
        });

        let raised = alerts::evaluate(&metrics, &self.config);
        self.latest.send_replace(Some(Arc::clone(&metrics)));
        debug!(healthy, alerts = raised.len(), "health check complete");

        for alert in raised {
            self.alerts.dispatch(alert);
        }
        metrics
    }
}

async fn probe<F>(timeout: Duration, fut: F) -> (Option<Duration>, Option<String>)
where
    F: Future<Output = DbResult<()>>,
{
    let start = Instant::now();
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(())) => (Some(start.elapsed()), None),
        Ok(Err(e)) => (Some(start.elapsed()), Some(e.to_string())),
        Err(_) => (None, Some(format!("timed out after {timeout:?}"))),
    }
}

fn as_millis_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open;

    fn fast_config() -> HealthMonitorConfig {
        HealthMonitorConfig {
            interval_ms: 20,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_check_now_reports_healthy() {
        let (_tmp, db) = open().await;
        let monitor = HealthMonitor::new(db, fast_config());
        assert!(monitor.latest().is_none());

        let metrics = monitor.check_now().await;
        assert!(metrics.healthy);
        assert!(metrics.ping_latency_ms.is_some());
        assert_eq!(metrics.tick, 1);
        assert_eq!(monitor.latest().unwrap().tick, 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_stop_is_idempotent() {
        let (_tmp, db) = open().await;
        let monitor = HealthMonitor::new(db, fast_config());

        monitor.start().unwrap();
        assert!(matches!(monitor.start(), Err(DbError::MonitorRunning)));
        assert!(monitor.is_running());

        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        monitor.start().unwrap();
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_loop_publishes_snapshots() {
        let (_tmp, db) = open().await;
        let monitor = HealthMonitor::new(db, fast_config());
        let mut updates = monitor.subscribe();

        monitor.start().unwrap();
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), updates.changed())
                .await
                .unwrap()
                .unwrap();
        }
        monitor.stop().await;

        let latest = monitor.latest().unwrap();
        assert!(latest.tick >= 2);
        assert!(latest.healthy);
    }

    #[tokio::test]
    async fn test_failed_probes_mark_unhealthy() {
        let (_tmp, db) = open().await;
        db.close().await;
        let monitor = HealthMonitor::new(db, fast_config());

        let metrics = monitor.check_now().await;
        assert!(!metrics.healthy);
        assert!(metrics.ping_error.is_some());
        assert!(metrics.query_error.is_some());
    }

    #[tokio::test]
    async fn test_recycle_keeps_database_reachable() {
        let (_tmp, db) = open().await;
        let monitor = HealthMonitor::new(db.clone(), fast_config());

        let held: Vec<_> = futures::future::join_all((0..3).map(|_| db.acquire()))
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        drop(held);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let evicted = monitor
            .recycle_stale_connections(&CancellationToken::new())
            .await
            .unwrap();
        assert!(evicted >= 1);
        assert_eq!(db.max_idle(), 2);
    }

    #[tokio::test]
    async fn test_recycle_keeps_in_memory_data() {
        let db = Database::connect(crate::config::DatabaseConfig::in_memory())
            .await
            .unwrap();
        db.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        let monitor = HealthMonitor::new(db.clone(), fast_config());

        let evicted = monitor
            .recycle_stale_connections(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(evicted, 0);
        db.execute("INSERT INTO t (v) VALUES (1)", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_recycle_respects_cancellation() {
        let (_tmp, db) = open().await;
        let monitor = HealthMonitor::new(db, fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = monitor.recycle_stale_connections(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
