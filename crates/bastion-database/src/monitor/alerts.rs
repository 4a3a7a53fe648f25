//! Health alerts and their delivery.

use super::HealthMetrics;
use crate::config::HealthMonitorConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthAlert {
    pub id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub details: serde_json::Value,
    /// Snapshot the alert was raised from
    pub metrics: HealthMetrics,
}

impl HealthAlert {
    fn new(
        id: &str,
        severity: AlertSeverity,
        message: String,
        details: serde_json::Value,
        metrics: &HealthMetrics,
    ) -> Self {
        Self {
            id: id.to_string(),
            severity,
            message,
            timestamp: chrono::Utc::now(),
            details,
            metrics: metrics.clone(),
        }
    }
}

pub type AlertCallback = Arc<dyn Fn(HealthAlert) + Send + Sync>;

/// Compare a snapshot against thresholds. Probe failures are critical,
/// pool pressure is a warning.
pub fn evaluate(metrics: &HealthMetrics, thresholds: &HealthMonitorConfig) -> Vec<HealthAlert> {
    let mut alerts = Vec::new();

    if let Some(err) = &metrics.ping_error {
        alerts.push(HealthAlert::new(
            "ping_failed",
            AlertSeverity::Critical,
            format!("Database ping failed: {err}"),
            serde_json::json!({ "error": err }),
            metrics,
        ));
    }

    if let Some(err) = &metrics.query_error {
        alerts.push(HealthAlert::new(
            "query_failed",
            AlertSeverity::Critical,
            format!("Database test query failed: {err}"),
            serde_json::json!({ "error": err }),
            metrics,
        ));
    }

    let idle_percent = metrics.pool.idle_percent();
    if idle_percent > thresholds.max_idle_percent {
        alerts.push(HealthAlert::new(
            "idle_ratio_high",
            AlertSeverity::Warning,
            format!("Idle connections high: {idle_percent:.1}% of open"),
            serde_json::json!({
                "idle": metrics.pool.idle,
                "open": metrics.pool.open,
                "threshold_percent": thresholds.max_idle_percent,
            }),
            metrics,
        ));
    }

    if metrics.pool.open < thresholds.min_open_connections {
        alerts.push(HealthAlert::new(
            "open_connections_low",
            AlertSeverity::Warning,
            format!(
                "Open connections low: {} (minimum {})",
                metrics.pool.open, thresholds.min_open_connections
            ),
            serde_json::json!({
                "open": metrics.pool.open,
                "minimum": thresholds.min_open_connections,
            }),
            metrics,
        ));
    }

    let avg_wait = metrics.pool.avg_wait();
    if avg_wait > thresholds.max_avg_wait() {
        alerts.push(HealthAlert::new(
            "acquire_wait_high",
            AlertSeverity::Warning,
            format!("Average connection wait high: {}ms", avg_wait.as_millis()),
            serde_json::json!({
                "avg_wait_ms": avg_wait.as_millis() as u64,
                "wait_count": metrics.pool.wait_count,
                "threshold_ms": thresholds.max_avg_wait_ms,
            }),
            metrics,
        ));
    }

    alerts
}

/// Registered alert callbacks.
///
/// Callbacks run on the blocking thread pool, so a slow callback does not
/// delay the next health check.
#[derive(Clone, Default)]
pub struct AlertDispatcher {
    callbacks: Arc<RwLock<Vec<AlertCallback>>>,
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}

impl AlertDispatcher {
    pub fn register<F>(&self, callback: F)
    where
        F: Fn(HealthAlert) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log the alert and hand it to every callback.
    pub fn dispatch(&self, alert: HealthAlert) {
        match alert.severity {
            AlertSeverity::Critical => error!(
                alert_id = %alert.id,
                message = %alert.message,
                "CRITICAL ALERT"
            ),
            AlertSeverity::Warning => warn!(
                alert_id = %alert.id,
                message = %alert.message,
                "Warning alert"
            ),
        }

        let callbacks: Vec<AlertCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            let alert = alert.clone();
            tokio::task::spawn_blocking(move || callback(alert));
        }
    }
}
