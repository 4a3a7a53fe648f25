//! Configuration for the resilience layer.

use crate::error::{DbError, DbResult};
use crate::retry::RetryPolicy;
use bastion_common_config::ConfigLoader;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteSynchronous;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, one section per component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub database: DatabaseConfig,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthMonitorConfig,
}

impl ResilienceConfig {
    /// Load from a YAML file. `${VAR}` references are expanded first.
    pub fn from_file(path: impl AsRef<Path>) -> DbResult<Self> {
        let config: Self = ConfigLoader::new(path)
            .load()
            .map_err(|e| DbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> DbResult<Self> {
        let config: Self =
            ConfigLoader::parse(contents).map_err(|e| DbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DbResult<()> {
        self.database.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.health.validate()
    }
}

/// SQLite synchronous setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynchronousMode {
    Off,
    #[default]
    Normal,
    Full,
    Extra,
}

impl From<SynchronousMode> for SqliteSynchronous {
    fn from(mode: SynchronousMode) -> Self {
        match mode {
            SynchronousMode::Off => SqliteSynchronous::Off,
            SynchronousMode::Normal => SqliteSynchronous::Normal,
            SynchronousMode::Full => SqliteSynchronous::Full,
            SynchronousMode::Extra => SqliteSynchronous::Extra,
        }
    }
}

/// Connection pool and driver settings.
///
/// Durations of zero for `max_lifetime_secs` and `max_idle_time_secs` disable
/// the corresponding limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file, or `:memory:`
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_max_open")]
    pub max_open_connections: u32,

    #[serde(default = "default_max_idle")]
    pub max_idle_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,

    #[serde(default = "default_max_idle_time")]
    pub max_idle_time_secs: u64,

    /// Bound on the ping performed while connecting
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long SQLite waits on a locked database before returning BUSY
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub wal_mode: bool,

    #[serde(default)]
    pub synchronous: SynchronousMode,

    #[serde(default = "default_true")]
    pub create_if_missing: bool,

    #[serde(default = "default_true")]
    pub foreign_keys: bool,
}

fn default_path() -> String {
    "bastion.db".to_string()
}

fn default_max_open() -> u32 {
    10
}

fn default_max_idle() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_max_lifetime() -> u64 {
    1800
}

fn default_max_idle_time() -> u64 {
    600
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_open_connections: default_max_open(),
            max_idle_connections: default_max_idle(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            max_lifetime_secs: default_max_lifetime(),
            max_idle_time_secs: default_max_idle_time(),
            connect_timeout_ms: default_connect_timeout(),
            busy_timeout_ms: default_busy_timeout(),
            wal_mode: true,
            synchronous: SynchronousMode::default(),
            create_if_missing: true,
            foreign_keys: true,
        }
    }
}

impl DatabaseConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Single-connection in-memory database. The connection is never
    /// recycled, since closing it discards the data.
    pub fn in_memory() -> Self {
        Self {
            path: ":memory:".to_string(),
            max_open_connections: 1,
            max_idle_connections: 1,
            min_connections: 1,
            max_lifetime_secs: 0,
            max_idle_time_secs: 0,
            wal_mode: false,
            ..Default::default()
        }
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_open_connections = n;
        self
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self
    }

    pub fn max_idle(mut self, n: u32) -> Self {
        self.max_idle_connections = n;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        (self.max_lifetime_secs > 0).then(|| Duration::from_secs(self.max_lifetime_secs))
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        (self.max_idle_time_secs > 0).then(|| Duration::from_secs(self.max_idle_time_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.path.trim().is_empty() {
            return Err(DbError::Config("database path is empty".into()));
        }
        if self.max_open_connections == 0 {
            return Err(DbError::Config(
                "max_open_connections must be at least 1".into(),
            ));
        }
        if self.min_connections > self.max_open_connections {
            return Err(DbError::Config(format!(
                "min_connections ({}) exceeds max_open_connections ({})",
                self.min_connections, self.max_open_connections
            )));
        }
        if self.max_idle_connections > self.max_open_connections {
            return Err(DbError::Config(format!(
                "max_idle_connections ({}) exceeds max_open_connections ({})",
                self.max_idle_connections, self.max_open_connections
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(DbError::Config("connect_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive qualifying failures that trip a closed breaker
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// How long an open breaker rejects calls before probing
    #[serde(default = "default_breaker_timeout")]
    pub timeout_ms: u64,

    /// Probes admitted while half-open; this many successes close the breaker
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

fn default_max_failures() -> u32 {
    5
}

fn default_breaker_timeout() -> u64 {
    30_000
}

fn default_max_requests() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            timeout_ms: default_breaker_timeout(),
            max_requests: default_max_requests(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.max_failures == 0 {
            return Err(DbError::Config("circuit_breaker.max_failures must be at least 1".into()));
        }
        if self.max_requests == 0 {
            return Err(DbError::Config("circuit_breaker.max_requests must be at least 1".into()));
        }
        Ok(())
    }
}

/// Health monitor cadence and alert thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Warn when idle connections exceed this share of open connections
    #[serde(default = "default_max_idle_percent")]
    pub max_idle_percent: f64,

    /// Warn when fewer connections than this are open
    #[serde(default = "default_min_open")]
    pub min_open_connections: u32,

    /// Warn when the average acquire wait exceeds this
    #[serde(default = "default_max_avg_wait")]
    pub max_avg_wait_ms: u64,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,
}

fn default_interval() -> u64 {
    30_000
}

fn default_max_idle_percent() -> f64 {
    90.0
}

fn default_min_open() -> u32 {
    1
}

fn default_max_avg_wait() -> u64 {
    1000
}

fn default_ping_timeout() -> u64 {
    2000
}

fn default_query_timeout() -> u64 {
    5000
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval(),
            max_idle_percent: default_max_idle_percent(),
            min_open_connections: default_min_open(),
            max_avg_wait_ms: default_max_avg_wait(),
            ping_timeout_ms: default_ping_timeout(),
            query_timeout_ms: default_query_timeout(),
        }
    }
}

impl HealthMonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_avg_wait(&self) -> Duration {
        Duration::from_millis(self.max_avg_wait_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.interval_ms == 0 {
            return Err(DbError::Config("health.interval_ms must be positive".into()));
        }
        if !(0.0..=100.0).contains(&self.max_idle_percent) {
            return Err(DbError::Config(format!(
                "health.max_idle_percent must be within 0..=100, got {}",
                self.max_idle_percent
            )));
        }
        if self.ping_timeout_ms == 0 || self.query_timeout_ms == 0 {
            return Err(DbError::Config("health check timeouts must be positive".into()));
        }
        Ok(())
    }
}
