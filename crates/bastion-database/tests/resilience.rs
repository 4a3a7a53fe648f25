mod common;

use bastion_database::{
    params, AlertSeverity, CancellationToken, CircuitState, Database, DbError, ErrorClassifier,
    GuardedDatabase, HealthMonitor, HealthMonitorConfig, ResilienceConfig, RetryPolicy,
    TransactionManager,
};
use common::{config_for, open_db};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;

/// Treats every driver error as transient.
#[derive(Debug)]
struct AlwaysTransient;

impl ErrorClassifier for AlwaysTransient {
    fn is_retryable_code(&self, _code: &str) -> bool {
        true
    }

    fn is_retryable(&self, err: &DbError) -> bool {
        matches!(err, DbError::Sqlx(_))
    }
}

#[tokio::test]
async fn test_yaml_config_to_guarded_transactions() {
    let tmp = bastion_test_utils::TempDatabase::new();
    std::env::set_var("BASTION_TEST_DB_PATH", tmp.path());
    let config = ResilienceConfig::from_yaml(
        r#"
database:
  path: ${BASTION_TEST_DB_PATH}
  max_open_connections: 3
  min_connections: 0
  max_idle_connections: 2
retry:
  max_attempts: 3
  initial_interval_ms: 5
  max_interval_ms: 20
circuit_breaker:
  max_failures: 3
  timeout_ms: 1000
"#,
    )
    .unwrap();
    assert_eq!(config.database.path, tmp.path());

    let cancel = CancellationToken::new();
    let db = Database::connect_with_retry(&cancel, config.database.clone(), &config.retry)
        .await
        .unwrap();
    let guarded = GuardedDatabase::new(db, config.circuit_breaker.clone()).with_retry(config.retry);

    guarded
        .execute(
            &cancel,
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, qty INTEGER NOT NULL CHECK (qty > 0))",
            &[],
        )
        .await
        .unwrap();

    let inserted: i64 = guarded
        .transaction(&cancel, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO orders (qty) VALUES (?)", params![2]).await?;
                tx.execute("INSERT INTO orders (qty) VALUES (?)", params![5]).await?;
                let row = tx.fetch_one("SELECT COUNT(*) AS n FROM orders", &[]).await?;
                Ok(row.get("n"))
            })
        })
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    // A constraint violation is permanent: no retry, no breaker failure.
    let err = guarded
        .transaction(&cancel, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO orders (qty) VALUES (?)", params![0]).await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Sqlx(_)));
    assert_eq!(guarded.breaker().state(), CircuitState::Closed);

    let rows = guarded
        .query(&cancel, "SELECT qty FROM orders ORDER BY id", &[])
        .await
        .unwrap();
    let quantities: Vec<i64> = rows.iter().map(|r| r.get("qty")).collect();
    assert_eq!(quantities, vec![2, 5]);
}

#[tokio::test]
async fn test_custom_classifier_trips_breaker() {
    let (_tmp, db) = open_db().await;
    let db = db.with_classifier(Arc::new(AlwaysTransient));
    let guarded = GuardedDatabase::new(
        db.clone(),
        bastion_database::CircuitBreakerConfig {
            max_failures: 2,
            timeout_ms: 50,
            max_requests: 1,
        },
    );
    let cancel = CancellationToken::new();

    guarded.ping(&cancel).await.unwrap();
    db.close().await;

    for _ in 0..2 {
        let err = guarded.ping(&cancel).await.unwrap_err();
        assert!(!err.is_breaker_open());
    }
    assert_eq!(guarded.breaker().state(), CircuitState::Open);
    assert!(guarded.ping(&cancel).await.unwrap_err().is_breaker_open());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(guarded.breaker().state(), CircuitState::HalfOpen);
    // The probe still fails, so the breaker reopens.
    assert!(!guarded.ping(&cancel).await.unwrap_err().is_breaker_open());
    assert_eq!(guarded.breaker().state(), CircuitState::Open);
    assert_eq!(guarded.breaker().metrics().totals.trips, 2);
}

#[tokio::test]
async fn test_monitor_alerts_on_low_open_connections() {
    let (_tmp, db) = open_db().await;
    let monitor = HealthMonitor::new(
        db,
        HealthMonitorConfig {
            interval_ms: 25,
            min_open_connections: 100,
            ..Default::default()
        },
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    monitor.register_alert_callback(move |alert| {
        let _ = tx.send(alert);
    });
    monitor.start().unwrap();

    let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no alert within 5s")
        .expect("alert channel closed");
    monitor.stop().await;

    assert_eq!(alert.id, "open_connections_low");
    assert_eq!(alert.severity, AlertSeverity::Warning);
    assert!(alert.metrics.healthy);
    assert!(alert.metrics.pool.open < 100);
}

#[tokio::test]
async fn test_monitor_survives_database_outage() {
    let (_tmp, db) = open_db().await;
    let monitor = HealthMonitor::new(
        db.clone(),
        HealthMonitorConfig {
            interval_ms: 20,
            ..Default::default()
        },
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    monitor.register_alert_callback(move |alert| {
        let _ = tx.send(alert);
    });

    db.close().await;
    monitor.start().unwrap();

    let mut critical = 0;
    while critical < 2 {
        let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if alert.severity == AlertSeverity::Critical {
            critical += 1;
        }
    }
    assert!(monitor.is_running());
    monitor.stop().await;
    assert!(!monitor.latest().unwrap().healthy);
}

#[tokio::test]
async fn test_transactions_share_pool_with_monitor() {
    let (tmp, db) = open_db().await;
    let tm = TransactionManager::new(db.clone());
    let monitor = HealthMonitor::new(db.clone(), HealthMonitorConfig::default());
    let cancel = CancellationToken::new();

    db.execute("CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT)", &[])
        .await
        .unwrap();

    let writers = (0..8).map(|n| {
        let tm = tm.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tm.with_transaction(&cancel, move |tx| {
                Box::pin(async move {
                    tx.execute("INSERT INTO events (kind) VALUES (?)", params![format!("e{n}")])
                        .await
                })
            })
            .await
        })
    });
    for handle in futures::future::join_all(writers).await {
        assert_eq!(handle.unwrap().unwrap(), 1);
    }

    let metrics = monitor.check_now().await;
    assert!(metrics.healthy);
    assert!(metrics.pool.open <= config_for(&tmp).max_open_connections);
}
