//! Shared helpers for database integration tests.

#![allow(dead_code)]

use bastion_database::{Database, DatabaseConfig, Migration};
use bastion_test_utils::TempDatabase;

pub fn config_for(tmp: &TempDatabase) -> DatabaseConfig {
    DatabaseConfig::new(tmp.path())
        .max_connections(4)
        .min_connections(0)
        .max_idle(2)
}

/// Fresh file database. The returned `TempDatabase` owns the file.
pub async fn open_db() -> (TempDatabase, Database) {
    bastion_test_utils::init_tracing();
    let tmp = TempDatabase::new();
    let db = Database::connect(config_for(&tmp))
        .await
        .expect("Failed to open test database");
    (tmp, db)
}

/// Second pool on the same file, standing in for another process.
pub async fn reopen(tmp: &TempDatabase) -> Database {
    Database::connect(config_for(tmp))
        .await
        .expect("Failed to reopen test database")
}

pub fn create_table(version: i64) -> Migration {
    Migration::sql(
        version,
        format!("create t{version}"),
        format!("CREATE TABLE t{version} (id INTEGER PRIMARY KEY, note TEXT);"),
        format!("DROP TABLE t{version};"),
    )
}

pub async fn table_exists(db: &Database, name: &str) -> bool {
    db.fetch_optional(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        bastion_database::params![name],
    )
    .await
    .expect("Failed to query sqlite_master")
    .is_some()
}
