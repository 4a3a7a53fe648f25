use crate::config::DatabaseConfig;
use crate::connection::Database;
use bastion_test_utils::TempDatabase;

/// File-backed config small enough to reason about in tests.
pub fn file_config(tmp: &TempDatabase) -> DatabaseConfig {
    DatabaseConfig::new(tmp.path())
        .max_connections(4)
        .min_connections(0)
        .max_idle(2)
}

/// Open a fresh WAL database. Keep the `TempDatabase` alive with the pool.
pub async fn open() -> (TempDatabase, Database) {
    bastion_test_utils::init_tracing();
    let tmp = TempDatabase::new();
    let db = Database::connect(file_config(&tmp))
        .await
        .expect("open test database");
    (tmp, db)
}
