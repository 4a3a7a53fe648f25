//! Test utilities for Bastion crates.

use std::path::PathBuf;
use std::sync::Once;
use tempfile::TempDir;

fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// A SQLite database file inside a temporary directory.
///
/// The file is removed with the directory when this value drops, so keep it
/// alive for as long as the pool using it.
pub struct TempDatabase {
    dir: TempDir,
    path: PathBuf,
}

impl TempDatabase {
    /// Reserve a fresh database path. The file itself is created by the driver.
    pub fn new() -> Self {
        let dir = temp_dir();
        let path = dir.path().join("bastion-test.db");
        Self { dir, path }
    }

    /// Database file path as a string, ready for a pool config.
    pub fn path(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Directory holding the database (and its WAL files).
    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }
}

impl Default for TempDatabase {
    fn default() -> Self {
        Self::new()
    }
}

static TRACING: Once = Once::new();

/// Install a log subscriber once per test binary, honouring `BASTION_LOG_*`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        // Another harness may already own the global subscriber.
        let _ = bastion_common_log::init(bastion_common_log::LogConfig::from_env());
    });
}

/// Assert that a Result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
}

/// Assert that a Result is Err and return the error.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match $expr {
            Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
            Err(e) => e,
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_temp_database_path_lives_in_dir() {
        let db = TempDatabase::new();
        assert!(db.dir().exists());
        assert!(db.path().ends_with("bastion-test.db"));
        assert!(!std::path::Path::new(&db.path()).exists());
    }

    #[test]
    fn test_assert_macros() {
        let ok: Result<u8, String> = Ok(3);
        assert_eq!(assert_ok!(ok), 3);
        let err: Result<u8, String> = Err("boom".into());
        assert_eq!(assert_err!(err), "boom");
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    proptest! {
        #[test]
        fn test_temp_databases_are_distinct(n in 2usize..5) {
            let dbs: Vec<_> = (0..n).map(|_| TempDatabase::new()).collect();
            let mut paths: Vec<_> = dbs.iter().map(|d| d.path()).collect();
            paths.sort();
            paths.dedup();
            prop_assert_eq!(paths.len(), n);
        }
    }
}
