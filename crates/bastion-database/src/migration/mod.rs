//! Schema migrations with a cross-process lock.

mod lock;
mod runner;
mod types;

pub use runner::MigrationManager;
pub use types::{
    AppliedMigration, LockStatus, Migration, MigrationDirection, MigrationFn, MigrationReport,
    MigrationStatus, MigrationStep,
};
