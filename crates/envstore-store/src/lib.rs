//! Environment and build records and the transactional store behind them.
//!
//! This crate provides the storage layer: the `Environment` and `Build`
//! records, the `Store` trait (committed reads and single-row writes) and the
//! `Transaction` trait (row locks plus buffered writes that become visible
//! atomically on commit). Two backends implement them: `MemoryStore`, used by
//! tests and the `memory` server mode, and `PgStore` (feature `postgres`).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod records;
pub mod traits;

pub use memory::{MemoryStore, MemoryTx};
#[cfg(feature = "postgres")]
pub use postgres::{IsolationLevel, PgStore, PgTx};
pub use records::{
    Build, BuildFilter, BuildUpdate, EnvKey, EnvStatus, Environment, EnvironmentFilter,
    EnvironmentUpdate, NewBuild, NewEnvironment,
};
pub use traits::{Store, Transaction};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("environment not found: {0}")]
    EnvNotFound(String),
    #[error("build not found: {0}")]
    BuildNotFound(String),
    #[error("environment name '{0}' is already in use")]
    NameConflict(String),
    #[error("build '{0}' already exists")]
    DuplicateBuild(String),
    #[error("unknown status '{0}'")]
    InvalidStatus(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_not_found() {
        let e = StoreError::EnvNotFound("env-1".to_owned());
        assert_eq!(e.to_string(), "environment not found: env-1");
        let e = StoreError::BuildNotFound("b-1".to_owned());
        assert!(e.to_string().contains("b-1"));
    }

    #[test]
    fn store_error_display_conflicts() {
        let e = StoreError::NameConflict("env-1".to_owned());
        assert!(e.to_string().contains("already in use"));
        let e = StoreError::DuplicateBuild("b-1".to_owned());
        assert!(e.to_string().contains("already exists"));
    }
}
