use crate::records::{
    Build, BuildFilter, BuildUpdate, EnvKey, Environment, EnvironmentFilter, EnvironmentUpdate,
    NewBuild, NewEnvironment,
};
use crate::StoreError;
use async_trait::async_trait;
use envstore_schema::BuildId;

/// Persistence for environments and builds.
///
/// Plain methods read committed state or perform a single self-contained
/// write. Anything that reads a row and writes it back based on what it read
/// must go through [`Store::begin`] and take the row lock first.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: Transaction;

    /// Start a transaction. Dropping it without [`Transaction::commit`]
    /// discards its writes and releases its locks.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    // ── Environments ──

    async fn create_environment(&self, env: NewEnvironment) -> Result<Environment, StoreError>;
    async fn get_environment(&self, key: &EnvKey) -> Result<Environment, StoreError>;
    async fn find_environments(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<Environment>, StoreError>;
    /// Delete an environment and every build that belongs to it.
    async fn delete_environment(&self, key: &EnvKey) -> Result<(), StoreError>;

    // ── Builds ──

    async fn get_build(&self, uuid: &BuildId) -> Result<Build, StoreError>;
    /// Matching builds, newest first.
    async fn find_builds(&self, filter: &BuildFilter) -> Result<Vec<Build>, StoreError>;
    async fn delete_build(&self, uuid: &BuildId) -> Result<(), StoreError>;

    /// Release backend resources. Called once on shutdown.
    async fn close(&self) {}
}

/// A unit of work over the store.
///
/// Lock methods block until the row is free and hold it until commit or
/// rollback; callers lock the environment row before any build row.
#[async_trait]
pub trait Transaction: Send {
    async fn lock_environment(&mut self, key: &EnvKey) -> Result<Environment, StoreError>;
    async fn lock_build(&mut self, uuid: &BuildId) -> Result<Build, StoreError>;

    /// Most recent build of an environment as seen by this transaction.
    /// Does not lock it.
    async fn latest_build(&mut self, environment_id: i64) -> Result<Option<Build>, StoreError>;

    async fn update_environment(
        &mut self,
        environment_id: i64,
        update: &EnvironmentUpdate,
    ) -> Result<Environment, StoreError>;
    async fn update_build(&mut self, build_id: i64, update: &BuildUpdate)
        -> Result<Build, StoreError>;
    async fn insert_build(&mut self, build: NewBuild) -> Result<Build, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
    async fn rollback(self) -> Result<(), StoreError>;
}
