//! In-process backend.
//!
//! Committed rows live in one table set behind a short-lived mutex. Row locks
//! are per-row `tokio` mutexes held by a transaction until it commits or is
//! dropped, which gives the same blocking behaviour as `SELECT ... FOR UPDATE`.
//! Transaction writes are buffered and overlaid on reads, then applied to the
//! tables in one step on commit.

use crate::records::{
    Build, BuildFilter, BuildUpdate, EnvKey, EnvStatus, Environment, EnvironmentFilter,
    EnvironmentUpdate, NewBuild, NewEnvironment,
};
use crate::traits::{Store, Transaction};
use crate::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use envstore_schema::BuildId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Environment(i64),
    Build(i64),
}

#[derive(Default)]
struct Tables {
    last_environment_id: i64,
    last_build_id: i64,
    environments: BTreeMap<i64, Environment>,
    builds: BTreeMap<i64, Build>,
}

impl Tables {
    fn environment(&self, key: &EnvKey) -> Option<&Environment> {
        match key {
            EnvKey::Id(id) => self.environments.get(id),
            EnvKey::Name(_) => self.environments.values().find(|e| e.matches(key)),
        }
    }

    fn build(&self, uuid: &BuildId) -> Option<&Build> {
        self.builds.values().find(|b| b.uuid == *uuid)
    }
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, key: RowKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key).or_default())
    }

    /// Forget the locks of deleted rows. A lock someone still holds or
    /// waits on stays.
    fn prune_row_locks(&self, keys: impl IntoIterator<Item = RowKey>) {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&key);
            }
        }
    }
}

/// Row locks held by one unit of work. Re-locking a held row is a no-op.
#[derive(Default)]
struct RowGuards(HashMap<RowKey, OwnedMutexGuard<()>>);

impl RowGuards {
    async fn acquire(&mut self, shared: &Shared, key: RowKey) {
        if self.0.contains_key(&key) {
            return;
        }
        let lock = shared.row_lock(key);
        let guard = lock.lock_owned().await;
        self.0.insert(key, guard);
    }
}

/// Store backed by process memory. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn environment_id(&self, key: &EnvKey) -> Result<i64, StoreError> {
        self.shared
            .tables()
            .environment(key)
            .map(|e| e.id)
            .ok_or_else(|| StoreError::EnvNotFound(key.to_string()))
    }

    fn build_id(&self, uuid: &BuildId) -> Result<i64, StoreError> {
        self.shared
            .tables()
            .build(uuid)
            .map(|b| b.id)
            .ok_or_else(|| StoreError::BuildNotFound(uuid.to_string()))
    }

    fn build_ids_of(&self, environment_id: i64) -> Vec<i64> {
        self.shared
            .tables()
            .builds
            .values()
            .filter(|b| b.environment_id == environment_id)
            .map(|b| b.id)
            .collect()
    }

    fn release_deleted(&self, guards: RowGuards) {
        let keys: Vec<RowKey> = guards.0.keys().copied().collect();
        drop(guards);
        self.shared.prune_row_locks(keys);
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx {
            shared: Arc::clone(&self.shared),
            guards: RowGuards::default(),
            environments: BTreeMap::new(),
            builds: BTreeMap::new(),
            inserted: BTreeMap::new(),
        })
    }

    async fn create_environment(&self, env: NewEnvironment) -> Result<Environment, StoreError> {
        let mut tables = self.shared.tables();
        if tables.environments.values().any(|e| e.name == env.name) {
            return Err(StoreError::NameConflict(env.name.into_inner()));
        }
        tables.last_environment_id += 1;
        let now = Utc::now();
        let created = Environment {
            id: tables.last_environment_id,
            name: env.name,
            project_id: env.project_id,
            provider: env.provider,
            status: EnvStatus::Initializing,
            options: env.options,
            credentials: env.credentials,
            created_at: now,
            updated_at: now,
        };
        tables.environments.insert(created.id, created.clone());
        debug!("created environment {} ({})", created.name, created.id);
        Ok(created)
    }

    async fn get_environment(&self, key: &EnvKey) -> Result<Environment, StoreError> {
        self.shared
            .tables()
            .environment(key)
            .cloned()
            .ok_or_else(|| StoreError::EnvNotFound(key.to_string()))
    }

    async fn find_environments(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<Environment>, StoreError> {
        Ok(self
            .shared
            .tables()
            .environments
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn delete_environment(&self, key: &EnvKey) -> Result<(), StoreError> {
        let id = self.environment_id(key)?;
        let mut guards = RowGuards::default();
        guards
            .acquire(&self.shared, RowKey::Environment(id))
            .await;
        for build_id in self.build_ids_of(id) {
            guards.acquire(&self.shared, RowKey::Build(build_id)).await;
        }

        {
            let mut tables = self.shared.tables();
            if tables.environments.remove(&id).is_none() {
                return Err(StoreError::EnvNotFound(key.to_string()));
            }
            tables.builds.retain(|_, b| b.environment_id != id);
        }
        self.release_deleted(guards);
        debug!("deleted environment {key} and its builds");
        Ok(())
    }

    async fn get_build(&self, uuid: &BuildId) -> Result<Build, StoreError> {
        self.shared
            .tables()
            .build(uuid)
            .cloned()
            .ok_or_else(|| StoreError::BuildNotFound(uuid.to_string()))
    }

    async fn find_builds(&self, filter: &BuildFilter) -> Result<Vec<Build>, StoreError> {
        let mut builds: Vec<Build> = self
            .shared
            .tables()
            .builds
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect();
        builds.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(builds)
    }

    async fn delete_build(&self, uuid: &BuildId) -> Result<(), StoreError> {
        let id = self.build_id(uuid)?;
        let mut guards = RowGuards::default();
        guards.acquire(&self.shared, RowKey::Build(id)).await;

        if self.shared.tables().builds.remove(&id).is_none() {
            return Err(StoreError::BuildNotFound(uuid.to_string()));
        }
        self.release_deleted(guards);
        debug!("deleted build {uuid}");
        Ok(())
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTx {
    shared: Arc<Shared>,
    guards: RowGuards,
    environments: BTreeMap<i64, Environment>,
    builds: BTreeMap<i64, Build>,
    inserted: BTreeMap<i64, Build>,
}

impl MemoryTx {
    fn environment(&self, id: i64) -> Option<Environment> {
        self.environments
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables().environments.get(&id).cloned())
    }

    fn environment_id(&self, key: &EnvKey) -> Option<i64> {
        self.shared.tables().environment(key).map(|e| e.id)
    }

    fn build(&self, uuid: &BuildId) -> Option<Build> {
        let pending = self
            .inserted
            .values()
            .chain(self.builds.values())
            .find(|b| b.uuid == *uuid);
        match pending {
            Some(build) => Some(build.clone()),
            None => self.shared.tables().build(uuid).cloned(),
        }
    }

    fn build_by_id(&self, id: i64) -> Option<Build> {
        self.inserted
            .get(&id)
            .or_else(|| self.builds.get(&id))
            .cloned()
            .or_else(|| self.shared.tables().builds.get(&id).cloned())
    }

    fn newest_build(&self, environment_id: i64) -> Option<Build> {
        let tables = self.shared.tables();
        let committed = tables
            .builds
            .values()
            .filter(|b| b.environment_id == environment_id)
            .map(|b| self.builds.get(&b.id).unwrap_or(b));
        let inserted = self
            .inserted
            .values()
            .filter(|b| b.environment_id == environment_id);
        let newest = committed
            .chain(inserted)
            .max_by_key(|b| (b.created_at, b.id))
            .cloned();
        newest
    }

    fn next_build_id(&self) -> i64 {
        let mut tables = self.shared.tables();
        tables.last_build_id += 1;
        tables.last_build_id
    }

    fn apply(
        tables: &mut Tables,
        environments: BTreeMap<i64, Environment>,
        builds: BTreeMap<i64, Build>,
        inserted: BTreeMap<i64, Build>,
    ) -> Result<(), StoreError> {
        if let Some(env) = environments
            .values()
            .find(|e| !tables.environments.contains_key(&e.id))
        {
            return Err(StoreError::EnvNotFound(env.id.to_string()));
        }
        if let Some(build) = builds.values().find(|b| !tables.builds.contains_key(&b.id)) {
            return Err(StoreError::BuildNotFound(build.uuid.to_string()));
        }
        for build in inserted.values() {
            if !tables.environments.contains_key(&build.environment_id) {
                return Err(StoreError::EnvNotFound(build.environment_id.to_string()));
            }
            if tables.build(&build.uuid).is_some() {
                return Err(StoreError::DuplicateBuild(build.uuid.to_string()));
            }
        }
        tables.environments.extend(environments);
        tables.builds.extend(builds);
        tables.builds.extend(inserted);
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn lock_environment(&mut self, key: &EnvKey) -> Result<Environment, StoreError> {
        let id = self
            .environment_id(key)
            .ok_or_else(|| StoreError::EnvNotFound(key.to_string()))?;
        self.guards
            .acquire(&self.shared, RowKey::Environment(id))
            .await;
        // The row may have been deleted while we waited.
        self.environment(id)
            .filter(|e| e.matches(key))
            .ok_or_else(|| StoreError::EnvNotFound(key.to_string()))
    }

    async fn lock_build(&mut self, uuid: &BuildId) -> Result<Build, StoreError> {
        let id = self
            .build(uuid)
            .map(|b| b.id)
            .ok_or_else(|| StoreError::BuildNotFound(uuid.to_string()))?;
        self.guards.acquire(&self.shared, RowKey::Build(id)).await;
        self.build_by_id(id)
            .ok_or_else(|| StoreError::BuildNotFound(uuid.to_string()))
    }

    async fn latest_build(&mut self, environment_id: i64) -> Result<Option<Build>, StoreError> {
        Ok(self.newest_build(environment_id))
    }

    async fn update_environment(
        &mut self,
        environment_id: i64,
        update: &EnvironmentUpdate,
    ) -> Result<Environment, StoreError> {
        self.guards
            .acquire(&self.shared, RowKey::Environment(environment_id))
            .await;
        let mut env = self
            .environment(environment_id)
            .ok_or_else(|| StoreError::EnvNotFound(environment_id.to_string()))?;
        update.apply(&mut env, Utc::now());
        self.environments.insert(environment_id, env.clone());
        Ok(env)
    }

    async fn update_build(
        &mut self,
        build_id: i64,
        update: &BuildUpdate,
    ) -> Result<Build, StoreError> {
        self.guards
            .acquire(&self.shared, RowKey::Build(build_id))
            .await;
        let mut build = self
            .build_by_id(build_id)
            .ok_or_else(|| StoreError::BuildNotFound(build_id.to_string()))?;
        update.apply(&mut build, Utc::now());
        if self.inserted.contains_key(&build_id) {
            self.inserted.insert(build_id, build.clone());
        } else {
            self.builds.insert(build_id, build.clone());
        }
        Ok(build)
    }

    async fn insert_build(&mut self, build: NewBuild) -> Result<Build, StoreError> {
        self.guards
            .acquire(&self.shared, RowKey::Environment(build.environment_id))
            .await;
        if self.environment(build.environment_id).is_none() {
            return Err(StoreError::EnvNotFound(build.environment_id.to_string()));
        }
        if self.build(&build.uuid).is_some() {
            return Err(StoreError::DuplicateBuild(build.uuid.into_inner()));
        }
        let now = Utc::now();
        let created = Build {
            id: self.next_build_id(),
            uuid: build.uuid,
            environment_id: build.environment_id,
            user_id: build.user_id,
            username: build.username,
            kind: build.kind,
            status: build.status,
            definition: build.definition,
            mapping: build.mapping,
            validation: None,
            created_at: now,
            updated_at: now,
        };
        self.inserted.insert(created.id, created.clone());
        Ok(created)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let MemoryTx {
            shared,
            guards,
            environments,
            builds,
            inserted,
        } = self;
        let result = {
            let mut tables = shared.tables();
            Self::apply(&mut tables, environments, builds, inserted)
        };
        drop(guards);
        result
    }

    async fn rollback(self) -> Result<(), StoreError> {
        debug!(
            "rolling back transaction holding {} row lock(s)",
            self.guards.0.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn new_build(uuid: &str, environment_id: i64) -> NewBuild {
        NewBuild {
            uuid: BuildId::new(uuid),
            environment_id,
            user_id: 1,
            username: "alice".to_owned(),
            kind: "apply".to_owned(),
            status: EnvStatus::InProgress,
            definition: String::new(),
            mapping: json!({}),
        }
    }

    async fn store_with_env(name: &str) -> (MemoryStore, Environment) {
        let store = MemoryStore::new();
        let env = store
            .create_environment(NewEnvironment::named(name))
            .await
            .unwrap();
        (store, env)
    }

    #[tokio::test]
    async fn create_and_get_environment() {
        let (store, env) = store_with_env("env-1").await;
        assert_eq!(env.status, EnvStatus::Initializing);
        assert_eq!(store.get_environment(&EnvKey::Id(env.id)).await.unwrap(), env);
        assert_eq!(store.get_environment(&"env-1".into()).await.unwrap(), env);
        assert!(matches!(
            store.get_environment(&"nope".into()).await,
            Err(StoreError::EnvNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let (store, _) = store_with_env("env-1").await;
        let err = store
            .create_environment(NewEnvironment::named("env-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NameConflict(ref n) if n == "env-1"));
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let (store, env) = store_with_env("env-1").await;
        let mut tx = store.begin().await.unwrap();
        tx.lock_environment(&EnvKey::Id(env.id)).await.unwrap();
        tx.update_environment(env.id, &EnvironmentUpdate::status(EnvStatus::InProgress))
            .await
            .unwrap();
        tx.insert_build(new_build("b-1", env.id)).await.unwrap();
        assert_eq!(
            tx.latest_build(env.id).await.unwrap().unwrap().uuid,
            BuildId::new("b-1")
        );

        let committed = store.get_environment(&EnvKey::Id(env.id)).await.unwrap();
        assert_eq!(committed.status, EnvStatus::Initializing);
        assert!(store.get_build(&BuildId::new("b-1")).await.is_err());

        tx.rollback().await.unwrap();
        let after = store.get_environment(&EnvKey::Id(env.id)).await.unwrap();
        assert_eq!(after.status, EnvStatus::Initializing);
        assert!(store.get_build(&BuildId::new("b-1")).await.is_err());
    }

    #[tokio::test]
    async fn commit_applies_all_writes() {
        let (store, env) = store_with_env("env-1").await;
        let mut tx = store.begin().await.unwrap();
        tx.lock_environment(&EnvKey::Id(env.id)).await.unwrap();
        tx.update_environment(env.id, &EnvironmentUpdate::status(EnvStatus::InProgress))
            .await
            .unwrap();
        let build = tx.insert_build(new_build("b-1", env.id)).await.unwrap();
        tx.update_build(build.id, &BuildUpdate::mapping(json!({"components": []})))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let env = store.get_environment(&EnvKey::Id(env.id)).await.unwrap();
        assert_eq!(env.status, EnvStatus::InProgress);
        let build = store.get_build(&BuildId::new("b-1")).await.unwrap();
        assert_eq!(build.mapping, json!({"components": []}));
    }

    #[tokio::test]
    async fn dropped_transaction_releases_locks() {
        let (store, env) = store_with_env("env-1").await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.lock_environment(&EnvKey::Id(env.id)).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        let locked = tokio::time::timeout(
            Duration::from_secs(1),
            tx.lock_environment(&EnvKey::Id(env.id)),
        )
        .await;
        assert!(locked.is_ok());
    }

    #[tokio::test]
    async fn second_locker_waits_and_sees_committed_row() {
        let (store, env) = store_with_env("env-1").await;
        let mut first = store.begin().await.unwrap();
        first.lock_environment(&EnvKey::Id(env.id)).await.unwrap();

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut tx = waiter_store.begin().await.unwrap();
            let seen = tx.lock_environment(&EnvKey::Id(env.id)).await.unwrap();
            seen.status
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first
            .update_environment(env.id, &EnvironmentUpdate::status(EnvStatus::Syncing))
            .await
            .unwrap();
        first.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap(), EnvStatus::Syncing);
    }

    #[tokio::test]
    async fn duplicate_uuid_across_transactions_fails_at_commit() {
        let store = MemoryStore::new();
        let a = store
            .create_environment(NewEnvironment::named("a"))
            .await
            .unwrap();
        let b = store
            .create_environment(NewEnvironment::named("b"))
            .await
            .unwrap();

        let mut tx1 = store.begin().await.unwrap();
        let mut tx2 = store.begin().await.unwrap();
        tx1.insert_build(new_build("same", a.id)).await.unwrap();
        tx2.insert_build(new_build("same", b.id)).await.unwrap();
        tx1.commit().await.unwrap();
        assert!(matches!(
            tx2.commit().await,
            Err(StoreError::DuplicateBuild(_))
        ));
    }

    #[tokio::test]
    async fn delete_environment_cascades() {
        let (store, env) = store_with_env("env-1").await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_build(new_build("b-1", env.id)).await.unwrap();
        tx.commit().await.unwrap();

        store.delete_environment(&"env-1".into()).await.unwrap();
        assert!(store.get_build(&BuildId::new("b-1")).await.is_err());
        assert!(store
            .find_builds(&BuildFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    fn row_lock_count(store: &MemoryStore) -> usize {
        store.shared.row_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn deletes_forget_row_locks() {
        let (store, env) = store_with_env("env-1").await;
        let mut tx = store.begin().await.unwrap();
        tx.lock_environment(&EnvKey::Id(env.id)).await.unwrap();
        tx.insert_build(new_build("b-1", env.id)).await.unwrap();
        tx.insert_build(new_build("b-2", env.id)).await.unwrap();
        tx.commit().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.lock_build(&BuildId::new("b-2")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(row_lock_count(&store), 2);

        store.delete_build(&BuildId::new("b-2")).await.unwrap();
        assert_eq!(row_lock_count(&store), 1);

        store.delete_environment(&EnvKey::Id(env.id)).await.unwrap();
        assert_eq!(row_lock_count(&store), 0);
    }

    #[tokio::test]
    async fn held_row_lock_survives_delete_of_other_rows() {
        let (store, env) = store_with_env("env-1").await;
        let other = store
            .create_environment(NewEnvironment::named("env-2"))
            .await
            .unwrap();
        let mut held = store.begin().await.unwrap();
        held.lock_environment(&EnvKey::Id(other.id)).await.unwrap();

        store.delete_environment(&EnvKey::Id(env.id)).await.unwrap();
        assert_eq!(row_lock_count(&store), 1);
        held.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn find_builds_newest_first() {
        let (store, env) = store_with_env("env-1").await;
        for uuid in ["b-1", "b-2", "b-3"] {
            let mut tx = store.begin().await.unwrap();
            tx.insert_build(new_build(uuid, env.id)).await.unwrap();
            tx.commit().await.unwrap();
        }
        let found = store
            .find_builds(&BuildFilter {
                environment_id: Some(env.id),
                ..BuildFilter::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|b| b.uuid.as_str()).collect();
        assert_eq!(ids, vec!["b-3", "b-2", "b-1"]);
    }
}
