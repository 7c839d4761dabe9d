//! Postgres backend.
//!
//! Row locks are `SELECT ... FOR UPDATE`; transactions run at the configured
//! isolation level (serializable unless told otherwise). Serialization
//! failures and deadlocks surface as [`StoreError::LockFailed`] and are never
//! retried here.

use crate::records::{
    Build, BuildFilter, BuildUpdate, EnvKey, EnvStatus, Environment, EnvironmentFilter,
    EnvironmentUpdate, NewBuild, NewEnvironment,
};
use crate::traits::{Store, Transaction};
use crate::StoreError;
use async_trait::async_trait;
use envstore_schema::{BuildId, EnvName};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

const ENV_COLUMNS: &str =
    "id, name, project_id, provider, status, options, credentials, created_at, updated_at";
const BUILD_COLUMNS: &str = "id, uuid, environment_id, user_id, username, \"type\", status, \
     definition, mapping, validation, created_at, updated_at";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS environments (
        id          BIGSERIAL PRIMARY KEY,
        name        VARCHAR(100) NOT NULL UNIQUE,
        project_id  BIGINT NOT NULL DEFAULT 0,
        provider    TEXT NOT NULL DEFAULT '',
        status      TEXT NOT NULL,
        options     JSONB NOT NULL DEFAULT '{}',
        credentials JSONB NOT NULL DEFAULT '{}',
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS builds (
        id             BIGSERIAL PRIMARY KEY,
        uuid           TEXT NOT NULL UNIQUE,
        environment_id BIGINT NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
        user_id        BIGINT NOT NULL DEFAULT 0,
        username       TEXT NOT NULL DEFAULT '',
        \"type\"       TEXT NOT NULL,
        status         TEXT NOT NULL,
        definition     TEXT NOT NULL DEFAULT '',
        mapping        JSONB NOT NULL DEFAULT '{}',
        validation     JSONB,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at     TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS builds_environment_created_idx
        ON builds (environment_id, created_at DESC)",
];

/// Transaction isolation used by [`PgStore::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Every read-modify-write is serializable. A transaction that waited on
    /// a row lock while the holder changed the row fails with `LockFailed`.
    #[default]
    Serializable,
    /// Row locks alone order writers; a waiter re-reads the committed row
    /// once the lock is released.
    ReadCommitted,
}

impl IsolationLevel {
    fn statement(self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::Serializable => write!(f, "serializable"),
            IsolationLevel::ReadCommitted => write!(f, "read_committed"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serializable" => Ok(IsolationLevel::Serializable),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            other => Err(StoreError::Backend(format!(
                "unknown isolation level '{other}'"
            ))),
        }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = err {
        if matches!(db.code().as_deref(), Some("40001" | "40P01")) {
            return StoreError::LockFailed(db.message().to_owned());
        }
    }
    StoreError::Backend(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

fn env_from_row(row: &PgRow) -> Result<Environment, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(Environment {
        id: row.try_get("id").map_err(backend)?,
        name: EnvName::new(row.try_get::<String, _>("name").map_err(backend)?),
        project_id: row.try_get("project_id").map_err(backend)?,
        provider: row.try_get("provider").map_err(backend)?,
        status: status.parse()?,
        options: row.try_get("options").map_err(backend)?,
        credentials: row.try_get("credentials").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn build_from_row(row: &PgRow) -> Result<Build, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(Build {
        id: row.try_get("id").map_err(backend)?,
        uuid: BuildId::new(row.try_get::<String, _>("uuid").map_err(backend)?),
        environment_id: row.try_get("environment_id").map_err(backend)?,
        user_id: row.try_get("user_id").map_err(backend)?,
        username: row.try_get("username").map_err(backend)?,
        kind: row.try_get("type").map_err(backend)?,
        status: status.parse()?,
        definition: row.try_get("definition").map_err(backend)?,
        mapping: row.try_get("mapping").map_err(backend)?,
        validation: row.try_get("validation").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn push_env_key(query: &mut QueryBuilder<'_, Postgres>, key: &EnvKey) {
    match key {
        EnvKey::Id(id) => {
            query.push(" WHERE id = ");
            query.push_bind(*id);
        }
        EnvKey::Name(name) => {
            query.push(" WHERE name = ");
            query.push_bind(name.as_str().to_owned());
        }
    }
}

/// Store backed by a Postgres connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    isolation: IsolationLevel,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(backend)?;
        info!("connected to postgres (max {max_connections} connections)");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            isolation: IsolationLevel::default(),
        }
    }

    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and index if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        debug!("schema ensured");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query(self.isolation.statement())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        Ok(PgTx { tx })
    }

    async fn create_environment(&self, env: NewEnvironment) -> Result<Environment, StoreError> {
        let sql = format!(
            "INSERT INTO environments (name, project_id, provider, status, options, credentials) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {ENV_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(env.name.as_str())
            .bind(env.project_id)
            .bind(&env.provider)
            .bind(EnvStatus::Initializing.as_str())
            .bind(&env.options)
            .bind(&env.credentials)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::NameConflict(env.name.to_string())
                } else {
                    backend(e)
                }
            })?;
        env_from_row(&row)
    }

    async fn get_environment(&self, key: &EnvKey) -> Result<Environment, StoreError> {
        let mut query = QueryBuilder::new(format!("SELECT {ENV_COLUMNS} FROM environments"));
        push_env_key(&mut query, key);
        let row = query
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::EnvNotFound(key.to_string()))?;
        env_from_row(&row)
    }

    async fn find_environments(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<Environment>, StoreError> {
        let mut query =
            QueryBuilder::new(format!("SELECT {ENV_COLUMNS} FROM environments WHERE 1=1"));
        if !filter.ids.is_empty() {
            query.push(" AND id = ANY(");
            query.push_bind(filter.ids.clone());
            query.push(")");
        }
        if !filter.names.is_empty() {
            query.push(" AND name = ANY(");
            query.push_bind(filter.names.clone());
            query.push(")");
        }
        if let Some(project_id) = filter.project_id {
            query.push(" AND project_id = ");
            query.push_bind(project_id);
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ");
            query.push_bind(status.as_str());
        }
        query.push(" ORDER BY id");
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(env_from_row).collect()
    }

    async fn delete_environment(&self, key: &EnvKey) -> Result<(), StoreError> {
        let mut query = QueryBuilder::new("DELETE FROM environments");
        push_env_key(&mut query, key);
        let result = query
            .build()
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::EnvNotFound(key.to_string()));
        }
        Ok(())
    }

    async fn get_build(&self, uuid: &BuildId) -> Result<Build, StoreError> {
        let sql = format!("SELECT {BUILD_COLUMNS} FROM builds WHERE uuid = $1");
        let row = sqlx::query(&sql)
            .bind(uuid.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::BuildNotFound(uuid.to_string()))?;
        build_from_row(&row)
    }

    async fn find_builds(&self, filter: &BuildFilter) -> Result<Vec<Build>, StoreError> {
        let mut query = QueryBuilder::new(format!("SELECT {BUILD_COLUMNS} FROM builds WHERE 1=1"));
        if let Some(environment_id) = filter.environment_id {
            query.push(" AND environment_id = ");
            query.push_bind(environment_id);
        }
        if let Some(user_id) = filter.user_id {
            query.push(" AND user_id = ");
            query.push_bind(user_id);
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ");
            query.push_bind(status.as_str());
        }
        query.push(" ORDER BY created_at DESC, id DESC");
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(build_from_row).collect()
    }

    async fn delete_build(&self, uuid: &BuildId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM builds WHERE uuid = $1")
            .bind(uuid.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::BuildNotFound(uuid.to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("postgres pool closed");
    }
}

/// Transaction over a [`PgStore`]. Dropping it rolls back.
pub struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTx {
    async fn lock_environment(&mut self, key: &EnvKey) -> Result<Environment, StoreError> {
        let mut query = QueryBuilder::new(format!("SELECT {ENV_COLUMNS} FROM environments"));
        push_env_key(&mut query, key);
        query.push(" FOR UPDATE");
        let row = query
            .build()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::EnvNotFound(key.to_string()))?;
        env_from_row(&row)
    }

    async fn lock_build(&mut self, uuid: &BuildId) -> Result<Build, StoreError> {
        let sql = format!("SELECT {BUILD_COLUMNS} FROM builds WHERE uuid = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(uuid.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::BuildNotFound(uuid.to_string()))?;
        build_from_row(&row)
    }

    async fn latest_build(&mut self, environment_id: i64) -> Result<Option<Build>, StoreError> {
        let sql = format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE environment_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(environment_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(backend)?;
        row.as_ref().map(build_from_row).transpose()
    }

    async fn update_environment(
        &mut self,
        environment_id: i64,
        update: &EnvironmentUpdate,
    ) -> Result<Environment, StoreError> {
        let sql = format!(
            "UPDATE environments SET \
               status = COALESCE($2, status), \
               options = COALESCE($3, options), \
               credentials = COALESCE($4, credentials), \
               updated_at = now() \
             WHERE id = $1 RETURNING {ENV_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(environment_id)
            .bind(update.status.map(EnvStatus::as_str))
            .bind(update.options.as_ref())
            .bind(update.credentials.as_ref())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::EnvNotFound(environment_id.to_string()))?;
        env_from_row(&row)
    }

    async fn update_build(
        &mut self,
        build_id: i64,
        update: &BuildUpdate,
    ) -> Result<Build, StoreError> {
        let sql = format!(
            "UPDATE builds SET \
               status = COALESCE($2, status), \
               definition = COALESCE($3, definition), \
               mapping = COALESCE($4, mapping), \
               validation = COALESCE($5, validation), \
               updated_at = now() \
             WHERE id = $1 RETURNING {BUILD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(build_id)
            .bind(update.status.map(EnvStatus::as_str))
            .bind(update.definition.as_deref())
            .bind(update.mapping.as_ref())
            .bind(update.validation.as_ref())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::BuildNotFound(build_id.to_string()))?;
        build_from_row(&row)
    }

    async fn insert_build(&mut self, build: NewBuild) -> Result<Build, StoreError> {
        let sql = format!(
            "INSERT INTO builds \
               (uuid, environment_id, user_id, username, \"type\", status, definition, mapping) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {BUILD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(build.uuid.as_str())
            .bind(build.environment_id)
            .bind(build.user_id)
            .bind(&build.username)
            .bind(&build.kind)
            .bind(build.status.as_str())
            .bind(&build.definition)
            .bind(&build.mapping)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateBuild(build.uuid.to_string())
                } else if is_foreign_key_violation(&e) {
                    StoreError::EnvNotFound(build.environment_id.to_string())
                } else {
                    backend(e)
                }
            })?;
        build_from_row(&row)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(backend)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(backend)
    }
}
