use crate::lifecycle::{self, Action};
use crate::mutation::{self, MappingOp};
use crate::CoreError;
use envstore_schema::{BuildId, EnvName, Mapping};
use envstore_store::{
    Build, BuildFilter, BuildUpdate, EnvKey, EnvStatus, Environment, EnvironmentFilter,
    EnvironmentUpdate, NewBuild, NewEnvironment, Store, Transaction,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

const MAX_NAME_LEN: usize = 100;
const SCHEDULES_FIELD: &str = "schedules";
/// Completion events of this build type remove the environment.
const DELETE_BUILD_TYPE: &str = "delete";

/// Commit `tx` if `result` is `Ok`, otherwise roll it back.
pub(crate) async fn finish<T: Transaction, R>(
    tx: T,
    result: Result<R, CoreError>,
) -> Result<R, CoreError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!("rollback after '{e}' failed: {rollback}");
            }
            Err(e)
        }
    }
}

/// A request to start a new build of an environment.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub environment: EnvKey,
    pub action: Action,
    /// Correlation id; generated when absent.
    pub uuid: Option<BuildId>,
    pub user_id: i64,
    pub username: String,
    pub definition: String,
    pub mapping: Option<Value>,
}

impl BuildRequest {
    pub fn new(environment: impl Into<EnvKey>, action: Action) -> Self {
        Self {
            environment: environment.into(),
            action,
            uuid: None,
            user_id: 0,
            username: String::new(),
            definition: String::new(),
            mapping: None,
        }
    }
}

/// Which build a status update addresses.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildTarget {
    Id(BuildId),
    /// The most recent build of an environment.
    LatestOf(EnvKey),
}

/// Outcome reported by a build completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    Errored,
}

impl Completion {
    fn status(self) -> EnvStatus {
        match self {
            Completion::Done => EnvStatus::Done,
            Completion::Errored => EnvStatus::Errored,
        }
    }
}

/// Build search criteria. `environment` may name the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildQuery {
    pub environment: Option<EnvKey>,
    pub user_id: Option<i64>,
    pub status: Option<EnvStatus>,
}

fn validate_env_name(name: &EnvName) -> Result<(), CoreError> {
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(CoreError::BadRequest(format!(
            "environment name must be 1-{MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn parse_mapping(value: Value) -> Result<Mapping, CoreError> {
    Mapping::from_value(value).map_err(|e| CoreError::BadRequest(e.to_string()))
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Record-store engine over a [`Store`] backend.
///
/// Holds the only store handle; callers share the engine (it is `Sync`) and
/// every operation borrows it for the duration of one request.
pub struct Engine<S: Store> {
    store: S,
}

impl<S: Store> Engine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Release the store. Called once on shutdown.
    pub async fn close(&self) {
        self.store.close().await;
    }

    // ── Environments ──

    pub async fn create_environment(&self, env: NewEnvironment) -> Result<Environment, CoreError> {
        validate_env_name(&env.name)?;
        let created = self.store.create_environment(env).await?;
        info!("environment {} created ({})", created.name, created.id);
        Ok(created)
    }

    pub async fn get_environment(&self, key: &EnvKey) -> Result<Environment, CoreError> {
        Ok(self.store.get_environment(key).await?)
    }

    pub async fn find_environments(
        &self,
        filter: &EnvironmentFilter,
    ) -> Result<Vec<Environment>, CoreError> {
        Ok(self.store.find_environments(filter).await?)
    }

    /// Replace options and/or credentials. Status only moves through the
    /// state machine and build status updates.
    pub async fn update_environment(
        &self,
        key: &EnvKey,
        options: Option<Value>,
        credentials: Option<Value>,
    ) -> Result<Environment, CoreError> {
        let update = EnvironmentUpdate {
            status: None,
            options,
            credentials,
        };
        let mut tx = self.store.begin().await?;
        let result = update_locked_environment(&mut tx, key, &update).await;
        finish(tx, result).await
    }

    pub async fn delete_environment(&self, key: &EnvKey) -> Result<(), CoreError> {
        self.store.delete_environment(key).await?;
        info!("environment {key} deleted");
        Ok(())
    }

    /// Store `schedule` under `options.schedules.<schedule_id>`.
    pub async fn set_schedule(
        &self,
        key: &EnvKey,
        schedule_id: &str,
        schedule: Value,
    ) -> Result<(), CoreError> {
        if schedule_id.is_empty() {
            return Err(CoreError::BadRequest(
                "a valid schedule id must be provided".to_owned(),
            ));
        }
        self.edit_schedules(key, |schedules| {
            schedules.insert(schedule_id.to_owned(), schedule);
        })
        .await
    }

    pub async fn delete_schedule(&self, key: &EnvKey, schedule_id: &str) -> Result<(), CoreError> {
        self.edit_schedules(key, |schedules| {
            schedules.remove(schedule_id);
        })
        .await
    }

    async fn edit_schedules(
        &self,
        key: &EnvKey,
        edit: impl FnOnce(&mut Map<String, Value>) + Send,
    ) -> Result<(), CoreError> {
        let mut tx = self.store.begin().await?;
        let result = edit_locked_schedules(&mut tx, key, edit).await;
        finish(tx, result).await
    }

    /// Run the state machine for `action` on an environment and return its
    /// new status.
    pub async fn apply_action(&self, key: &EnvKey, action: Action) -> Result<EnvStatus, CoreError> {
        let mut tx = self.store.begin().await?;
        let result = run_locked_action(&mut tx, key, action).await;
        finish(tx, result).await
    }

    // ── Builds ──

    /// Create a build if the environment's state machine accepts its action.
    ///
    /// The environment row stays locked from the transition check until the
    /// build row is inserted; the new build carries the environment's new
    /// status.
    pub async fn create_build(&self, mut request: BuildRequest) -> Result<Build, CoreError> {
        let mapping = match request.mapping.take() {
            Some(value) => parse_mapping(value)?.to_value()?,
            None => Mapping::new().to_value()?,
        };
        let uuid = request
            .uuid
            .take()
            .unwrap_or_else(|| BuildId::new(uuid::Uuid::new_v4().to_string()));

        let mut tx = self.store.begin().await?;
        let result = gate_build(&mut tx, request, uuid, mapping).await;
        let build = finish(tx, result).await?;
        info!(
            "build {} ({}) created for environment {}",
            build.uuid, build.kind, build.environment_id
        );
        Ok(build)
    }

    pub async fn get_build(&self, uuid: &BuildId) -> Result<Build, CoreError> {
        Ok(self.store.get_build(uuid).await?)
    }

    /// Matching builds, newest first. An unknown environment matches nothing.
    pub async fn find_builds(&self, query: &BuildQuery) -> Result<Vec<Build>, CoreError> {
        let environment_id = match &query.environment {
            Some(EnvKey::Id(id)) => Some(*id),
            Some(key) => match self.store.get_environment(key).await {
                Ok(env) => Some(env.id),
                Err(envstore_store::StoreError::EnvNotFound(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        let filter = BuildFilter {
            environment_id,
            user_id: query.user_id,
            status: query.status,
        };
        Ok(self.store.find_builds(&filter).await?)
    }

    /// Update build fields under the build row lock. A replacement mapping
    /// must be a valid mapping document.
    pub async fn update_build(
        &self,
        uuid: &BuildId,
        mut update: BuildUpdate,
    ) -> Result<Build, CoreError> {
        if let Some(mapping) = update.mapping.take() {
            update.mapping = Some(parse_mapping(mapping)?.to_value()?);
        }
        let mut tx = self.store.begin().await?;
        let result = update_locked_build(&mut tx, uuid, &update).await;
        finish(tx, result).await
    }

    pub async fn delete_build(&self, uuid: &BuildId) -> Result<(), CoreError> {
        self.store.delete_build(uuid).await?;
        info!("build {uuid} deleted");
        Ok(())
    }

    pub async fn get_mapping(&self, uuid: &BuildId) -> Result<Mapping, CoreError> {
        let build = self.store.get_build(uuid).await?;
        Ok(Mapping::from_value(build.mapping)?)
    }

    /// Replace the whole mapping of a build.
    pub async fn set_mapping(&self, uuid: &BuildId, mapping: Value) -> Result<(), CoreError> {
        let mapping = parse_mapping(mapping)?;
        self.mutate_mapping(uuid, MappingOp::Replace(mapping))
            .await?;
        Ok(())
    }

    /// Apply one edit to a build's mapping under its row lock.
    pub async fn mutate_mapping(
        &self,
        uuid: &BuildId,
        op: MappingOp,
    ) -> Result<Mapping, CoreError> {
        mutation::mutate_mapping(&self.store, uuid, op).await
    }

    pub async fn get_definition(&self, uuid: &BuildId) -> Result<String, CoreError> {
        Ok(self.store.get_build(uuid).await?.definition)
    }

    pub async fn set_definition(&self, uuid: &BuildId, definition: String) -> Result<(), CoreError> {
        let update = BuildUpdate {
            definition: Some(definition),
            ..BuildUpdate::default()
        };
        self.update_build(uuid, update).await?;
        Ok(())
    }

    pub async fn get_validation(&self, uuid: &BuildId) -> Result<Option<Value>, CoreError> {
        Ok(self.store.get_build(uuid).await?.validation)
    }

    pub async fn set_validation(&self, uuid: &BuildId, validation: Value) -> Result<(), CoreError> {
        let update = BuildUpdate {
            validation: Some(validation),
            ..BuildUpdate::default()
        };
        self.update_build(uuid, update).await?;
        Ok(())
    }

    /// Set a build's status and echo it onto its environment.
    ///
    /// Locks the environment row, then the build row.
    pub async fn set_build_status(
        &self,
        target: &BuildTarget,
        status: EnvStatus,
    ) -> Result<Build, CoreError> {
        let env_key = match target {
            BuildTarget::Id(uuid) => EnvKey::Id(self.store.get_build(uuid).await?.environment_id),
            BuildTarget::LatestOf(key) => key.clone(),
        };

        let mut tx = self.store.begin().await?;
        let result = set_locked_build_status(&mut tx, &env_key, target, status).await;
        let build = finish(tx, result).await?;
        debug!("build {} status -> {status}", build.uuid);
        Ok(build)
    }

    /// Record the outcome of a finished build of type `build_type`. A
    /// successful `delete` build removes its environment afterwards.
    pub async fn complete_build(
        &self,
        uuid: &BuildId,
        build_type: &str,
        outcome: Completion,
    ) -> Result<Build, CoreError> {
        let build = self
            .set_build_status(&BuildTarget::Id(uuid.clone()), outcome.status())
            .await?;
        if outcome == Completion::Done && build_type == DELETE_BUILD_TYPE {
            self.delete_environment(&EnvKey::Id(build.environment_id))
                .await?;
        }
        Ok(build)
    }
}

// Transaction bodies. Each runs inside a transaction opened by the caller,
// which commits or rolls back through `finish`.

async fn update_locked_environment<T: Transaction>(
    tx: &mut T,
    key: &EnvKey,
    update: &EnvironmentUpdate,
) -> Result<Environment, CoreError> {
    let env = tx.lock_environment(key).await?;
    Ok(tx.update_environment(env.id, update).await?)
}

async fn edit_locked_schedules<T: Transaction>(
    tx: &mut T,
    key: &EnvKey,
    edit: impl FnOnce(&mut Map<String, Value>) + Send,
) -> Result<(), CoreError> {
    let env = tx.lock_environment(key).await?;
    let mut options = into_object(env.options);
    let mut schedules = into_object(options.remove(SCHEDULES_FIELD).unwrap_or_default());
    edit(&mut schedules);
    options.insert(SCHEDULES_FIELD.to_owned(), Value::Object(schedules));
    let update = EnvironmentUpdate {
        options: Some(Value::Object(options)),
        ..EnvironmentUpdate::default()
    };
    tx.update_environment(env.id, &update).await?;
    Ok(())
}

async fn run_locked_action<T: Transaction>(
    tx: &mut T,
    key: &EnvKey,
    action: Action,
) -> Result<EnvStatus, CoreError> {
    let env = tx.lock_environment(key).await?;
    lifecycle::run(tx, &env, action).await
}

async fn gate_build<T: Transaction>(
    tx: &mut T,
    request: BuildRequest,
    uuid: BuildId,
    mapping: Value,
) -> Result<Build, CoreError> {
    let env = tx.lock_environment(&request.environment).await?;
    let status = lifecycle::run(tx, &env, request.action).await?;
    let build = tx
        .insert_build(NewBuild {
            uuid,
            environment_id: env.id,
            user_id: request.user_id,
            username: request.username,
            kind: request.action.to_string(),
            status,
            definition: request.definition,
            mapping,
        })
        .await?;
    Ok(build)
}

async fn update_locked_build<T: Transaction>(
    tx: &mut T,
    uuid: &BuildId,
    update: &BuildUpdate,
) -> Result<Build, CoreError> {
    let build = tx.lock_build(uuid).await?;
    if update.is_empty() {
        return Ok(build);
    }
    Ok(tx.update_build(build.id, update).await?)
}

async fn set_locked_build_status<T: Transaction>(
    tx: &mut T,
    env_key: &EnvKey,
    target: &BuildTarget,
    status: EnvStatus,
) -> Result<Build, CoreError> {
    let env = tx.lock_environment(env_key).await?;
    let uuid = match target {
        BuildTarget::Id(uuid) => uuid.clone(),
        BuildTarget::LatestOf(key) => {
            tx.latest_build(env.id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("environment {key} has no builds")))?
                .uuid
        }
    };
    let build = tx.lock_build(&uuid).await?;
    if build.environment_id != env.id {
        return Err(CoreError::NotFound(format!(
            "build {uuid} does not belong to environment {env_key}"
        )));
    }
    let build = tx
        .update_build(build.id, &BuildUpdate::status(status))
        .await?;
    tx.update_environment(env.id, &EnvironmentUpdate::status(status))
        .await?;
    Ok(build)
}
