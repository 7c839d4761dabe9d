//! Subject routing.
//!
//! Every request names a subject (`environment.get`, `build.set.mapping.component`,
//! `build.delete.done`, ...) and carries a JSON payload. [`dispatch`] decodes
//! the payload for that subject, runs the matching [`Engine`] operation and
//! encodes the reply. Domain failures become `{"error", "kind"}` replies; the
//! transport never sees a Rust error.

use envstore_core::{
    owning_build, Action, BuildQuery, BuildRequest, BuildTarget, Completion, CoreError, Engine,
    ErrorKind, MappingOp,
};
use envstore_schema::{BuildId, Entry};
use envstore_store::{
    BuildUpdate, EnvKey, EnvStatus, EnvironmentFilter, NewEnvironment, Store, StoreError,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    EnvironmentGet,
    EnvironmentFind,
    EnvironmentSet,
    EnvironmentDel,
    EnvironmentSetAction,
    EnvironmentSetSchedule,
    EnvironmentDelSchedule,
    BuildCreate,
    BuildGet,
    BuildFind,
    BuildSet,
    BuildDel,
    BuildGetMapping,
    BuildSetMapping,
    BuildSetComponent,
    BuildDelComponent,
    BuildSetChange,
    BuildDelChange,
    BuildGetDefinition,
    BuildSetDefinition,
    BuildGetValidation,
    BuildSetValidation,
    BuildSetStatus,
    /// `build.<type>.done`
    BuildDone(String),
    /// `build.<type>.error`
    BuildError(String),
}

const ROUTES: &[(&str, Subject)] = &[
    ("environment.get", Subject::EnvironmentGet),
    ("environment.find", Subject::EnvironmentFind),
    ("environment.set", Subject::EnvironmentSet),
    ("environment.del", Subject::EnvironmentDel),
    ("environment.set.action", Subject::EnvironmentSetAction),
    ("environment.set.schedule", Subject::EnvironmentSetSchedule),
    ("environment.del.schedule", Subject::EnvironmentDelSchedule),
    ("build.create", Subject::BuildCreate),
    ("build.get", Subject::BuildGet),
    ("build.find", Subject::BuildFind),
    ("build.set", Subject::BuildSet),
    ("build.del", Subject::BuildDel),
    ("build.get.mapping", Subject::BuildGetMapping),
    ("build.set.mapping", Subject::BuildSetMapping),
    ("build.set.mapping.component", Subject::BuildSetComponent),
    ("build.del.mapping.component", Subject::BuildDelComponent),
    ("build.set.mapping.change", Subject::BuildSetChange),
    ("build.del.mapping.change", Subject::BuildDelChange),
    ("build.get.definition", Subject::BuildGetDefinition),
    ("build.set.definition", Subject::BuildSetDefinition),
    ("build.get.validation", Subject::BuildGetValidation),
    ("build.set.validation", Subject::BuildSetValidation),
    ("build.set.status", Subject::BuildSetStatus),
];

impl Subject {
    /// Resolve a subject string. Fixed subjects win over the
    /// `build.<type>.done|error` completion patterns.
    pub fn parse(subject: &str) -> Option<Subject> {
        if let Some((_, route)) = ROUTES.iter().find(|(name, _)| *name == subject) {
            return Some(route.clone());
        }
        let rest = subject.strip_prefix("build.")?;
        let (build_type, event) = rest.split_once('.')?;
        if build_type.is_empty() {
            return None;
        }
        match event {
            "done" => Some(Subject::BuildDone(build_type.to_owned())),
            "error" => Some(Subject::BuildError(build_type.to_owned())),
            _ => None,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::BuildDone(t) => write!(f, "build.{t}.done"),
            Subject::BuildError(t) => write!(f, "build.{t}.error"),
            fixed => {
                let name = ROUTES
                    .iter()
                    .find(|(_, route)| route == fixed)
                    .map_or("?", |(name, _)| *name);
                f.write_str(name)
            }
        }
    }
}

/// Reply to one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Body(Value),
    /// Sent as-is, not JSON-encoded.
    Text(String),
    /// `{"status":"success"}`
    Success,
    /// `{"status":"ok"}`
    Ok,
    Error { reason: String, kind: ErrorKind },
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    kind: ErrorKind,
}

impl Reply {
    pub fn error(e: &CoreError) -> Self {
        Reply::Error {
            reason: e.to_string(),
            kind: e.kind(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Reply::Body(value) => value.clone(),
            Reply::Text(text) => Value::String(text.clone()),
            Reply::Success => json!({"status": "success"}),
            Reply::Ok => json!({"status": "ok"}),
            Reply::Error { reason, kind } => json!({"error": reason, "kind": kind}),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Reply::Text(text) => text.into_bytes(),
            Reply::Error { reason, kind } => encode(&ErrorBody {
                error: &reason,
                kind,
            }),
            other => encode(&other.to_value()),
        }
    }
}

/// Sent when a reply cannot be encoded.
const ENCODE_FAILED: &[u8] = br#"{"error":"could not encode reply","kind":"unexpected"}"#;

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|e| {
        error!("failed to encode reply: {e}");
        ENCODE_FAILED.to_vec()
    })
}

// ── Payloads ──

#[derive(Debug, Default, Deserialize)]
struct EnvRef {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    name: Option<String>,
}

impl EnvRef {
    fn key(self) -> Result<EnvKey, CoreError> {
        match (self.id, self.name) {
            (Some(id), _) if id != 0 => Ok(EnvKey::Id(id)),
            (_, Some(name)) if !name.is_empty() => Ok(EnvKey::Name(name.into())),
            _ => Err(CoreError::BadRequest(
                "an environment id or name must be provided".to_owned(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BuildRef {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct FindEnvironments {
    #[serde(default)]
    ids: Vec<i64>,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    project_id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetEnvironment {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    project_id: Option<i64>,
    #[serde(default, rename = "type")]
    provider: Option<String>,
    #[serde(default)]
    options: Option<Value>,
    #[serde(default)]
    credentials: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SetAction {
    #[serde(flatten)]
    environment: EnvRef,
    action: String,
}

#[derive(Debug, Deserialize)]
struct CreateBuild {
    #[serde(default)]
    environment_id: Option<i64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(alias = "type")]
    action: String,
    #[serde(default)]
    user_id: i64,
    #[serde(default)]
    user_name: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    definition: String,
    #[serde(default)]
    mapping: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct FindBuilds {
    #[serde(default)]
    environment_id: Option<i64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetBuild {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    definition: Option<String>,
    #[serde(default)]
    mapping: Option<Value>,
    #[serde(default)]
    validation: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SetMapping {
    #[serde(default)]
    id: String,
    mapping: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SetDefinition {
    #[serde(default)]
    id: String,
    definition: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetValidation {
    #[serde(default)]
    id: String,
    validation: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SetStatus {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    status: String,
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CoreError> {
    let payload = if payload.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        payload
    };
    serde_json::from_slice(payload).map_err(|e| CoreError::BadRequest(format!("invalid payload: {e}")))
}

fn build_id(id: String) -> Result<BuildId, CoreError> {
    if id.is_empty() {
        return Err(CoreError::BadRequest("a build id must be provided".to_owned()));
    }
    Ok(BuildId::from(id))
}

fn status(value: Option<String>) -> Result<Option<EnvStatus>, CoreError> {
    Ok(value.map(|s| s.parse::<EnvStatus>()).transpose()?)
}

fn body<T: Serialize>(value: &T) -> Result<Reply, CoreError> {
    let value = serde_json::to_value(value).map_err(StoreError::from)?;
    Ok(Reply::Body(value))
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, CoreError> {
    value.ok_or_else(|| CoreError::BadRequest(format!("missing '{field}'")))
}

fn string_field(payload: &Map<String, Value>, field: &str) -> Result<String, CoreError> {
    match payload.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(CoreError::BadRequest(format!(
            "a valid {field} must be provided"
        ))),
    }
}

// ── Dispatch ──

/// Handle one request for `subject`.
pub async fn dispatch<S: Store>(engine: &Engine<S>, subject: &Subject, payload: &[u8]) -> Reply {
    debug!("{subject}: {} byte payload", payload.len());
    let result = match subject {
        Subject::EnvironmentGet
        | Subject::EnvironmentFind
        | Subject::EnvironmentSet
        | Subject::EnvironmentDel
        | Subject::EnvironmentSetAction
        | Subject::EnvironmentSetSchedule
        | Subject::EnvironmentDelSchedule => environment(engine, subject, payload).await,
        Subject::BuildDone(build_type) => {
            complete(engine, build_type, Completion::Done, payload).await
        }
        Subject::BuildError(build_type) => {
            complete(engine, build_type, Completion::Errored, payload).await
        }
        _ => build(engine, subject, payload).await,
    };
    match result {
        Ok(reply) => reply,
        Err(e) => {
            match e.kind() {
                ErrorKind::Unexpected => error!("{subject}: {e}"),
                kind => debug!("{subject}: {kind}: {e}"),
            }
            Reply::error(&e)
        }
    }
}

async fn environment<S: Store>(
    engine: &Engine<S>,
    subject: &Subject,
    payload: &[u8],
) -> Result<Reply, CoreError> {
    match subject {
        Subject::EnvironmentGet => {
            let key = decode::<EnvRef>(payload)?.key()?;
            body(&engine.get_environment(&key).await?)
        }
        Subject::EnvironmentFind => {
            let query: FindEnvironments = decode(payload)?;
            let mut names = query.names;
            names.extend(query.name);
            let filter = EnvironmentFilter {
                ids: query.ids,
                names,
                project_id: query.project_id,
                status: status(query.status)?,
            };
            body(&engine.find_environments(&filter).await?)
        }
        Subject::EnvironmentSet => {
            let request: SetEnvironment = decode(payload)?;
            let env = match request.id {
                Some(id) if id != 0 => {
                    engine
                        .update_environment(&EnvKey::Id(id), request.options, request.credentials)
                        .await?
                }
                _ => {
                    let mut env = NewEnvironment::named(required(request.name, "name")?);
                    env.project_id = request.project_id.unwrap_or_default();
                    env.provider = request.provider.unwrap_or_default();
                    if let Some(options) = request.options {
                        env.options = options;
                    }
                    if let Some(credentials) = request.credentials {
                        env.credentials = credentials;
                    }
                    engine.create_environment(env).await?
                }
            };
            body(&env)
        }
        Subject::EnvironmentDel => {
            let key = decode::<EnvRef>(payload)?.key()?;
            engine.delete_environment(&key).await?;
            Ok(Reply::Success)
        }
        Subject::EnvironmentSetAction => {
            let request: SetAction = decode(payload)?;
            let action: Action = request.action.parse()?;
            engine
                .apply_action(&request.environment.key()?, action)
                .await?;
            Ok(Reply::Success)
        }
        Subject::EnvironmentSetSchedule => {
            let schedule: Map<String, Value> = decode(payload)?;
            let id = string_field(&schedule, "id")?;
            let key = EnvKey::Name(string_field(&schedule, "name")?.into());
            engine
                .set_schedule(&key, &id, Value::Object(schedule))
                .await?;
            Ok(Reply::Success)
        }
        Subject::EnvironmentDelSchedule => {
            let request: Map<String, Value> = decode(payload)?;
            let id = string_field(&request, "id")?;
            let key = EnvKey::Name(string_field(&request, "name")?.into());
            engine.delete_schedule(&key, &id).await?;
            Ok(Reply::Success)
        }
        other => Err(CoreError::BadRequest(format!(
            "{other} is not an environment subject"
        ))),
    }
}

async fn build<S: Store>(
    engine: &Engine<S>,
    subject: &Subject,
    payload: &[u8],
) -> Result<Reply, CoreError> {
    match subject {
        Subject::BuildCreate => {
            let request: CreateBuild = decode(payload)?;
            let environment = EnvRef {
                id: request.environment_id,
                name: request.name,
            }
            .key()?;
            let mut build = BuildRequest::new(environment, request.action.parse()?);
            build.uuid = request.id.filter(|id| !id.is_empty()).map(BuildId::from);
            build.user_id = request.user_id;
            build.username = request.user_name;
            build.definition = request.definition;
            build.mapping = request.mapping;
            body(&engine.create_build(build).await?)
        }
        Subject::BuildGet => {
            let uuid = build_id(decode::<BuildRef>(payload)?.id)?;
            body(&engine.get_build(&uuid).await?)
        }
        Subject::BuildFind => {
            let query: FindBuilds = decode(payload)?;
            let environment = match (query.environment_id, query.name) {
                (Some(id), _) => Some(EnvKey::Id(id)),
                (None, Some(name)) if !name.is_empty() => Some(EnvKey::Name(name.into())),
                _ => None,
            };
            let query = BuildQuery {
                environment,
                user_id: query.user_id,
                status: status(query.status)?,
            };
            let mut builds = engine.find_builds(&query).await?;
            // Listings leave out the heavy fields; build.get returns them.
            for build in &mut builds {
                build.mapping = Value::Null;
                build.definition.clear();
            }
            body(&builds)
        }
        Subject::BuildSet => {
            let request: SetBuild = decode(payload)?;
            let uuid = build_id(request.id)?;
            let update = BuildUpdate {
                status: status(request.status)?,
                definition: request.definition,
                mapping: request.mapping,
                validation: request.validation,
            };
            body(&engine.update_build(&uuid, update).await?)
        }
        Subject::BuildDel => {
            let uuid = build_id(decode::<BuildRef>(payload)?.id)?;
            engine.delete_build(&uuid).await?;
            Ok(Reply::Success)
        }
        Subject::BuildGetMapping => {
            let uuid = build_id(decode::<BuildRef>(payload)?.id)?;
            Ok(Reply::Body(engine.get_mapping(&uuid).await?.to_value()?))
        }
        Subject::BuildSetMapping => {
            let request: SetMapping = decode(payload)?;
            let uuid = build_id(request.id)?;
            engine
                .set_mapping(&uuid, required(request.mapping, "mapping")?)
                .await?;
            Ok(Reply::Success)
        }
        Subject::BuildSetComponent
        | Subject::BuildDelComponent
        | Subject::BuildSetChange
        | Subject::BuildDelChange => {
            let entry: Map<String, Value> = decode(payload)?;
            let uuid = owning_build(&entry)?;
            let entry = Entry::from_object(entry)?;
            let op = match subject {
                Subject::BuildSetComponent => MappingOp::SetComponent(entry),
                Subject::BuildDelComponent => MappingOp::DeleteComponent(entry.id),
                Subject::BuildSetChange => MappingOp::SetChange(entry),
                _ => MappingOp::DeleteChange(entry.id),
            };
            engine.mutate_mapping(&uuid, op).await?;
            Ok(Reply::Success)
        }
        Subject::BuildGetDefinition => {
            let uuid = build_id(decode::<BuildRef>(payload)?.id)?;
            Ok(Reply::Text(engine.get_definition(&uuid).await?))
        }
        Subject::BuildSetDefinition => {
            let request: SetDefinition = decode(payload)?;
            let uuid = build_id(request.id)?;
            engine
                .set_definition(&uuid, required(request.definition, "definition")?)
                .await?;
            Ok(Reply::Success)
        }
        Subject::BuildGetValidation => {
            let uuid = build_id(decode::<BuildRef>(payload)?.id)?;
            let validation = engine.get_validation(&uuid).await?;
            Ok(Reply::Body(validation.unwrap_or(Value::Null)))
        }
        Subject::BuildSetValidation => {
            let request: SetValidation = decode(payload)?;
            let uuid = build_id(request.id)?;
            engine
                .set_validation(&uuid, required(request.validation, "validation")?)
                .await?;
            Ok(Reply::Success)
        }
        Subject::BuildSetStatus => {
            let request: SetStatus = decode(payload)?;
            let status: EnvStatus = request.status.parse()?;
            let target = if !request.id.is_empty() {
                BuildTarget::Id(BuildId::from(request.id))
            } else if !request.name.is_empty() {
                BuildTarget::LatestOf(EnvKey::Name(request.name.into()))
            } else {
                return Err(CoreError::NotFound("not found".to_owned()));
            };
            engine.set_build_status(&target, status).await?;
            Ok(Reply::Ok)
        }
        other => Err(CoreError::BadRequest(format!("{other} is not a build subject"))),
    }
}

async fn complete<S: Store>(
    engine: &Engine<S>,
    build_type: &str,
    outcome: Completion,
    payload: &[u8],
) -> Result<Reply, CoreError> {
    let uuid = build_id(decode::<BuildRef>(payload)?.id)?;
    if let Err(e) = engine.complete_build(&uuid, build_type, outcome).await {
        warn!("could not record {build_type} completion of build {uuid}: {e}");
        return Err(e);
    }
    Ok(Reply::Ok)
}
