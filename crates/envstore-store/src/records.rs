use crate::StoreError;
use chrono::{DateTime, Utc};
use envstore_schema::{BuildId, EnvName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    Initializing,
    InProgress,
    Done,
    Errored,
    Syncing,
    AwaitingApproval,
    AwaitingResolution,
}

impl EnvStatus {
    pub const ALL: [EnvStatus; 7] = [
        EnvStatus::Initializing,
        EnvStatus::InProgress,
        EnvStatus::Done,
        EnvStatus::Errored,
        EnvStatus::Syncing,
        EnvStatus::AwaitingApproval,
        EnvStatus::AwaitingResolution,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnvStatus::Initializing => "initializing",
            EnvStatus::InProgress => "in_progress",
            EnvStatus::Done => "done",
            EnvStatus::Errored => "errored",
            EnvStatus::Syncing => "syncing",
            EnvStatus::AwaitingApproval => "awaiting_approval",
            EnvStatus::AwaitingResolution => "awaiting_resolution",
        }
    }
}

impl fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::InvalidStatus(s.to_owned()))
    }
}

/// How a request addresses an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvKey {
    Id(i64),
    Name(EnvName),
}

impl fmt::Display for EnvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvKey::Id(id) => write!(f, "{id}"),
            EnvKey::Name(name) => write!(f, "{name}"),
        }
    }
}

impl From<i64> for EnvKey {
    fn from(id: i64) -> Self {
        EnvKey::Id(id)
    }
}

impl From<&str> for EnvKey {
    fn from(name: &str) -> Self {
        EnvKey::Name(EnvName::from(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub id: i64,
    pub name: EnvName,
    #[serde(default)]
    pub project_id: i64,
    #[serde(default, rename = "type")]
    pub provider: String,
    pub status: EnvStatus,
    #[serde(default = "empty_object")]
    pub options: Value,
    #[serde(default = "empty_object")]
    pub credentials: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    pub fn matches(&self, key: &EnvKey) -> bool {
        match key {
            EnvKey::Id(id) => self.id == *id,
            EnvKey::Name(name) => self.name == *name,
        }
    }
}

/// A build of an environment. `id` is the storage row id; callers see the
/// correlation id `uuid` under the name `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Build {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub uuid: BuildId,
    pub environment_id: i64,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default, rename = "user_name")]
    pub username: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: EnvStatus,
    #[serde(default)]
    pub definition: String,
    #[serde(default = "empty_object")]
    pub mapping: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEnvironment {
    pub name: EnvName,
    pub project_id: i64,
    pub provider: String,
    pub options: Value,
    pub credentials: Value,
}

impl NewEnvironment {
    pub fn named(name: impl Into<EnvName>) -> Self {
        Self {
            name: name.into(),
            project_id: 0,
            provider: String::new(),
            options: empty_object(),
            credentials: empty_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBuild {
    pub uuid: BuildId,
    pub environment_id: i64,
    pub user_id: i64,
    pub username: String,
    pub kind: String,
    pub status: EnvStatus,
    pub definition: String,
    pub mapping: Value,
}

/// Fields of an environment that can change after creation. `None` leaves
/// the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentUpdate {
    pub status: Option<EnvStatus>,
    pub options: Option<Value>,
    pub credentials: Option<Value>,
}

impl EnvironmentUpdate {
    pub fn status(status: EnvStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(&self, env: &mut Environment, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            env.status = status;
        }
        if let Some(ref options) = self.options {
            env.options = options.clone();
        }
        if let Some(ref credentials) = self.credentials {
            env.credentials = credentials.clone();
        }
        env.updated_at = now;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildUpdate {
    pub status: Option<EnvStatus>,
    pub definition: Option<String>,
    pub mapping: Option<Value>,
    pub validation: Option<Value>,
}

impl BuildUpdate {
    pub fn status(status: EnvStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn mapping(mapping: Value) -> Self {
        Self {
            mapping: Some(mapping),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.definition.is_none()
            && self.mapping.is_none()
            && self.validation.is_none()
    }

    pub fn apply(&self, build: &mut Build, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            build.status = status;
        }
        if let Some(ref definition) = self.definition {
            build.definition.clone_from(definition);
        }
        if let Some(ref mapping) = self.mapping {
            build.mapping = mapping.clone();
        }
        if let Some(ref validation) = self.validation {
            build.validation = Some(validation.clone());
        }
        build.updated_at = now;
    }
}

/// Environment search criteria; empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentFilter {
    pub ids: Vec<i64>,
    pub names: Vec<String>,
    pub project_id: Option<i64>,
    pub status: Option<EnvStatus>,
}

impl EnvironmentFilter {
    pub fn matches(&self, env: &Environment) -> bool {
        (self.ids.is_empty() || self.ids.contains(&env.id))
            && (self.names.is_empty() || self.names.iter().any(|n| env.name == *n))
            && self.project_id.is_none_or(|p| env.project_id == p)
            && self.status.is_none_or(|s| env.status == s)
    }
}

/// Build search criteria; empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildFilter {
    pub environment_id: Option<i64>,
    pub user_id: Option<i64>,
    pub status: Option<EnvStatus>,
}

impl BuildFilter {
    pub fn matches(&self, build: &Build) -> bool {
        self.environment_id.is_none_or(|e| build.environment_id == e)
            && self.user_id.is_none_or(|u| build.user_id == u)
            && self.status.is_none_or(|s| build.status == s)
    }
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_build() -> Build {
        let now = Utc::now();
        Build {
            id: 7,
            uuid: BuildId::new("b-1"),
            environment_id: 1,
            user_id: 3,
            username: "alice".to_owned(),
            kind: "apply".to_owned(),
            status: EnvStatus::InProgress,
            definition: "name: env-1".to_owned(),
            mapping: json!({"components": []}),
            validation: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_display_and_parse() {
        for status in EnvStatus::ALL {
            assert_eq!(status.to_string().parse::<EnvStatus>().unwrap(), status);
        }
        assert_eq!(EnvStatus::AwaitingApproval.to_string(), "awaiting_approval");
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "paused".parse::<EnvStatus>().unwrap_err();
        assert!(matches!(err, StoreError::InvalidStatus(ref s) if s == "paused"));
    }

    #[test]
    fn status_serde_matches_display() {
        let json = serde_json::to_string(&EnvStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn build_wire_shape_hides_row_id() {
        let value = serde_json::to_value(sample_build()).unwrap();
        assert_eq!(value["id"], json!("b-1"));
        assert_eq!(value["type"], json!("apply"));
        assert_eq!(value["user_name"], json!("alice"));
        assert_eq!(value["status"], json!("in_progress"));
        assert!(value.get("validation").is_none());
        assert!(value.get("uuid").is_none());
    }

    #[test]
    fn build_update_touches_only_given_fields() {
        let mut build = sample_build();
        let update = BuildUpdate {
            definition: Some("name: env-2".to_owned()),
            ..BuildUpdate::default()
        };
        update.apply(&mut build, Utc::now());
        assert_eq!(build.definition, "name: env-2");
        assert_eq!(build.status, EnvStatus::InProgress);
        assert_eq!(build.mapping, json!({"components": []}));
        assert!(BuildUpdate::default().is_empty());
        assert!(!update.is_empty());
    }

    #[test]
    fn filters_match_on_all_given_fields() {
        let build = sample_build();
        assert!(BuildFilter::default().matches(&build));
        let filter = BuildFilter {
            environment_id: Some(1),
            status: Some(EnvStatus::InProgress),
            ..BuildFilter::default()
        };
        assert!(filter.matches(&build));
        let filter = BuildFilter {
            user_id: Some(4),
            ..BuildFilter::default()
        };
        assert!(!filter.matches(&build));
    }

    #[test]
    fn env_key_display() {
        assert_eq!(EnvKey::from(42).to_string(), "42");
        assert_eq!(EnvKey::from("env-1").to_string(), "env-1");
    }
}
