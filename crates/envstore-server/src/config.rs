//! Server configuration.
//!
//! Settings come from an optional TOML file; command-line flags (and their
//! `ENVSTORE_*` environment fallbacks) override individual fields.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const MEMORY_URL: &str = "memory";
const ISOLATION_LEVELS: [&str; 2] = ["serializable", "read_committed"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// Address the HTTP bridge binds to.
    pub listen: String,
    /// `memory` or a `postgres://` URL.
    pub database_url: String,
    pub max_connections: u32,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Postgres transaction isolation: `serializable` or `read_committed`.
    pub isolation: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8321".to_owned(),
            database_url: MEMORY_URL.to_owned(),
            max_connections: 10,
            log_level: "info".to_owned(),
            isolation: "serializable".to_owned(),
        }
    }
}

/// Storage backend selected by `database_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Postgres(String),
}

/// Per-field overrides from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub listen: Option<String>,
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    pub log_level: Option<String>,
    pub isolation: Option<String>,
}

impl ServerConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Defaults, or the file at `path` when one is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(url) = overrides.database_url {
            self.database_url = url;
        }
        if let Some(max) = overrides.max_connections {
            self.max_connections = max;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if let Some(isolation) = overrides.isolation {
            self.isolation = isolation;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("listen must not be empty".to_owned()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_owned(),
            ));
        }
        if !ISOLATION_LEVELS.contains(&self.isolation.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "isolation must be one of {ISOLATION_LEVELS:?}, got '{}'",
                self.isolation
            )));
        }
        self.backend().map(|_| ())
    }

    pub fn backend(&self) -> Result<Backend, ConfigError> {
        let url = self.database_url.as_str();
        if url == MEMORY_URL {
            Ok(Backend::Memory)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Backend::Postgres(url.to_owned()))
        } else {
            Err(ConfigError::Invalid(format!(
                "database_url must be '{MEMORY_URL}' or a postgres:// URL"
            )))
        }
    }
}
