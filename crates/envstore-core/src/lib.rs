//! Core engine for the envstore environment lifecycle.
//!
//! This crate ties the mapping model and the store together into the
//! `Engine`: the environment state machine and the build gate that consults
//! it, the row-locked mapping mutation protocol, and the record operations
//! the subject router exposes. Every status-changing operation runs inside
//! one store transaction that locks the environment row before any build row.

pub mod engine;
pub mod lifecycle;
pub mod mutation;

pub use engine::{BuildQuery, BuildRequest, BuildTarget, Completion, Engine};
pub use lifecycle::{next_status, Action, TRANSITIONS};
pub use mutation::{owning_build, MappingOp, SERVICE_FIELD};

use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] envstore_store::StoreError),
    #[error(transparent)]
    Mapping(#[from] envstore_schema::MappingError),
}

/// How a failure is reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Conflict,
    /// Storage or serialization failure; the transaction was rolled back.
    Unexpected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::BadRequest => write!(f, "bad_request"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Unexpected => write!(f, "unexpected"),
        }
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        use envstore_schema::MappingError;
        use envstore_store::StoreError;

        match self {
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::BadRequest(_) => ErrorKind::BadRequest,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Store(e) => match e {
                StoreError::EnvNotFound(_) | StoreError::BuildNotFound(_) => ErrorKind::NotFound,
                StoreError::NameConflict(_) | StoreError::DuplicateBuild(_) => ErrorKind::Conflict,
                StoreError::InvalidStatus(_) => ErrorKind::BadRequest,
                StoreError::LockFailed(_)
                | StoreError::Serialization(_)
                | StoreError::Backend(_) => ErrorKind::Unexpected,
            },
            CoreError::Mapping(e) => match e {
                MappingError::NotFound { .. } => ErrorKind::NotFound,
                MappingError::InvalidInput(_) => ErrorKind::BadRequest,
                // A stored mapping that no longer parses.
                MappingError::Parse(_) => ErrorKind::Unexpected,
            },
        }
    }
}
