//! Identifiers and the build mapping document model for envstore.
//!
//! This crate defines the schema layer shared by the store, the core and the
//! server: string newtypes for wire identifiers (`BuildId`, `EnvName`) and the
//! `Mapping` document (ordered `components` and `changes` lists of `Entry`
//! envelopes) that every build carries.

pub mod mapping;
pub mod types;

pub use mapping::{
    Entry, Item, Mapping, MappingError, MappingList, Upsert, COMPONENT_ID_FIELD, STATE_FIELD,
};
pub use types::{BuildId, EnvName};
