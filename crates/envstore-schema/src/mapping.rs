//! The mapping document attached to every build.
//!
//! A mapping holds two ordered lists: `components` (the provisioned graph) and
//! `changes` (entries pending application). Items with a string
//! `_component_id` are addressable entries; other objects are carried along
//! untouched and never match a lookup. A `null` list loads as empty. Any other
//! top-level field, and any attribute of an entry, is kept verbatim so
//! documents round-trip without losing data this crate does not know about.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Field carrying the id of an entry.
pub const COMPONENT_ID_FIELD: &str = "_component_id";
/// Field carrying the provisioning state of an entry.
pub const STATE_FIELD: &str = "_state";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("invalid mapping document: {0}")]
    Parse(String),
    #[error("could not find {list} '{id}'")]
    NotFound { list: MappingList, id: String },
    #[error("invalid mapping entry: {0}")]
    InvalidInput(String),
}

/// Which list of a mapping an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingList {
    Components,
    Changes,
}

impl fmt::Display for MappingList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingList::Components => write!(f, "component"),
            MappingList::Changes => write!(f, "change"),
        }
    }
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The id was new; the entry was appended.
    Inserted,
    /// The id existed; the entry replaced it at the same position.
    Replaced,
}

/// One addressable entry of a mapping list.
///
/// `attributes` holds `_state` only when it is not a string (an explicit
/// `null`, say), so that value survives a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct Entry {
    #[serde(rename = "_component_id")]
    pub id: String,
    #[serde(rename = "_state", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Entry {
    pub fn new(id: impl Into<String>, state: Option<&str>) -> Self {
        Self {
            id: id.into(),
            state: state.map(str::to_owned),
            attributes: Map::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_owned(), value);
        self
    }

    /// Build an entry from a raw request object.
    ///
    /// `_component_id` must be a non-empty string and `_state`, when present,
    /// a string. Every other field is kept as an attribute.
    pub fn from_object(mut object: Map<String, Value>) -> Result<Self, MappingError> {
        let id = match object.remove(COMPONENT_ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(_) => {
                return Err(MappingError::InvalidInput(format!(
                    "{COMPONENT_ID_FIELD} must be a non-empty string"
                )))
            }
            None => {
                return Err(MappingError::InvalidInput(format!(
                    "missing {COMPONENT_ID_FIELD}"
                )))
            }
        };
        match object.get(STATE_FIELD) {
            None | Some(Value::String(_) | Value::Null) => {}
            Some(_) => {
                return Err(MappingError::InvalidInput(format!(
                    "{STATE_FIELD} must be a string"
                )))
            }
        }
        Ok(Self::split(id, object))
    }

    fn split(id: String, mut object: Map<String, Value>) -> Self {
        let state = match object.remove(STATE_FIELD) {
            Some(Value::String(state)) => Some(state),
            Some(other) => {
                object.insert(STATE_FIELD.to_owned(), other);
                None
            }
            None => None,
        };
        Self {
            id,
            state,
            attributes: object,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.attributes.clone();
        object.insert(COMPONENT_ID_FIELD.to_owned(), Value::String(self.id.clone()));
        if let Some(ref state) = self.state {
            object.insert(STATE_FIELD.to_owned(), Value::String(state.clone()));
        }
        Value::Object(object)
    }
}

impl TryFrom<Map<String, Value>> for Entry {
    type Error = MappingError;

    fn try_from(mut object: Map<String, Value>) -> Result<Self, MappingError> {
        match object.remove(COMPONENT_ID_FIELD) {
            Some(Value::String(id)) => Ok(Self::split(id, object)),
            _ => Err(MappingError::InvalidInput(format!(
                "missing string {COMPONENT_ID_FIELD}"
            ))),
        }
    }
}

/// An item of a mapping list as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Item {
    Entry(Entry),
    /// An object without a string `_component_id`.
    Raw(Map<String, Value>),
}

impl Item {
    pub fn id(&self) -> Option<&str> {
        self.as_entry().map(|e| e.id.as_str())
    }

    pub fn as_entry(&self) -> Option<&Entry> {
        match self {
            Item::Entry(entry) => Some(entry),
            Item::Raw(_) => None,
        }
    }

    pub fn into_entry(self) -> Option<Entry> {
        match self {
            Item::Entry(entry) => Some(entry),
            Item::Raw(_) => None,
        }
    }
}

impl From<Entry> for Item {
    fn from(entry: Entry) -> Self {
        Item::Entry(entry)
    }
}

impl From<Map<String, Value>> for Item {
    fn from(mut object: Map<String, Value>) -> Self {
        match object.remove(COMPONENT_ID_FIELD) {
            Some(Value::String(id)) => Item::Entry(Entry::split(id, object)),
            Some(other) => {
                object.insert(COMPONENT_ID_FIELD.to_owned(), other);
                Item::Raw(object)
            }
            None => Item::Raw(object),
        }
    }
}

impl<'de> Deserialize<'de> for Item {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Map::deserialize(deserializer).map(Item::from)
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Item>, D::Error> {
    Option::<Vec<Item>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Graph mapping of a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub components: Vec<Item>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub changes: Vec<Item>,
    /// Top-level fields other than the two lists (`id`, `action`, `edges`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a serialized mapping document.
    pub fn load(data: &[u8]) -> Result<Self, MappingError> {
        let value: Value =
            serde_json::from_slice(data).map_err(|e| MappingError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Interpret an already-parsed JSON document as a mapping.
    pub fn from_value(value: Value) -> Result<Self, MappingError> {
        if !value.is_object() {
            return Err(MappingError::Parse(
                "mapping must be a JSON object".to_owned(),
            ));
        }
        serde_json::from_value(value).map_err(|e| MappingError::Parse(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MappingError> {
        serde_json::to_vec(self).map_err(|e| MappingError::Parse(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value, MappingError> {
        serde_json::to_value(self).map_err(|e| MappingError::Parse(e.to_string()))
    }

    pub fn items(&self, list: MappingList) -> &[Item] {
        match list {
            MappingList::Components => &self.components,
            MappingList::Changes => &self.changes,
        }
    }

    fn items_mut(&mut self, list: MappingList) -> &mut Vec<Item> {
        match list {
            MappingList::Components => &mut self.components,
            MappingList::Changes => &mut self.changes,
        }
    }

    /// Addressable entries of `list`, in order.
    pub fn entries(&self, list: MappingList) -> impl Iterator<Item = &Entry> {
        self.items(list).iter().filter_map(Item::as_entry)
    }

    /// Position of `id` in `list`. First match wins; raw items never match.
    pub fn index(&self, list: MappingList, id: &str) -> Option<usize> {
        self.items(list).iter().position(|item| item.id() == Some(id))
    }

    pub fn get(&self, list: MappingList, id: &str) -> Result<&Entry, MappingError> {
        self.entries(list)
            .find(|e| e.id == id)
            .ok_or_else(|| MappingError::NotFound {
                list,
                id: id.to_owned(),
            })
    }

    /// Replace the entry with the same id in place, or append it.
    pub fn set(&mut self, list: MappingList, entry: Entry) -> Result<Upsert, MappingError> {
        if entry.id.is_empty() {
            return Err(MappingError::InvalidInput(format!(
                "{COMPONENT_ID_FIELD} must be a non-empty string"
            )));
        }
        match self.index(list, &entry.id) {
            Some(i) => {
                self.items_mut(list)[i] = Item::Entry(entry);
                Ok(Upsert::Replaced)
            }
            None => {
                self.items_mut(list).push(Item::Entry(entry));
                Ok(Upsert::Inserted)
            }
        }
    }

    /// Remove the entry with `id`, keeping the order of the rest.
    pub fn delete(&mut self, list: MappingList, id: &str) -> Result<Entry, MappingError> {
        let not_found = || MappingError::NotFound {
            list,
            id: id.to_owned(),
        };
        let i = self.index(list, id).ok_or_else(not_found)?;
        self.items_mut(list).remove(i).into_entry().ok_or_else(not_found)
    }

    pub fn component_index(&self, id: &str) -> Option<usize> {
        self.index(MappingList::Components, id)
    }

    pub fn change_index(&self, id: &str) -> Option<usize> {
        self.index(MappingList::Changes, id)
    }

    pub fn get_component(&self, id: &str) -> Result<&Entry, MappingError> {
        self.get(MappingList::Components, id)
    }

    pub fn get_change(&self, id: &str) -> Result<&Entry, MappingError> {
        self.get(MappingList::Changes, id)
    }

    pub fn set_component(&mut self, entry: Entry) -> Result<Upsert, MappingError> {
        self.set(MappingList::Components, entry)
    }

    pub fn set_change(&mut self, entry: Entry) -> Result<Upsert, MappingError> {
        self.set(MappingList::Changes, entry)
    }

    pub fn delete_component(&mut self, id: &str) -> Result<Entry, MappingError> {
        self.delete(MappingList::Components, id)
    }

    pub fn delete_change(&mut self, id: &str) -> Result<Entry, MappingError> {
        self.delete(MappingList::Changes, id)
    }
}
