//! Row-locked edits of a build's mapping.
//!
//! Each edit locks the owning build row, parses the stored mapping, applies
//! exactly one operation and writes the result back before committing. A
//! second edit of the same build waits on the row lock and then works on the
//! committed result of the first, so concurrent edits never overwrite each
//! other.

use crate::engine::finish;
use crate::CoreError;
use envstore_schema::{BuildId, Entry, Mapping, MappingError, Upsert};
use envstore_store::{BuildUpdate, Store, Transaction};
use serde_json::{Map, Value};
use tracing::debug;

/// Payload field naming the build whose mapping an entry belongs to.
pub const SERVICE_FIELD: &str = "service";

/// One mapping edit.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingOp {
    SetComponent(Entry),
    DeleteComponent(String),
    SetChange(Entry),
    DeleteChange(String),
    /// Replace the whole document.
    Replace(Mapping),
}

impl MappingOp {
    pub fn name(&self) -> &'static str {
        match self {
            MappingOp::SetComponent(_) => "set component",
            MappingOp::DeleteComponent(_) => "delete component",
            MappingOp::SetChange(_) => "set change",
            MappingOp::DeleteChange(_) => "delete change",
            MappingOp::Replace(_) => "replace mapping",
        }
    }

    /// Apply to `mapping`. On error `mapping` is unchanged.
    pub fn apply(self, mapping: &mut Mapping) -> Result<Option<Upsert>, MappingError> {
        match self {
            MappingOp::SetComponent(entry) => mapping.set_component(entry).map(Some),
            MappingOp::SetChange(entry) => mapping.set_change(entry).map(Some),
            MappingOp::DeleteComponent(id) => mapping.delete_component(&id).map(|_| None),
            MappingOp::DeleteChange(id) => mapping.delete_change(&id).map(|_| None),
            MappingOp::Replace(replacement) => {
                *mapping = replacement;
                Ok(None)
            }
        }
    }
}

/// The build a mutation payload targets, taken from its `service` field.
pub fn owning_build(payload: &Map<String, Value>) -> Result<BuildId, CoreError> {
    match payload.get(SERVICE_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => Ok(BuildId::new(id.as_str())),
        Some(_) => Err(CoreError::BadRequest(format!(
            "'{SERVICE_FIELD}' must be a non-empty string"
        ))),
        None => Err(CoreError::BadRequest(format!(
            "missing build reference '{SERVICE_FIELD}'"
        ))),
    }
}

/// Apply `op` to the mapping of `build` under its row lock and return the
/// committed mapping.
pub async fn mutate_mapping<S: Store>(
    store: &S,
    build: &BuildId,
    op: MappingOp,
) -> Result<Mapping, CoreError> {
    let mut tx = store.begin().await?;
    let result = apply_locked(&mut tx, build, op).await;
    finish(tx, result).await
}

async fn apply_locked<T: Transaction>(
    tx: &mut T,
    build: &BuildId,
    op: MappingOp,
) -> Result<Mapping, CoreError> {
    let row = tx.lock_build(build).await?;
    let mut mapping = Mapping::from_value(row.mapping)?;
    let name = op.name();
    let upsert = op.apply(&mut mapping)?;
    tx.update_build(row.id, &BuildUpdate::mapping(mapping.to_value()?))
        .await?;
    debug!("{name} on build {build}: {upsert:?}");
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn owning_build_reads_service() {
        let p = payload(json!({"_component_id": "a", "service": "b-1"}));
        assert_eq!(owning_build(&p).unwrap(), BuildId::new("b-1"));
    }

    #[test]
    fn owning_build_requires_a_string() {
        let missing = payload(json!({"_component_id": "a"}));
        assert!(matches!(owning_build(&missing), Err(CoreError::BadRequest(_))));
        let numeric = payload(json!({"service": 12}));
        assert!(matches!(owning_build(&numeric), Err(CoreError::BadRequest(_))));
        let empty = payload(json!({"service": ""}));
        assert!(owning_build(&empty).is_err());
    }

    #[test]
    fn apply_reports_upsert_outcome() {
        let mut mapping = Mapping::new();
        let op = MappingOp::SetComponent(Entry::new("a", Some("running")));
        assert_eq!(op.apply(&mut mapping).unwrap(), Some(Upsert::Inserted));
        let op = MappingOp::SetComponent(Entry::new("a", Some("completed")));
        assert_eq!(op.apply(&mut mapping).unwrap(), Some(Upsert::Replaced));
        assert_eq!(mapping.components.len(), 1);
    }

    #[test]
    fn failed_delete_leaves_mapping_alone() {
        let mut mapping = Mapping::new();
        mapping.set_change(Entry::new("a", None)).unwrap();
        let before = mapping.clone();
        let err = MappingOp::DeleteChange("b".to_owned())
            .apply(&mut mapping)
            .unwrap_err();
        assert!(matches!(err, MappingError::NotFound { .. }));
        assert_eq!(mapping, before);
    }

    #[test]
    fn replace_swaps_the_document() {
        let mut mapping = Mapping::new();
        mapping.set_component(Entry::new("a", None)).unwrap();
        let replacement = Mapping::from_value(json!({"id": "b-1", "components": []})).unwrap();
        MappingOp::Replace(replacement.clone())
            .apply(&mut mapping)
            .unwrap();
        assert_eq!(mapping, replacement);
    }
}
