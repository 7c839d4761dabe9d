//! Engine behaviour over the in-memory store: the build gate, state machine
//! side effects, mapping edits and the record operations around them.

use envstore_core::{
    Action, BuildQuery, BuildRequest, BuildTarget, Completion, CoreError, Engine, ErrorKind,
    MappingOp,
};
use envstore_schema::{BuildId, Entry};
use envstore_store::{
    BuildUpdate, EnvKey, EnvStatus, EnvironmentFilter, EnvironmentUpdate, MemoryStore,
    NewEnvironment, Store, Transaction,
};
use serde_json::json;

async fn engine_with_env(name: &str) -> (Engine<MemoryStore>, i64) {
    let engine = Engine::new(MemoryStore::new());
    let env = engine
        .create_environment(NewEnvironment::named(name))
        .await
        .unwrap();
    (engine, env.id)
}

async fn env_status(engine: &Engine<MemoryStore>, id: i64) -> EnvStatus {
    engine.get_environment(&EnvKey::Id(id)).await.unwrap().status
}

/// Move an environment into `status` behind the state machine's back.
async fn force_status(engine: &Engine<MemoryStore>, id: i64, status: EnvStatus) {
    let mut tx = engine.store().begin().await.unwrap();
    tx.lock_environment(&EnvKey::Id(id)).await.unwrap();
    tx.update_environment(id, &EnvironmentUpdate::status(status))
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

// --- Build gate ---

#[tokio::test]
async fn apply_on_new_environment_creates_in_progress_build() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let mut request = BuildRequest::new("env-1", Action::Apply);
    request.user_id = 7;
    request.username = "alice".to_owned();
    request.definition = "name: env-1".to_owned();

    let build = engine.create_build(request).await.unwrap();
    assert_eq!(build.status, EnvStatus::InProgress);
    assert_eq!(build.kind, "apply");
    assert_eq!(build.environment_id, env_id);
    assert_eq!(build.username, "alice");
    assert!(!build.uuid.is_empty());
    assert_eq!(build.mapping, json!({"components": [], "changes": []}));
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::InProgress);
}

#[tokio::test]
async fn apply_while_in_progress_is_a_conflict_without_writes() {
    let (engine, env_id) = engine_with_env("env-1").await;
    engine
        .create_build(BuildRequest::new("env-1", Action::Apply))
        .await
        .unwrap();

    let err = engine
        .create_build(BuildRequest::new("env-1", Action::Apply))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(
        err.to_string(),
        "could not create environment build: build in progress"
    );
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::InProgress);
    let builds = engine.find_builds(&BuildQuery::default()).await.unwrap();
    assert_eq!(builds.len(), 1);
}

#[tokio::test]
async fn syncing_environment_rejects_builds() {
    let (engine, env_id) = engine_with_env("env-1").await;
    engine
        .create_build(BuildRequest::new("env-1", Action::Sync))
        .await
        .unwrap();
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::Syncing);

    let err = engine
        .create_build(BuildRequest::new(env_id, Action::Destroy))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "could not create environment build: environment is syncing"
    );
}

#[tokio::test]
async fn caller_supplied_uuid_is_kept_and_must_be_unique() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let mut request = BuildRequest::new("env-1", Action::Apply);
    request.uuid = Some(BuildId::new("b-1"));
    let build = engine.create_build(request).await.unwrap();
    assert_eq!(build.uuid, BuildId::new("b-1"));

    force_status(&engine, env_id, EnvStatus::Done).await;
    let mut again = BuildRequest::new("env-1", Action::Apply);
    again.uuid = Some(BuildId::new("b-1"));
    let err = engine.create_build(again).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.to_string().contains("already exists"));
    // Rolled back: the environment did not move.
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::Done);
}

#[tokio::test]
async fn build_for_unknown_environment_is_not_found() {
    let engine = Engine::new(MemoryStore::new());
    let err = engine
        .create_build(BuildRequest::new("missing", Action::Apply))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn invalid_initial_mapping_is_a_bad_request() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let mut request = BuildRequest::new("env-1", Action::Apply);
    request.mapping = Some(json!(["not", "a", "mapping"]));
    let err = engine.create_build(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::Initializing);
}

// --- State machine side effects ---

#[tokio::test]
async fn submission_rejected_marks_latest_build_done() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let build = engine
        .create_build(BuildRequest::new("env-1", Action::Submission))
        .await
        .unwrap();
    assert_eq!(build.status, EnvStatus::AwaitingApproval);

    let status = engine
        .apply_action(&EnvKey::Id(env_id), Action::SubmissionRejected)
        .await
        .unwrap();
    assert_eq!(status, EnvStatus::Done);
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::Done);
    let build = engine.get_build(&build.uuid).await.unwrap();
    assert_eq!(build.status, EnvStatus::Done);
}

#[tokio::test]
async fn submission_accepted_moves_latest_build_to_in_progress() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let build = engine
        .create_build(BuildRequest::new("env-1", Action::Submission))
        .await
        .unwrap();

    engine
        .apply_action(&"env-1".into(), Action::SubmissionAccepted)
        .await
        .unwrap();
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::InProgress);
    let build = engine.get_build(&build.uuid).await.unwrap();
    assert_eq!(build.status, EnvStatus::InProgress);
}

#[tokio::test]
async fn sync_resolution_marks_latest_build_done() {
    for (action, expected) in [
        (Action::SyncAccepted, EnvStatus::Done),
        (Action::SyncIgnored, EnvStatus::Done),
        (Action::SyncRejected, EnvStatus::InProgress),
    ] {
        let (engine, env_id) = engine_with_env("env-1").await;
        let build = engine
            .create_build(BuildRequest::new("env-1", Action::Sync))
            .await
            .unwrap();
        force_status(&engine, env_id, EnvStatus::AwaitingResolution).await;

        let status = engine
            .apply_action(&EnvKey::Id(env_id), action)
            .await
            .unwrap();
        assert_eq!(status, expected, "{action}");
        let build = engine.get_build(&build.uuid).await.unwrap();
        assert_eq!(build.status, EnvStatus::Done, "{action}");
    }
}

#[tokio::test]
async fn rejected_action_changes_nothing() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let err = engine
        .apply_action(&EnvKey::Id(env_id), Action::SubmissionAccepted)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::Initializing);
}

// --- Mapping edits ---

#[tokio::test]
async fn component_and_change_edits() {
    let (engine, _) = engine_with_env("env-1").await;
    let build = engine
        .create_build(BuildRequest::new("env-1", Action::Apply))
        .await
        .unwrap();

    let entry = Entry::new("net-1", Some("running")).with_attribute("range", json!("10.0.0.0/24"));
    engine
        .mutate_mapping(&build.uuid, MappingOp::SetComponent(entry.clone()))
        .await
        .unwrap();
    engine
        .mutate_mapping(
            &build.uuid,
            MappingOp::SetChange(Entry::new("net-1", Some("waiting"))),
        )
        .await
        .unwrap();

    let mapping = engine.get_mapping(&build.uuid).await.unwrap();
    assert_eq!(mapping.get_component("net-1").unwrap(), &entry);
    assert_eq!(
        mapping.get_change("net-1").unwrap().state.as_deref(),
        Some("waiting")
    );

    engine
        .mutate_mapping(&build.uuid, MappingOp::DeleteChange("net-1".to_owned()))
        .await
        .unwrap();
    let mapping = engine.get_mapping(&build.uuid).await.unwrap();
    assert!(mapping.get_change("net-1").is_err());
    assert!(mapping.get_component("net-1").is_ok());
}

#[tokio::test]
async fn deleting_absent_component_is_not_found_and_keeps_mapping() {
    let (engine, _) = engine_with_env("env-1").await;
    let build = engine
        .create_build(BuildRequest::new("env-1", Action::Apply))
        .await
        .unwrap();
    engine
        .mutate_mapping(
            &build.uuid,
            MappingOp::SetComponent(Entry::new("a", Some("running"))),
        )
        .await
        .unwrap();
    let before = engine.get_build(&build.uuid).await.unwrap().mapping;

    let err = engine
        .mutate_mapping(&build.uuid, MappingOp::DeleteComponent("b".to_owned()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(engine.get_build(&build.uuid).await.unwrap().mapping, before);
}

#[tokio::test]
async fn edit_of_unknown_build_is_not_found() {
    let engine = Engine::new(MemoryStore::new());
    let err = engine
        .mutate_mapping(
            &BuildId::new("missing"),
            MappingOp::SetComponent(Entry::new("a", None)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn corrupt_stored_mapping_is_unexpected() {
    let (engine, _) = engine_with_env("env-1").await;
    let build = engine
        .create_build(BuildRequest::new("env-1", Action::Apply))
        .await
        .unwrap();
    let mut tx = engine.store().begin().await.unwrap();
    let row = tx.lock_build(&build.uuid).await.unwrap();
    tx.update_build(row.id, &BuildUpdate::mapping(json!("garbage")))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let err = engine
        .mutate_mapping(&build.uuid, MappingOp::SetComponent(Entry::new("a", None)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unexpected);
    assert_eq!(
        engine.get_build(&build.uuid).await.unwrap().mapping,
        json!("garbage")
    );
}

#[tokio::test]
async fn mapping_with_null_lists_and_unaddressed_items_is_editable() {
    let (engine, _) = engine_with_env("env-1").await;
    let mut request = BuildRequest::new("env-1", Action::Apply);
    request.mapping = Some(json!({
        "id": "env-1",
        "action": "apply",
        "components": [{"name": "legacy"}],
        "changes": null,
        "edges": null
    }));
    let build = engine.create_build(request).await.unwrap();

    engine
        .mutate_mapping(
            &build.uuid,
            MappingOp::SetComponent(Entry::new("net-1", Some("running"))),
        )
        .await
        .unwrap();
    engine
        .mutate_mapping(&build.uuid, MappingOp::SetChange(Entry::new("net-1", None)))
        .await
        .unwrap();

    let stored = engine.get_build(&build.uuid).await.unwrap().mapping;
    assert_eq!(
        stored["components"],
        json!([{"name": "legacy"}, {"_component_id": "net-1", "_state": "running"}])
    );
    assert_eq!(stored["changes"], json!([{"_component_id": "net-1"}]));
    assert_eq!(stored["edges"], serde_json::Value::Null);
}

#[tokio::test]
async fn whole_mapping_replacement_is_validated() {
    let (engine, _) = engine_with_env("env-1").await;
    let build = engine
        .create_build(BuildRequest::new("env-1", Action::Apply))
        .await
        .unwrap();

    let err = engine
        .set_mapping(&build.uuid, json!(42))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    engine
        .set_mapping(
            &build.uuid,
            json!({"id": "x", "components": [{"_component_id": "vpc", "_state": "running"}]}),
        )
        .await
        .unwrap();
    let mapping = engine.get_mapping(&build.uuid).await.unwrap();
    assert_eq!(mapping.extra["id"], json!("x"));
    assert!(mapping.get_component("vpc").is_ok());
}

// --- Build status and completion ---

#[tokio::test]
async fn set_build_status_by_name_targets_latest_build() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let first = engine
        .create_build(BuildRequest::new("env-1", Action::Apply))
        .await
        .unwrap();
    force_status(&engine, env_id, EnvStatus::Done).await;
    let second = engine
        .create_build(BuildRequest::new("env-1", Action::Apply))
        .await
        .unwrap();

    let updated = engine
        .set_build_status(&BuildTarget::LatestOf("env-1".into()), EnvStatus::Errored)
        .await
        .unwrap();
    assert_eq!(updated.uuid, second.uuid);
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::Errored);
    assert_eq!(
        engine.get_build(&first.uuid).await.unwrap().status,
        EnvStatus::InProgress
    );
}

#[tokio::test]
async fn set_build_status_without_builds_is_not_found() {
    let (engine, _) = engine_with_env("env-1").await;
    let err = engine
        .set_build_status(&BuildTarget::LatestOf("env-1".into()), EnvStatus::Done)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn completion_events_settle_build_and_environment() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let build = engine
        .create_build(BuildRequest::new("env-1", Action::Apply))
        .await
        .unwrap();

    engine
        .complete_build(&build.uuid, "apply", Completion::Errored)
        .await
        .unwrap();
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::Errored);

    engine
        .complete_build(&build.uuid, "apply", Completion::Done)
        .await
        .unwrap();
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::Done);
    assert_eq!(
        engine.get_build(&build.uuid).await.unwrap().status,
        EnvStatus::Done
    );
}

#[tokio::test]
async fn delete_completion_removes_environment() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let build = engine
        .create_build(BuildRequest::new("env-1", Action::Destroy))
        .await
        .unwrap();

    engine
        .complete_build(&build.uuid, "delete", Completion::Done)
        .await
        .unwrap();
    let err = engine.get_environment(&EnvKey::Id(env_id)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(
        engine.get_build(&build.uuid).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

// --- Records ---

#[tokio::test]
async fn environment_name_limit_counts_characters() {
    let engine = Engine::new(MemoryStore::new());
    let accented = "é".repeat(100);
    let env = engine
        .create_environment(NewEnvironment::named(accented.as_str()))
        .await
        .unwrap();
    assert_eq!(env.name, accented);

    let err = engine
        .create_environment(NewEnvironment::named("é".repeat(101).as_str()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn environment_records() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let err = engine
        .create_environment(NewEnvironment::named("env-1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = engine
        .create_environment(NewEnvironment::named(""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let env = engine
        .update_environment(
            &EnvKey::Id(env_id),
            Some(json!({"sync": true})),
            Some(json!({"token": "opaque"})),
        )
        .await
        .unwrap();
    assert_eq!(env.options, json!({"sync": true}));
    assert_eq!(env.credentials, json!({"token": "opaque"}));
    assert_eq!(env.status, EnvStatus::Initializing);

    let found = engine
        .find_environments(&EnvironmentFilter {
            names: vec!["env-1".to_owned()],
            ..EnvironmentFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn schedules_live_under_options() {
    let (engine, env_id) = engine_with_env("env-1").await;
    engine
        .update_environment(&EnvKey::Id(env_id), Some(json!({"sync": true})), None)
        .await
        .unwrap();

    let key = EnvKey::from("env-1");
    engine
        .set_schedule(&key, "nightly", json!({"id": "nightly", "interval": "24h"}))
        .await
        .unwrap();
    let env = engine.get_environment(&key).await.unwrap();
    assert_eq!(env.options["schedules"]["nightly"]["interval"], json!("24h"));
    assert_eq!(env.options["sync"], json!(true));

    engine.delete_schedule(&key, "nightly").await.unwrap();
    let env = engine.get_environment(&key).await.unwrap();
    assert_eq!(env.options["schedules"], json!({}));

    let err = engine
        .set_schedule(&key, "", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[tokio::test]
async fn build_records() {
    let (engine, env_id) = engine_with_env("env-1").await;
    let build = engine
        .create_build(BuildRequest::new("env-1", Action::Apply))
        .await
        .unwrap();

    engine
        .set_definition(&build.uuid, "name: env-1\nnetworks: []".to_owned())
        .await
        .unwrap();
    assert!(engine
        .get_definition(&build.uuid)
        .await
        .unwrap()
        .contains("networks"));

    assert_eq!(engine.get_validation(&build.uuid).await.unwrap(), None);
    engine
        .set_validation(&build.uuid, json!({"passed": true}))
        .await
        .unwrap();
    assert_eq!(
        engine.get_validation(&build.uuid).await.unwrap(),
        Some(json!({"passed": true}))
    );

    let found = engine
        .find_builds(&BuildQuery {
            environment: Some("env-1".into()),
            ..BuildQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let none = engine
        .find_builds(&BuildQuery {
            environment: Some("nope".into()),
            ..BuildQuery::default()
        })
        .await
        .unwrap();
    assert!(none.is_empty());

    engine.delete_build(&build.uuid).await.unwrap();
    assert!(engine.get_build(&build.uuid).await.is_err());
    assert_eq!(env_status(&engine, env_id).await, EnvStatus::InProgress);
}
