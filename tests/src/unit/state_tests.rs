use super::test_runtime;
use parking_lot::RwLock;
use planforge_core::config::{Channel, ConfigRegistry, ModelUpdate};
use planforge_core::llm::{LlmDriver, LlmProviderKind};
use planforge_core::project::{ProjectFile, ProjectStatus};
use planforge_core::settings::RuntimeSettings;
use planforge_core::state::{AppState, WorkspaceError, PROJECTS_STORAGE_KEY};
use planforge_core::store::{FileStore, KeyValueStore, MemoryStore};
use planforge_core::{CancellationToken, VersionError};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SCRIPT: [&str; 4] = [
    "**File: src/lib.rs**\n",
    "```rust\n",
    "pub fn answer() -> u32 { 42 }\n",
    "```\n",
];

#[test]
fn workspace_survives_restart_through_file_store() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let store: Arc<dyn KeyValueStore> =
        Arc::new(FileStore::new(temp_dir.path().join("data")).expect("store"));

    let project_id = {
        let state = AppState::with_store(Arc::clone(&store), LlmDriver::scripted(SCRIPT))
            .expect("state");
        let project = state.new_project();
        state.rename_project(project.id, "answers").expect("rename");
        runtime
            .block_on(state.run_generation(
                project.id,
                "write the answer",
                &CancellationToken::new(),
                &mut |_: &str| {},
            ))
            .expect("generation");
        state.commit(project.id, "first answer").expect("commit");
        project.id
    };

    assert!(store.get(PROJECTS_STORAGE_KEY).unwrap().is_some());

    let reopened = AppState::with_store(store, LlmDriver::fake()).expect("state");
    let project = reopened.project(project_id).expect("project");
    assert_eq!(project.name, "answers");
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.versions.len(), 1);
    assert_eq!(
        project.file("src/lib.rs").map(|file| file.content.as_str()),
        Some("pub fn answer() -> u32 { 42 }")
    );
    assert_eq!(reopened.active_project().map(|p| p.id), Some(project_id));
}

#[test]
fn commit_revert_and_delete_through_workspace() {
    let state = AppState::new(LlmDriver::fake());
    let project = state.new_project();

    let empty = state.commit(project.id, "empty").expect("commit");
    assert!(empty.files().is_empty());

    let runtime = test_runtime();
    let state = {
        let scripted = AppState::new(LlmDriver::scripted(SCRIPT));
        let project = scripted.new_project();
        let baseline = scripted.commit(project.id, "baseline").expect("commit");
        runtime
            .block_on(scripted.run_generation(
                project.id,
                "add lib",
                &CancellationToken::new(),
                &mut |_: &str| {},
            ))
            .expect("generation");
        let generated = scripted.commit(project.id, "generated").expect("commit");

        scripted.revert(project.id, baseline.id).expect("revert");
        let reverted = scripted.project(project.id).unwrap();
        assert!(reverted.files.is_empty());
        assert_eq!(reverted.active_version_id, Some(baseline.id));

        scripted.revert(project.id, generated.id).expect("revert");
        let restored = scripted.project(project.id).unwrap();
        assert!(restored.file("src/lib.rs").is_some());
        assert!(restored.file(".conversation_history").is_some());

        scripted
            .delete_version(project.id, generated.id)
            .expect("delete version");
        let after_delete = scripted.project(project.id).unwrap();
        assert_eq!(after_delete.versions.len(), 1);
        assert_eq!(after_delete.active_version_id, Some(generated.id));
        assert!(after_delete.active_version().is_none());
        assert!(after_delete.file("src/lib.rs").is_some());
        scripted
    };

    let project = state.projects()[0].clone();
    assert!(matches!(
        state.revert(project.id, uuid::Uuid::new_v4()),
        Err(WorkspaceError::Version(VersionError::NotFound(_)))
    ));
    assert!(matches!(
        state.commit(project.id, "   "),
        Err(WorkspaceError::Version(VersionError::EmptyMessage))
    ));
}

#[test]
fn second_generation_on_same_project_is_rejected() {
    let runtime = test_runtime();
    let chunks: Vec<String> = (0..200).map(|n| format!("line {n}\n")).collect();
    let state = AppState::new(LlmDriver::scripted(chunks));
    let project = state.new_project();
    let other = state.new_project();

    runtime.block_on(async {
        let cancel = CancellationToken::new();
        let running = {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                state
                    .run_generation(project.id, "long turn", &cancel, &mut |_: &str| {})
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(state.is_generating(project.id));
        assert_eq!(
            state.project(project.id).unwrap().status,
            ProjectStatus::Generating
        );

        let rejected = state
            .run_generation(project.id, "again", &CancellationToken::new(), &mut |_: &str| {})
            .await;
        assert!(matches!(
            rejected,
            Err(WorkspaceError::GenerationInProgress(id)) if id == project.id
        ));

        let other_cancel = CancellationToken::new();
        let trigger = other_cancel.clone();
        let other_turn = state
            .run_generation(other.id, "independent", &other_cancel, &mut |_: &str| {
                trigger.cancel()
            })
            .await
            .expect("other project is not blocked");
        assert!(other_turn.cancelled);
        assert!(state.is_generating(project.id));

        cancel.cancel();
        let report = running.await.expect("join").expect("generation");
        assert!(report.cancelled);
    });

    assert!(!state.is_generating(project.id));
    assert_eq!(
        state.project(project.id).unwrap().status,
        ProjectStatus::Active
    );
}

#[test]
fn gateway_failure_marks_project_error_and_logs_hint() {
    let runtime = test_runtime();
    let mut registry = ConfigRegistry::new();
    let (config_id, model_id) = {
        let config = registry.add_channel(Channel::OpenAi);
        (config.id.clone(), config.models[0].id.clone())
    };
    registry
        .update_model(
            &config_id,
            &model_id,
            ModelUpdate {
                model_id: Some("gpt-4o-mini".into()),
                ..ModelUpdate::default()
            },
        )
        .expect("update model");
    registry.set_primary(&config_id, &model_id).expect("primary");

    let driver = LlmDriver::from_settings(
        LlmProviderKind::Http,
        Arc::new(RwLock::new(registry)),
        &RuntimeSettings::default(),
    )
    .expect("driver");
    let state = AppState::new(driver);
    let project = state.new_project();

    let err = runtime
        .block_on(state.run_generation(
            project.id,
            "hello",
            &CancellationToken::new(),
            &mut |_: &str| {},
        ))
        .unwrap_err();
    match err {
        WorkspaceError::Gateway(gateway) => {
            assert_eq!(gateway.reason(), "configuration");
            assert_eq!(gateway.to_string(), "API Key missing");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let project = state.project(project.id).unwrap();
    assert_eq!(project.status, ProjectStatus::Error);
    assert!(project.files.is_empty());
    let messages: Vec<String> = state.logs().into_iter().map(|entry| entry.message).collect();
    assert!(messages.contains(&"Error: API Key missing".to_string()));
    assert!(messages
        .iter()
        .any(|message| message.starts_with("Try re-checking configuration")));

    let missing = runtime
        .block_on(state.run_generation(
            uuid::Uuid::new_v4(),
            "hello",
            &CancellationToken::new(),
            &mut |_: &str| {},
        ))
        .unwrap_err();
    assert!(matches!(missing, WorkspaceError::ProjectNotFound(_)));
}

#[test]
fn generated_files_replace_in_place_and_keep_unrelated() {
    let runtime = test_runtime();
    let store = Arc::new(MemoryStore::new());
    let state = AppState::with_store(store, LlmDriver::scripted(SCRIPT)).expect("state");
    let project = state.new_project();

    runtime
        .block_on(state.run_generation(
            project.id,
            "first",
            &CancellationToken::new(),
            &mut |_: &str| {},
        ))
        .expect("generation");
    runtime
        .block_on(state.run_generation(
            project.id,
            "second",
            &CancellationToken::new(),
            &mut |_: &str| {},
        ))
        .expect("generation");

    let project = state.project(project.id).unwrap();
    let names: Vec<&str> = project.files.iter().map(|file| file.name.as_str()).collect();
    assert_eq!(names, vec!["src/lib.rs", ".conversation_history"]);
    let history = project.file(".conversation_history").unwrap();
    assert_eq!(history.content.matches("USER: ").count(), 2);
    assert_eq!(
        project.file("src/lib.rs"),
        Some(&ProjectFile::new(
            "src/lib.rs",
            "rust",
            "pub fn answer() -> u32 { 42 }"
        ))
    );
}
