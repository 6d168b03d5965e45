use super::test_runtime;
use planforge::{Command, Shell};
use planforge_core::config::CONFIG_STORAGE_KEY;
use planforge_core::llm::LlmDriver;
use planforge_core::settings::RuntimeSettings;
use planforge_core::store::{KeyValueStore, MemoryStore};
use std::sync::Arc;
use tempfile::TempDir;

const HELLO: [&str; 2] = [
    "**File: src/hello.py**\n",
    "```python\nprint(\"hi\")\n```\n",
];

fn shell(store: Arc<MemoryStore>) -> Shell {
    Shell::with_driver(store, RuntimeSettings::default(), LlmDriver::scripted(HELLO))
        .expect("shell")
}

fn run(runtime: &tokio::runtime::Runtime, shell: &Shell, command: Command) -> String {
    let mut out = Vec::new();
    runtime
        .block_on(shell.run(command, &mut out))
        .expect("command");
    String::from_utf8(out).expect("utf8")
}

#[test]
fn generate_commit_and_download_round() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let shell = shell(Arc::new(MemoryStore::new()));

    run(&runtime, &shell, Command::New { name: Some("hello".into()) });

    let generated = run(
        &runtime,
        &shell,
        Command::Generate {
            project: "hello".into(),
            intent: vec!["build".into(), "hello".into()],
        },
    );
    assert!(generated.starts_with("**File: src/hello.py**"));
    assert!(generated.contains("Extracted 1 file(s)."));
    assert!(generated.contains("[OK] Generator: Successfully generated 1 modules."));

    let files = run(
        &runtime,
        &shell,
        Command::Files {
            project: "hello".into(),
            all: false,
        },
    );
    assert!(files.contains("src/hello.py"));
    assert!(!files.contains(".conversation_history"));

    let version = run(
        &runtime,
        &shell,
        Command::Commit {
            project: "hello".into(),
            message: "first".into(),
        },
    );
    let version_id = version.lines().next().unwrap().to_string();
    let versions = run(
        &runtime,
        &shell,
        Command::Versions {
            project: "hello".into(),
        },
    );
    assert!(versions.starts_with('*'));
    assert!(versions.contains("first"));

    run(
        &runtime,
        &shell,
        Command::Download {
            project: "hello".into(),
            file: "src/hello.py".into(),
            dir: temp_dir.path().to_path_buf(),
        },
    );
    assert_eq!(
        std::fs::read_to_string(temp_dir.path().join("hello.py")).unwrap(),
        "print(\"hi\")"
    );

    run(
        &runtime,
        &shell,
        Command::Transcript {
            project: "hello".into(),
            dir: temp_dir.path().to_path_buf(),
        },
    );
    assert_eq!(
        std::fs::read_to_string(temp_dir.path().join("plan.md")).unwrap(),
        HELLO.concat()
    );

    run(
        &runtime,
        &shell,
        Command::DropVersion {
            project: "hello".into(),
            version: version_id,
        },
    );
    let versions = run(
        &runtime,
        &shell,
        Command::Versions {
            project: "hello".into(),
        },
    );
    assert!(versions.contains("has no versions"));
}

#[test]
fn unknown_project_reference_is_an_error() {
    let runtime = test_runtime();
    let shell = shell(Arc::new(MemoryStore::new()));
    let mut out = Vec::new();
    let err = runtime
        .block_on(shell.run(
            Command::Files {
                project: "nope".into(),
                all: false,
            },
            &mut out,
        ))
        .unwrap_err();
    assert!(err.to_string().contains("no project matches"));
}

#[test]
fn blank_project_name_creates_nothing() {
    let runtime = test_runtime();
    let shell = shell(Arc::new(MemoryStore::new()));
    let mut out = Vec::new();
    let err = runtime
        .block_on(shell.run(
            Command::New {
                name: Some("   ".into()),
            },
            &mut out,
        ))
        .unwrap_err();
    assert!(err.to_string().contains("name"));

    let listing = run(&runtime, &shell, Command::Projects);
    assert!(listing.starts_with("No projects yet"));
}

#[test]
fn channel_commands_persist_registry() {
    let runtime = test_runtime();
    let store = Arc::new(MemoryStore::new());
    let shell = shell(Arc::clone(&store));

    let added = run(
        &runtime,
        &shell,
        Command::AddChannel {
            channel: "openrouter".into(),
            api_key: Some("sk-or".into()),
            base_url: None,
            model_id: Some("meta-llama/llama-3-70b".into()),
            model_name: "Llama".into(),
            params: Some(r#"{"top_p": 0.9}"#.into()),
            primary: true,
        },
    );
    let config_id = added.lines().next().unwrap().to_string();

    let listing = run(&runtime, &shell, Command::Models);
    assert!(listing.contains(&format!("{config_id} [openrouter]")));
    assert!(listing.contains("* "));
    assert!(listing.contains("meta-llama/llama-3-70b"));

    let stored = store.get(CONFIG_STORAGE_KEY).unwrap().expect("saved");
    assert!(stored.contains("sk-or"));
    assert!(stored.contains("\"isPrimary\": true"));

    run(&runtime, &shell, Command::RemoveChannel { config: config_id });
    let listing = run(&runtime, &shell, Command::Models);
    assert!(!listing.contains("openrouter"));
}

#[test]
fn probe_logs_connectivity_banner() {
    let runtime = test_runtime();
    let shell = shell(Arc::new(MemoryStore::new()));
    let output = run(&runtime, &shell, Command::Probe { force: true });
    assert!(output.starts_with("ONLINE  Studio Internal"));
    assert!(output.contains("API CONNECTION VERIFIED: ONLINE"));
}
