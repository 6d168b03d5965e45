use super::test_runtime;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use planforge_core::config::ConfigRegistry;
use planforge_core::llm::{
    ConnectivityReport, GatewayError, GenerationRequest, LanguageModelProvider, LlmDriver,
    LlmProviderKind, ModelTarget, StreamEnd,
};
use planforge_core::settings::RuntimeSettings;
use planforge_core::{AppState, CancellationToken};
use std::io::{Cursor, Read};
use std::sync::Arc;

/// Replies with a fixed script and remembers every request it saw.
struct RecordingProvider {
    reply: Vec<String>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl RecordingProvider {
    fn new(reply: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.iter().map(|chunk| chunk.to_string()).collect(),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LanguageModelProvider for RecordingProvider {
    async fn stream_generation(
        &self,
        request: &GenerationRequest,
        _cancel: &CancellationToken,
        sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<StreamEnd, GatewayError> {
        self.requests.lock().push(request.clone());
        for chunk in &self.reply {
            sink(chunk);
        }
        Ok(StreamEnd::Completed)
    }

    async fn probe(&self, target: &ModelTarget) -> ConnectivityReport {
        ConnectivityReport::online(target, "recorded", 1)
    }
}

fn driver_with(provider: Arc<RecordingProvider>, settings: &RuntimeSettings) -> LlmDriver {
    LlmDriver::new(
        LlmProviderKind::Mock,
        Arc::new(RwLock::new(ConfigRegistry::new())),
        provider,
        settings,
    )
}

const MAIN_PY: [&str; 3] = [
    "Plan first.\n\n**File: main.py**\n",
    "```python\nprint(\"hi\")\n```\n",
    "**File: README.md**\n```markdown\n# Hello\n```\n",
];

#[test]
fn follow_up_turn_sends_visible_file_context() {
    let runtime = test_runtime();
    let provider = RecordingProvider::new(&MAIN_PY);
    let state = AppState::new(driver_with(provider.clone(), &RuntimeSettings::default()));
    let project = state.new_project();

    for intent in ["build a hello-world script", "add a docstring"] {
        runtime
            .block_on(state.run_generation(
                project.id,
                intent,
                &CancellationToken::new(),
                &mut |_: &str| {},
            ))
            .expect("generation");
    }

    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].user_prompt, "build a hello-world script");
    assert_eq!(
        requests[1].user_prompt,
        "[CONTEXT]\n- main.py (python)\n- README.md (markdown)\n\n[USER]\nadd a docstring"
    );
    assert!(!requests[1].user_prompt.contains(".conversation_history"));
    assert_eq!(requests[1].target.label, "Studio Internal");
}

#[test]
fn settings_override_prompt_and_temperature() {
    let runtime = test_runtime();
    let provider = RecordingProvider::new(&["ok"]);
    let mut settings = RuntimeSettings::default();
    settings.generation.system_prompt = Some("Answer tersely.".into());
    settings.generation.temperature = 0.2;
    let state = AppState::new(driver_with(provider.clone(), &settings));
    let project = state.new_project();

    runtime
        .block_on(state.run_generation(
            project.id,
            "hi",
            &CancellationToken::new(),
            &mut |_: &str| {},
        ))
        .expect("generation");

    let request = &provider.requests()[0];
    assert_eq!(request.system_prompt, "Answer tersely.");
    assert!((request.temperature - 0.2).abs() < f32::EPSILON);
}

#[test]
fn export_contains_only_visible_files_under_project_root() {
    let runtime = test_runtime();
    let provider = RecordingProvider::new(&MAIN_PY);
    let state = AppState::new(driver_with(provider, &RuntimeSettings::default()));
    let project = state.new_project();
    state.rename_project(project.id, "hello").expect("rename");

    let mut streamed = String::new();
    let report = runtime
        .block_on(state.run_generation(
            project.id,
            "build a hello-world script",
            &CancellationToken::new(),
            &mut |delta: &str| streamed.push_str(delta),
        ))
        .expect("generation");
    assert_eq!(streamed, report.content);
    assert_eq!(report.extracted_files, 2);

    let mut buffer = Cursor::new(Vec::new());
    state
        .export_project(project.id, &mut buffer)
        .expect("export");

    let mut archive = zip::ZipArchive::new(Cursor::new(buffer.into_inner())).expect("archive");
    let mut names: Vec<String> = (0..archive.len())
        .map(|index| archive.by_index(index).unwrap().name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["hello/", "hello/README.md", "hello/main.py"]);

    let mut content = String::new();
    archive
        .by_name("hello/main.py")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "print(\"hi\")");
}
