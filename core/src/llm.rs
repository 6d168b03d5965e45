use crate::cancel::CancellationToken;
use crate::config::{ActiveSelection, Channel, ConfigRegistry, ExtraParameters};
use crate::connectivity::Prober;
use crate::gateway::HttpProvider;
use crate::settings::{GenerationSettings, RuntimeSettings};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are Planforge, an assistant that turns a plain-language request into a working multi-file software project.

Work in phases:
1. Restate the core intent of the request.
2. Decide which components and models the project needs.
3. Split the work into modules and explain how they fit together.
4. Emit the complete source for every module.

Output rules:
- Answer in structured Markdown and explain the design before the code.
- Every file MUST use exactly this layout so it can be extracted automatically:

**File: path/to/filename.ext**
```language
<file content>
```

- Never write "FILE:", "Filename:" or any other variant. Only "**File: path**" in bold.
- When existing files are listed under [CONTEXT], only emit the files you change or add.
- Finish with a short tree of the project layout."#;

const GOOGLE_DEFAULT_MODEL: &str = "gemini-3-pro-preview";
const GOOGLE_PROBE_MODEL: &str = "gemini-3-flash-preview";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    Http,
    Mock,
}

impl LlmProviderKind {
    pub fn from_environment() -> Self {
        match std::env::var("LLM_PROVIDER") {
            Ok(value) if value.eq_ignore_ascii_case("mock") => Self::Mock,
            _ => Self::Http,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{0}")]
    Configuration(String),
    #[error("Request Timeout (check proxy/network)")]
    Timeout,
    #[error("Network unreachable: {0}")]
    Transport(String),
    #[error("{message}")]
    Http { status: u16, message: String },
    #[error("Rate limited: {message}")]
    RateLimited { status: Option<u16>, message: String },
    #[error("Stream error: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Timeout,
    Transport,
    Http,
    RateLimited,
    Stream,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Http => "http",
            Self::RateLimited => "rate_limited",
            Self::Stream => "stream",
        }
    }
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Timeout => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Http { .. } => ErrorKind::Http,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Stream(_) => ErrorKind::Stream,
        }
    }

    /// Stable reason string for callers that branch on the failure class.
    pub fn reason(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Classifies a non-2xx response. The provider's `error.message` is used when
    /// the body carries one, otherwise the bare status code.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = provider_message(body).unwrap_or_else(|| format!("Status: {status}"));
        if status == 429 || mentions_rate_limit(&message) {
            Self::RateLimited {
                status: Some(status),
                message,
            }
        } else {
            Self::Http { status, message }
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), "");
        }
        if err.is_connect() {
            return Self::Transport(format!("connection failed ({err})"));
        }
        Self::Transport(err.to_string())
    }
}

fn provider_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|message| message.as_str())
        .or_else(|| error.as_str())
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_owned)
}

pub(crate) fn mentions_rate_limit(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("rate limit")
        || lowered.contains("rate-limit")
        || lowered.contains("quota")
        || lowered.contains("resource_exhausted")
}

/// Fully resolved destination of a request: endpoint, credential and model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTarget {
    pub channel: Channel,
    pub model_id: String,
    pub api_key: String,
    pub base_url: String,
    pub extra: ExtraParameters,
    /// Channel name shown in reports.
    pub label: String,
    pub internal: bool,
}

impl ModelTarget {
    pub fn resolve(selection: &ActiveSelection, managed_key: Option<&str>) -> Self {
        Self::resolve_with(selection, managed_key, GOOGLE_DEFAULT_MODEL)
    }

    /// Same as [`resolve`](Self::resolve) but an internal model without an id
    /// falls back to the lighter probe model.
    pub fn resolve_for_probe(selection: &ActiveSelection, managed_key: Option<&str>) -> Self {
        Self::resolve_with(selection, managed_key, GOOGLE_PROBE_MODEL)
    }

    fn resolve_with(
        selection: &ActiveSelection,
        managed_key: Option<&str>,
        internal_default: &str,
    ) -> Self {
        let config = &selection.config;
        let internal = config.is_internal;
        let managed = managed_key.unwrap_or_default().trim().to_string();
        let configured = config.api_key.trim().to_string();
        let api_key = if internal || (configured.is_empty() && config.channel == Channel::Google) {
            managed
        } else {
            configured
        };

        let mut model_id = selection.model.model_id.trim().to_string();
        if model_id.is_empty() && internal {
            model_id = internal_default.to_string();
        }

        let label = match (internal, config.channel) {
            (true, _) => "Studio Internal".to_string(),
            (false, Channel::Google) => "Google Cloud".to_string(),
            (false, channel) => channel.to_string(),
        };

        Self {
            channel: config.channel,
            model_id,
            api_key,
            base_url: resolve_base_url(config.channel, config.base_url.as_deref()),
            extra: selection.model.extra_parameters(),
            label,
            internal,
        }
    }
}

pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const COMPATIBLE_FALLBACK_URL: &str = "http://localhost:11434/v1";

/// Channel-specific base URL without trailing slashes. Google and OpenRouter
/// ignore any configured value.
pub fn resolve_base_url(channel: Channel, configured: Option<&str>) -> String {
    let configured = configured.map(str::trim).filter(|url| !url.is_empty());
    let base = match channel {
        Channel::Google => GOOGLE_BASE_URL,
        Channel::OpenRouter => OPENROUTER_BASE_URL,
        Channel::OpenAi => configured.unwrap_or(OPENAI_BASE_URL),
        Channel::Compatible => configured.unwrap_or(COMPATIBLE_FALLBACK_URL),
    };
    base.trim().trim_end_matches('/').to_string()
}

/// `[CONTEXT]` block listing existing files, followed by the user's request.
pub fn compose_prompt(intent: &str, context: Option<&str>) -> String {
    match context {
        Some(summary) => format!("[CONTEXT]\n{summary}\n\n[USER]\n{intent}"),
        None => intent.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub target: ModelTarget,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectivityReport {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub failure: Option<ErrorKind>,
}

impl ConnectivityReport {
    pub fn online(target: &ModelTarget, message: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            success: true,
            message: message.into(),
            latency_ms: Some(latency_ms),
            model_id: Some(target.model_id.clone()),
            channel: Some(target.label.clone()),
            timestamp: Utc::now(),
            failure: None,
        }
    }

    pub fn failed(channel: impl Into<String>, error: &GatewayError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            latency_ms: None,
            model_id: None,
            channel: Some(channel.into()),
            timestamp: Utc::now(),
            failure: Some(error.kind()),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.failure == Some(ErrorKind::RateLimited)
    }
}

#[async_trait]
pub trait LanguageModelProvider: Send + Sync {
    /// Streams text deltas into `sink` in arrival order until the response ends
    /// or `cancel` fires. Nothing is buffered on the caller's behalf.
    async fn stream_generation(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<StreamEnd, GatewayError>;

    /// Minimal request against `target`; never fails, failures are in the report.
    async fn probe(&self, target: &ModelTarget) -> ConnectivityReport;
}

pub type SharedConfigs = Arc<RwLock<ConfigRegistry>>;

#[derive(Clone)]
pub struct LlmDriver {
    kind: LlmProviderKind,
    configs: SharedConfigs,
    provider: Arc<dyn LanguageModelProvider>,
    managed_key: Option<String>,
    generation: GenerationSettings,
}

impl LlmDriver {
    pub fn new(
        kind: LlmProviderKind,
        configs: SharedConfigs,
        provider: Arc<dyn LanguageModelProvider>,
        settings: &RuntimeSettings,
    ) -> Self {
        Self {
            kind,
            configs,
            provider,
            managed_key: settings.managed_api_key(),
            generation: settings.generation.clone(),
        }
    }

    pub fn from_settings(
        kind: LlmProviderKind,
        configs: SharedConfigs,
        settings: &RuntimeSettings,
    ) -> Result<Self> {
        let provider: Arc<dyn LanguageModelProvider> = match kind {
            LlmProviderKind::Http => Arc::new(HttpProvider::new(&settings.network)?),
            LlmProviderKind::Mock => Arc::new(MockProvider::default()),
        };
        Ok(Self::new(kind, configs, provider, settings))
    }

    /// Offline driver that replays `chunks` as the response to every request.
    pub fn scripted<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = MockProvider::scripted(chunks.into_iter().map(Into::into).collect());
        Self::new(
            LlmProviderKind::Mock,
            Arc::new(RwLock::new(ConfigRegistry::new())),
            Arc::new(provider),
            &RuntimeSettings::default(),
        )
    }

    /// Offline driver that answers every request with a small synthetic project.
    pub fn fake() -> Self {
        Self::new(
            LlmProviderKind::Mock,
            Arc::new(RwLock::new(ConfigRegistry::new())),
            Arc::new(MockProvider::default()),
            &RuntimeSettings::default(),
        )
    }

    pub fn provider_kind(&self) -> LlmProviderKind {
        self.kind
    }

    pub fn configs(&self) -> &SharedConfigs {
        &self.configs
    }

    pub fn active_target(&self) -> ModelTarget {
        let selection = self.configs.read().active_model();
        ModelTarget::resolve(&selection, self.managed_key.as_deref())
    }

    pub fn system_prompt(&self) -> &str {
        self.generation
            .system_prompt
            .as_deref()
            .unwrap_or(PLANNER_SYSTEM_PROMPT)
    }

    /// Streams the response to `intent` into `sink`. `context` is the summary of
    /// files the project already holds.
    pub async fn generate(
        &self,
        intent: &str,
        context: Option<&str>,
        cancel: &CancellationToken,
        sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<StreamEnd, GatewayError> {
        if intent.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "request text cannot be empty".to_string(),
            ));
        }
        let request = GenerationRequest {
            target: self.active_target(),
            system_prompt: self.system_prompt().to_string(),
            user_prompt: compose_prompt(intent, context),
            temperature: self.generation.temperature,
        };
        tracing::debug!(
            channel = %request.target.channel,
            model = %request.target.model_id,
            "starting generation stream"
        );
        self.provider
            .stream_generation(&request, cancel, sink)
            .await
    }
}

#[async_trait]
impl Prober for LlmDriver {
    async fn probe(&self) -> ConnectivityReport {
        let selection = self.configs.read().active_model();
        let target = ModelTarget::resolve_for_probe(&selection, self.managed_key.as_deref());
        self.provider.probe(&target).await
    }
}

/// Provider that never touches the network.
#[derive(Default)]
pub struct MockProvider {
    script: Option<Vec<String>>,
}

impl MockProvider {
    pub fn scripted(chunks: Vec<String>) -> Self {
        Self {
            script: Some(chunks),
        }
    }

    fn chunks_for(&self, request: &GenerationRequest) -> Vec<String> {
        if let Some(script) = &self.script {
            return script.clone();
        }
        let intent = request
            .user_prompt
            .rsplit("[USER]\n")
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        vec![
            format!("[Mock] Plan for: {intent}\n\n"),
            "**File: README.md**\n".to_string(),
            "```markdown\n".to_string(),
            format!("# Mock project\n\n{intent}\n"),
            "```\n".to_string(),
        ]
    }
}

#[async_trait]
impl LanguageModelProvider for MockProvider {
    async fn stream_generation(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<StreamEnd, GatewayError> {
        for chunk in self.chunks_for(request) {
            sleep(Duration::from_millis(2)).await;
            if cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }
            sink(&chunk);
        }
        Ok(StreamEnd::Completed)
    }

    async fn probe(&self, target: &ModelTarget) -> ConnectivityReport {
        ConnectivityReport::online(target, "Mock OK", 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiConfig, ModelInstance};

    fn selection(config: AiConfig) -> ActiveSelection {
        let model = config.models[0].clone();
        ActiveSelection { config, model }
    }

    #[test]
    fn base_urls_follow_channel_rules() {
        assert_eq!(
            resolve_base_url(Channel::OpenRouter, Some("https://elsewhere/")),
            OPENROUTER_BASE_URL
        );
        assert_eq!(resolve_base_url(Channel::OpenAi, None), OPENAI_BASE_URL);
        assert_eq!(
            resolve_base_url(Channel::OpenAi, Some(" https://proxy.local/v1/// ")),
            "https://proxy.local/v1"
        );
        assert_eq!(
            resolve_base_url(Channel::Compatible, Some("")),
            COMPATIBLE_FALLBACK_URL
        );
        assert_eq!(resolve_base_url(Channel::Google, Some("x")), GOOGLE_BASE_URL);
    }

    #[test]
    fn internal_target_uses_managed_key() {
        let target = ModelTarget::resolve(&selection(AiConfig::internal()), Some("managed"));
        assert_eq!(target.api_key, "managed");
        assert_eq!(target.label, "Studio Internal");
        assert_eq!(target.model_id, "gemini-3-pro-preview");
    }

    #[test]
    fn internal_model_without_id_gets_channel_default() {
        let mut sel = selection(AiConfig::internal());
        sel.model.model_id.clear();
        assert_eq!(
            ModelTarget::resolve(&sel, None).model_id,
            "gemini-3-pro-preview"
        );
        assert_eq!(
            ModelTarget::resolve_for_probe(&sel, None).model_id,
            "gemini-3-flash-preview"
        );
    }

    #[test]
    fn user_target_keeps_own_key_and_params() {
        let mut config = AiConfig::new(Channel::Compatible);
        config.api_key = "sk-user".into();
        config.base_url = Some("http://127.0.0.1:8000/v1/".into());
        config.models = vec![ModelInstance {
            custom_params: Some(r#"{"top_p": 0.9}"#.into()),
            ..ModelInstance::new("Local", " llama3 ")
        }];
        let target = ModelTarget::resolve(&selection(config), Some("managed"));
        assert_eq!(target.api_key, "sk-user");
        assert_eq!(target.model_id, "llama3");
        assert_eq!(target.base_url, "http://127.0.0.1:8000/v1");
        assert_eq!(target.label, "compatible");
        assert_eq!(target.extra.len(), 1);
    }

    #[test]
    fn google_user_channel_falls_back_to_managed_key() {
        let config = AiConfig::new(Channel::Google);
        let target = ModelTarget::resolve(&selection(config), Some("managed"));
        assert_eq!(target.api_key, "managed");
        assert_eq!(target.label, "Google Cloud");
    }

    #[test]
    fn prompt_includes_context_block_only_when_present() {
        assert_eq!(compose_prompt("do it", None), "do it");
        assert_eq!(
            compose_prompt("do it", Some("- main.py (python)")),
            "[CONTEXT]\n- main.py (python)\n\n[USER]\ndo it"
        );
    }

    #[test]
    fn status_errors_prefer_provider_message() {
        let err = GatewayError::from_status(401, r#"{"error":{"message":"Invalid API key"}}"#);
        assert_eq!(err.to_string(), "Invalid API key");
        assert_eq!(err.reason(), "http");

        let err = GatewayError::from_status(502, "<html>bad gateway</html>");
        assert_eq!(err.to_string(), "Status: 502");
    }

    #[test]
    fn rate_limits_are_recognized() {
        assert!(GatewayError::from_status(429, "").is_rate_limited());
        assert!(GatewayError::from_status(
            400,
            r#"{"error":{"message":"Quota exceeded for model"}}"#
        )
        .is_rate_limited());
        assert!(!GatewayError::Timeout.is_rate_limited());
        assert!(GatewayError::Timeout.is_timeout());
        assert_eq!(GatewayError::Timeout.reason(), "timeout");
    }

    #[tokio::test]
    async fn scripted_driver_streams_chunks_in_order() {
        let driver = LlmDriver::scripted(["a", "b", "c"]);
        let mut received = Vec::new();
        let end = driver
            .generate("hello", None, &CancellationToken::new(), &mut |delta: &str| {
                received.push(delta.to_string())
            })
            .await
            .expect("stream");
        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(received, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn empty_intent_is_rejected_before_streaming() {
        let driver = LlmDriver::fake();
        let err = driver
            .generate("  ", None, &CancellationToken::new(), &mut |_: &str| {})
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "configuration");
    }

    #[tokio::test]
    async fn fake_driver_probe_reports_online() {
        let driver = LlmDriver::fake();
        let report = Prober::probe(&driver).await;
        assert!(report.success);
        assert_eq!(report.channel.as_deref(), Some("Studio Internal"));
    }
}
