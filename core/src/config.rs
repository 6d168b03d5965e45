use crate::store::{load_json, save_json, KeyValueStore};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Storage key of the serialized channel list. Bump the suffix on format changes.
pub const CONFIG_STORAGE_KEY: &str = "ai_planner_configs_v5";
pub const INTERNAL_CONFIG_ID: &str = "google-internal";
pub const INTERNAL_MODEL_ID: &str = "m-internal";
const INTERNAL_MODEL_NAME: &str = "Studio Native (Gemini 3 Pro)";
const INTERNAL_MODEL_SLUG: &str = "gemini-3-pro-preview";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Google,
    #[serde(rename = "openai")]
    OpenAi,
    Compatible,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::OpenAi => "openai",
            Self::Compatible => "compatible",
            Self::OpenRouter => "openrouter",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" | "gemini" => Some(Self::Google),
            "openai" => Some(Self::OpenAi),
            "compatible" => Some(Self::Compatible),
            "openrouter" => Some(Self::OpenRouter),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInstance {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub is_secondary: bool,
    /// Raw JSON object merged into outgoing request bodies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_params: Option<String>,
}

impl ModelInstance {
    pub fn new(name: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            id: format!("m-{}", Uuid::new_v4().simple()),
            name: name.into(),
            model_id: model_id.into(),
            is_primary: false,
            is_secondary: false,
            custom_params: None,
        }
    }

    pub fn extra_parameters(&self) -> ExtraParameters {
        ExtraParameters::parse(self.custom_params.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    pub id: String,
    pub channel: Channel,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelInstance>,
    #[serde(default)]
    pub is_internal: bool,
}

impl AiConfig {
    pub fn new(channel: Channel) -> Self {
        Self {
            id: format!("c-{}", Uuid::new_v4().simple()),
            channel,
            api_key: String::new(),
            base_url: None,
            models: vec![ModelInstance::new("New Model", "")],
            is_internal: false,
        }
    }

    /// The always-present channel backed by the managed credential.
    pub fn internal() -> Self {
        Self {
            id: INTERNAL_CONFIG_ID.to_string(),
            channel: Channel::Google,
            api_key: String::new(),
            base_url: None,
            models: vec![ModelInstance {
                id: INTERNAL_MODEL_ID.to_string(),
                name: INTERNAL_MODEL_NAME.to_string(),
                model_id: INTERNAL_MODEL_SLUG.to_string(),
                is_primary: true,
                is_secondary: false,
                custom_params: None,
            }],
            is_internal: true,
        }
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelInstance> {
        self.models.iter().find(|model| model.id == model_id)
    }

    pub fn primary_model(&self) -> Option<&ModelInstance> {
        self.models.iter().find(|model| model.is_primary)
    }
}

/// The config/model pair that generation and probes target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSelection {
    pub config: AiConfig,
    pub model: ModelInstance,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("channel {0} does not exist")]
    UnknownConfig(String),
    #[error("model {model} does not exist in channel {config}")]
    UnknownModel { config: String, model: String },
    #[error("the internal channel is managed and cannot be changed")]
    InternalProtected,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelUpdate {
    pub channel: Option<Channel>,
    pub api_key: Option<String>,
    /// `Some(None)` clears the base URL.
    pub base_url: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelUpdate {
    pub name: Option<String>,
    pub model_id: Option<String>,
    pub custom_params: Option<Option<String>>,
    pub is_secondary: Option<bool>,
}

/// All configured channels. Holds the internal channel at all times and at most
/// one primary model across every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRegistry {
    configs: Vec<AiConfig>,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self {
            configs: vec![AiConfig::internal()],
        }
    }

    /// Builds a registry from persisted configs. The internal channel is injected
    /// when absent; when present only its primary flag survives, its model list
    /// always comes from the built-in definition.
    pub fn from_stored(stored: Vec<AiConfig>) -> Self {
        let mut configs = stored;
        match configs.iter().position(|config| config.id == INTERNAL_CONFIG_ID) {
            Some(position) => {
                let stored_internal = &configs[position];
                let mut internal = AiConfig::internal();
                for model in &mut internal.models {
                    model.is_primary = stored_internal
                        .models
                        .iter()
                        .any(|stored| stored.is_primary && stored.id == model.id);
                }
                configs[position] = internal;
            }
            None => {
                let mut internal = AiConfig::internal();
                for model in &mut internal.models {
                    model.is_primary = false;
                }
                configs.insert(0, internal);
            }
        }
        let mut registry = Self { configs };
        registry.normalize_primary();
        registry
    }

    pub fn load(store: &dyn KeyValueStore) -> Result<Self> {
        let stored: Vec<AiConfig> = load_json(store, CONFIG_STORAGE_KEY)?.unwrap_or_default();
        Ok(Self::from_stored(stored))
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        save_json(store, CONFIG_STORAGE_KEY, &self.configs)
    }

    pub fn configs(&self) -> &[AiConfig] {
        &self.configs
    }

    pub fn config(&self, id: &str) -> Option<&AiConfig> {
        self.configs.iter().find(|config| config.id == id)
    }

    pub fn primary_count(&self) -> usize {
        self.configs
            .iter()
            .flat_map(|config| config.models.iter())
            .filter(|model| model.is_primary)
            .count()
    }

    /// The primary model, or the internal model when nothing is marked primary.
    pub fn active_model(&self) -> ActiveSelection {
        for config in &self.configs {
            if let Some(model) = config.primary_model() {
                return ActiveSelection {
                    config: config.clone(),
                    model: model.clone(),
                };
            }
        }
        let internal = AiConfig::internal();
        let model = internal.models[0].clone();
        ActiveSelection {
            config: internal,
            model,
        }
    }

    /// Marks one model primary and clears the flag everywhere else in a single step.
    pub fn set_primary(&mut self, config_id: &str, model_id: &str) -> Result<(), ConfigError> {
        let config = self
            .config(config_id)
            .ok_or_else(|| ConfigError::UnknownConfig(config_id.to_string()))?;
        if config.model(model_id).is_none() {
            return Err(ConfigError::UnknownModel {
                config: config_id.to_string(),
                model: model_id.to_string(),
            });
        }
        for config in &mut self.configs {
            let owner = config.id == config_id;
            for model in &mut config.models {
                model.is_primary = owner && model.id == model_id;
            }
        }
        Ok(())
    }

    pub fn add_channel(&mut self, channel: Channel) -> &AiConfig {
        self.configs.push(AiConfig::new(channel));
        &self.configs[self.configs.len() - 1]
    }

    pub fn remove_channel(&mut self, config_id: &str) -> Result<AiConfig, ConfigError> {
        let position = self.position(config_id)?;
        if self.configs[position].is_internal {
            return Err(ConfigError::InternalProtected);
        }
        let removed = self.configs.remove(position);
        self.normalize_primary();
        Ok(removed)
    }

    pub fn update_channel(
        &mut self,
        config_id: &str,
        update: ChannelUpdate,
    ) -> Result<(), ConfigError> {
        let config = self.user_config_mut(config_id)?;
        if let Some(channel) = update.channel {
            config.channel = channel;
        }
        if let Some(api_key) = update.api_key {
            config.api_key = api_key.trim().to_string();
        }
        if let Some(base_url) = update.base_url {
            config.base_url = base_url
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty());
        }
        Ok(())
    }

    pub fn add_model(
        &mut self,
        config_id: &str,
        name: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Result<&ModelInstance, ConfigError> {
        let config = self.user_config_mut(config_id)?;
        config.models.push(ModelInstance::new(name, model_id));
        Ok(&config.models[config.models.len() - 1])
    }

    pub fn remove_model(
        &mut self,
        config_id: &str,
        model_id: &str,
    ) -> Result<ModelInstance, ConfigError> {
        let config = self.user_config_mut(config_id)?;
        let position = config
            .models
            .iter()
            .position(|model| model.id == model_id)
            .ok_or_else(|| ConfigError::UnknownModel {
                config: config_id.to_string(),
                model: model_id.to_string(),
            })?;
        let removed = config.models.remove(position);
        self.normalize_primary();
        Ok(removed)
    }

    pub fn update_model(
        &mut self,
        config_id: &str,
        model_id: &str,
        update: ModelUpdate,
    ) -> Result<(), ConfigError> {
        let config = self.user_config_mut(config_id)?;
        let model = config
            .models
            .iter_mut()
            .find(|model| model.id == model_id)
            .ok_or_else(|| ConfigError::UnknownModel {
                config: config_id.to_string(),
                model: model_id.to_string(),
            })?;
        if let Some(name) = update.name {
            model.name = name;
        }
        if let Some(slug) = update.model_id {
            model.model_id = slug.trim().to_string();
        }
        if let Some(params) = update.custom_params {
            model.custom_params = params.filter(|raw| !raw.trim().is_empty());
        }
        if let Some(secondary) = update.is_secondary {
            model.is_secondary = secondary;
        }
        Ok(())
    }

    fn position(&self, config_id: &str) -> Result<usize, ConfigError> {
        self.configs
            .iter()
            .position(|config| config.id == config_id)
            .ok_or_else(|| ConfigError::UnknownConfig(config_id.to_string()))
    }

    fn user_config_mut(&mut self, config_id: &str) -> Result<&mut AiConfig, ConfigError> {
        let position = self.position(config_id)?;
        let config = &mut self.configs[position];
        if config.is_internal {
            return Err(ConfigError::InternalProtected);
        }
        Ok(config)
    }

    fn normalize_primary(&mut self) {
        let mut seen = false;
        for config in &mut self.configs {
            for model in &mut config.models {
                if model.is_primary {
                    if seen {
                        model.is_primary = false;
                    }
                    seen = true;
                }
            }
        }
        if !seen {
            if let Some(model) = self
                .configs
                .iter_mut()
                .find(|config| config.is_internal)
                .and_then(|config| config.models.first_mut())
            {
                model.is_primary = true;
            }
        }
    }
}

/// Validated key-value bag merged into outgoing request bodies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraParameters(Map<String, Value>);

impl ExtraParameters {
    /// Accepts only a JSON object; anything else is ignored.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Self::default();
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Self(map),
            Ok(_) => {
                tracing::warn!("ignoring extra parameters that are not a JSON object");
                Self::default()
            }
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed extra parameters");
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Overlays the parameters onto `body`. `null` entries are skipped so a
    /// parameter can override a required field but never remove it.
    pub fn apply_to(&self, body: &mut Value) {
        let Value::Object(target) = body else {
            return;
        };
        for (key, value) in &self.0 {
            if value.is_null() {
                continue;
            }
            target.insert(key.clone(), value.clone());
        }
    }
}
