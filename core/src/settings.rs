use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SETTINGS_FILE: &str = "planforge.yaml";
const ENV_API_KEYS: [&str; 2] = ["PLANFORGE_API_KEY", "GEMINI_API_KEY"];

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("invalid planforge.yaml: {0}")]
    Invalid(String),
}

impl SettingsError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => format!("Settings ignored: {detail}. Update {SETTINGS_FILE}."),
        }
    }
}

/// Contents of `planforge.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    /// Credential for the internal channel; the environment is consulted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_api_key: Option<String>,
}

impl RuntimeSettings {
    pub fn from_yaml(contents: &str) -> Result<Self, SettingsError> {
        let settings: Self =
            serde_yaml::from_str(contents).map_err(|err| SettingsError::Invalid(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_yaml(&self) -> Result<String, SettingsError> {
        serde_yaml::to_string(self).map_err(|err| SettingsError::Invalid(err.to_string()))
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let network = &self.network;
        if network.request_timeout_ms == 0 || network.generation_timeout_ms == 0 {
            return Err(SettingsError::Invalid(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if network.penalty_delay_ms <= network.min_check_interval_ms {
            return Err(SettingsError::Invalid(
                "penalty_delay_ms must exceed min_check_interval_ms".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(SettingsError::Invalid(
                "temperature must be between 0 and 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Managed credential from settings, then from the environment.
    pub fn managed_api_key(&self) -> Option<String> {
        self.managed_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_owned)
            .or_else(|| {
                ENV_API_KEYS
                    .iter()
                    .filter_map(|name| std::env::var(name).ok())
                    .map(|key| key.trim().to_string())
                    .find(|key| !key.is_empty())
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSettings {
    #[serde(default = "NetworkSettings::default_min_check_interval")]
    pub min_check_interval_ms: u64,
    #[serde(default = "NetworkSettings::default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "NetworkSettings::default_penalty_delay")]
    pub penalty_delay_ms: u64,
    #[serde(default = "NetworkSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "NetworkSettings::default_generation_timeout")]
    pub generation_timeout_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            min_check_interval_ms: Self::default_min_check_interval(),
            request_timeout_ms: Self::default_request_timeout(),
            penalty_delay_ms: Self::default_penalty_delay(),
            poll_interval_ms: Self::default_poll_interval(),
            generation_timeout_ms: Self::default_generation_timeout(),
        }
    }
}

impl NetworkSettings {
    fn default_min_check_interval() -> u64 {
        20_000
    }

    fn default_request_timeout() -> u64 {
        15_000
    }

    fn default_penalty_delay() -> u64 {
        60_000
    }

    fn default_poll_interval() -> u64 {
        120_000
    }

    fn default_generation_timeout() -> u64 {
        300_000
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.min_check_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn penalty_delay(&self) -> Duration {
        Duration::from_millis(self.penalty_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationSettings {
    #[serde(default = "GenerationSettings::default_temperature")]
    pub temperature: f32,
    /// Replaces the built-in planner prompt when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: Self::default_temperature(),
            system_prompt: None,
        }
    }
}

impl GenerationSettings {
    fn default_temperature() -> f32 {
        0.7
    }
}

/// Per-user configuration directory, falling back to `.planforge` in the working directory.
pub fn user_config_dir() -> PathBuf {
    if let Some(base) = BaseDirs::new() {
        base.config_dir().join("planforge")
    } else {
        PathBuf::from(".planforge")
    }
}

pub fn project_config_dir(path: &Path) -> PathBuf {
    path.join(".planforge")
}
