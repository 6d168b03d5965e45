use anyhow::{Context, Result};
use directories::BaseDirs;
use planforge_core::settings::{project_config_dir, user_config_dir, RuntimeSettings, SETTINGS_FILE};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    User,
    Project(PathBuf),
}

impl Scope {
    pub fn from_project_flag(project_dir: Option<PathBuf>) -> Self {
        match project_dir {
            Some(path) => Self::Project(path),
            None => Self::User,
        }
    }
}

/// Loads `planforge.yaml`, writing the defaults when the file does not exist.
/// An unreadable document is reported and replaced by defaults for this run only.
pub async fn load_runtime_settings(scope: &Scope) -> Result<RuntimeSettings> {
    for path in settings_candidates(scope) {
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                return match RuntimeSettings::from_yaml(&contents) {
                    Ok(settings) => Ok(settings),
                    Err(err) => {
                        warn!(
                            error = %err,
                            "{} Using defaults.",
                            err.user_message()
                        );
                        Ok(RuntimeSettings::default())
                    }
                };
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        }
    }

    let defaults = RuntimeSettings::default();
    save_runtime_settings(scope, &defaults).await?;
    Ok(defaults)
}

pub async fn save_runtime_settings(scope: &Scope, settings: &RuntimeSettings) -> Result<()> {
    let path = settings_path(scope);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let serialized = settings.to_yaml()?;
    tokio::fs::write(&path, serialized)
        .await
        .with_context(|| format!("failed to write {SETTINGS_FILE} at {}", path.display()))
}

/// Directory holding the persisted channel list and workspace.
pub fn data_dir(scope: &Scope) -> PathBuf {
    match scope {
        Scope::User => BaseDirs::new()
            .map(|base| base.data_local_dir().join("planforge"))
            .unwrap_or_else(|| PathBuf::from(".planforge").join("data")),
        Scope::Project(path) => project_config_dir(path).join("data"),
    }
}

pub fn settings_path(scope: &Scope) -> PathBuf {
    config_dir(scope).join(SETTINGS_FILE)
}

fn settings_candidates(scope: &Scope) -> Vec<PathBuf> {
    let dir = config_dir(scope);
    vec![dir.join(SETTINGS_FILE), dir.join("planforge.yml")]
}

fn config_dir(scope: &Scope) -> PathBuf {
    match scope {
        Scope::User => user_config_dir(),
        Scope::Project(path) => project_config_dir(path),
    }
}
