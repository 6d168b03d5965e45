use crate::config::{data_dir, load_runtime_settings, Scope};
use crate::render;
use anyhow::{anyhow, bail, Context, Result};
use clap::Subcommand;
use parking_lot::RwLock;
use planforge_core::config::{Channel, ChannelUpdate, ConfigRegistry, ModelUpdate};
use planforge_core::connectivity::{ConnectivityMonitor, ProbePolicy};
use planforge_core::llm::{LlmDriver, LlmProviderKind};
use planforge_core::settings::RuntimeSettings;
use planforge_core::store::{FileStore, KeyValueStore};
use planforge_core::{AppState, CancellationToken, WorkspaceError};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const TRANSCRIPT_FILE: &str = "plan.md";

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List projects; the active one is starred.
    Projects,
    /// Create a project and make it active.
    New {
        #[arg(long)]
        name: Option<String>,
    },
    Rename {
        project: String,
        name: String,
    },
    Delete {
        project: String,
    },
    Select {
        project: String,
    },
    /// Stream a generation turn into a project.
    Generate {
        project: String,
        #[arg(required = true, num_args = 1..)]
        intent: Vec<String>,
    },
    Files {
        project: String,
        /// Include hidden files such as the conversation history.
        #[arg(long)]
        all: bool,
    },
    Show {
        project: String,
        file: String,
    },
    Commit {
        project: String,
        #[arg(short, long)]
        message: String,
    },
    Versions {
        project: String,
    },
    Revert {
        project: String,
        version: String,
    },
    DropVersion {
        project: String,
        version: String,
    },
    /// Write visible files to a zip archive.
    Export {
        project: String,
        out: PathBuf,
    },
    /// Save one file under its final path segment.
    Download {
        project: String,
        file: String,
        dir: PathBuf,
    },
    /// Save the raw markdown of the last turn as plan.md.
    Transcript {
        project: String,
        dir: PathBuf,
    },
    Probe {
        #[arg(long)]
        force: bool,
    },
    /// Poll connectivity in the background and print status changes.
    Monitor {
        #[arg(long)]
        interval_secs: Option<u64>,
        /// Stop after this many completed checks.
        #[arg(long)]
        checks: Option<usize>,
    },
    Models,
    SetPrimary {
        config: String,
        model: String,
    },
    AddChannel {
        /// google, openai, compatible or openrouter.
        channel: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        model_id: Option<String>,
        #[arg(long, default_value = "Default")]
        model_name: String,
        /// JSON object merged into every request body.
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        primary: bool,
    },
    RemoveChannel {
        config: String,
    },
}

pub struct Shell {
    store: Arc<dyn KeyValueStore>,
    settings: RuntimeSettings,
    state: AppState,
    monitor: Arc<ConnectivityMonitor>,
}

impl Shell {
    pub async fn open(scope: &Scope, kind: LlmProviderKind) -> Result<Self> {
        let settings = load_runtime_settings(scope).await?;
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(data_dir(scope))?);
        let configs = Arc::new(RwLock::new(ConfigRegistry::load(store.as_ref())?));
        let driver = LlmDriver::from_settings(kind, configs, &settings)?;
        Self::with_driver(store, settings, driver)
    }

    pub fn with_driver(
        store: Arc<dyn KeyValueStore>,
        settings: RuntimeSettings,
        driver: LlmDriver,
    ) -> Result<Self> {
        let state = AppState::with_store(Arc::clone(&store), driver.clone())?;
        let monitor = Arc::new(ConnectivityMonitor::with_system_clock(
            Arc::new(driver),
            ProbePolicy::from(&settings.network),
        ));
        Ok(Self {
            store,
            settings,
            state,
            monitor,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run(&self, command: Command, out: &mut (dyn Write + Send)) -> Result<()> {
        let log_start = self.state.logs().len();
        let result = self.dispatch(command, out).await;
        for entry in self.state.logs_since(log_start) {
            writeln!(out, "{}", render::log_entry(&entry))?;
        }
        result
    }

    async fn dispatch(&self, command: Command, out: &mut (dyn Write + Send)) -> Result<()> {
        match command {
            Command::Projects => {
                let active = self.state.active_project().map(|project| project.id);
                write!(out, "{}", render::project_table(&self.state.projects(), active))?;
            }
            Command::New { name } => {
                if name.as_deref().is_some_and(|name| name.trim().is_empty()) {
                    return Err(WorkspaceError::EmptyName.into());
                }
                let project = self.state.new_project();
                if let Some(name) = name {
                    self.state.rename_project(project.id, &name)?;
                }
                writeln!(out, "{}", project.id)?;
            }
            Command::Rename { project, name } => {
                let id = self.resolve_project(&project)?;
                self.state.rename_project(id, &name)?;
            }
            Command::Delete { project } => {
                let id = self.resolve_project(&project)?;
                self.state.delete_project(id)?;
            }
            Command::Select { project } => {
                let id = self.resolve_project(&project)?;
                self.state.select_project(id)?;
            }
            Command::Generate { project, intent } => {
                let id = self.resolve_project(&project)?;
                self.generate(id, &intent.join(" "), out).await?;
            }
            Command::Files { project, all } => {
                let project = self.project(&project)?;
                write!(out, "{}", render::file_listing(&project, all))?;
            }
            Command::Show { project, file } => {
                let project = self.project(&project)?;
                let file = project
                    .file(&file)
                    .ok_or_else(|| anyhow!("{} has no file named {file}", project.name))?;
                writeln!(out, "{}", file.content)?;
            }
            Command::Commit { project, message } => {
                let id = self.resolve_project(&project)?;
                let version = self.state.commit(id, &message)?;
                writeln!(out, "{}", version.id)?;
            }
            Command::Versions { project } => {
                let project = self.project(&project)?;
                write!(out, "{}", render::version_listing(&project))?;
            }
            Command::Revert { project, version } => {
                let id = self.resolve_project(&project)?;
                let version = self.resolve_version(id, &version)?;
                self.state.revert(id, version)?;
            }
            Command::DropVersion { project, version } => {
                let id = self.resolve_project(&project)?;
                let version = self.resolve_version(id, &version)?;
                self.state.delete_version(id, version)?;
            }
            Command::Export { project, out: path } => {
                let id = self.resolve_project(&project)?;
                let file = File::create(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                self.state.export_project(id, file)?;
                writeln!(out, "Exported to {}", path.display())?;
            }
            Command::Download { project, file, dir } => {
                let project = self.project(&project)?;
                let file = project
                    .file(&file)
                    .ok_or_else(|| anyhow!("{} has no file named {file}", project.name))?;
                let path = write_into(&dir, &file.download_name(), &file.content)?;
                writeln!(out, "Saved {}", path.display())?;
            }
            Command::Transcript { project, dir } => {
                let id = self.resolve_project(&project)?;
                let content = self
                    .state
                    .last_output(id)
                    .ok_or_else(|| anyhow!("no generated content for this project yet"))?;
                let path = write_into(&dir, TRANSCRIPT_FILE, &content)?;
                writeln!(out, "Saved {}", path.display())?;
            }
            Command::Probe { force } => {
                let report = self.state.test_connectivity(&self.monitor, force).await;
                writeln!(out, "{}", render::report(&report))?;
            }
            Command::Monitor {
                interval_secs,
                checks,
            } => {
                let interval = interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.settings.network.poll_interval());
                self.watch(interval, checks, out).await?;
            }
            Command::Models => {
                let configs = self.state.llm().configs().read().configs().to_vec();
                write!(out, "{}", render::model_listing(&configs))?;
            }
            Command::SetPrimary { config, model } => {
                self.update_configs(|registry| registry.set_primary(&config, &model))?;
            }
            Command::AddChannel {
                channel,
                api_key,
                base_url,
                model_id,
                model_name,
                params,
                primary,
            } => {
                let channel = Channel::parse(&channel)
                    .ok_or_else(|| anyhow!("unknown channel {channel:?}"))?;
                let config_id = self.update_configs(|registry| {
                    let (config_id, model) = {
                        let config = registry.add_channel(channel);
                        (config.id.clone(), config.models[0].id.clone())
                    };
                    registry.update_channel(
                        &config_id,
                        ChannelUpdate {
                            api_key,
                            base_url: base_url.map(Some),
                            ..ChannelUpdate::default()
                        },
                    )?;
                    registry.update_model(
                        &config_id,
                        &model,
                        ModelUpdate {
                            name: Some(model_name),
                            model_id,
                            custom_params: params.map(Some),
                            ..ModelUpdate::default()
                        },
                    )?;
                    if primary {
                        registry.set_primary(&config_id, &model)?;
                    }
                    Ok(config_id)
                })?;
                writeln!(out, "{config_id}")?;
            }
            Command::RemoveChannel { config } => {
                self.update_configs(|registry| registry.remove_channel(&config).map(|_| ()))?;
            }
        }
        Ok(())
    }

    async fn generate(&self, id: Uuid, intent: &str, out: &mut (dyn Write + Send)) -> Result<()> {
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let outcome = self
            .state
            .run_generation(id, intent, &cancel, &mut |delta: &str| {
                // Output is best effort; a closed pipe must not abort the turn.
                let _ = out.write_all(delta.as_bytes());
                let _ = out.flush();
            })
            .await;
        watcher.abort();

        let report = outcome?;
        writeln!(out)?;
        if report.cancelled {
            writeln!(out, "Cancelled; project left unchanged.")?;
        } else {
            writeln!(out, "Extracted {} file(s).", report.extracted_files)?;
        }
        Ok(())
    }

    async fn watch(
        &self,
        interval: Duration,
        checks: Option<usize>,
        out: &mut (dyn Write + Send),
    ) -> Result<()> {
        let poller = self.monitor.spawn_polling(interval);
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        let mut last_status = None;
        let mut last_check = None;
        let mut completed = 0usize;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {}
            }
            let check = self.monitor.last_check();
            if check.is_some() && check != last_check {
                last_check = check;
                completed += 1;
                if let Some(report) = self.monitor.last_report() {
                    self.state.record_connectivity(&report);
                }
            }
            let status = self.monitor.status();
            if last_status != Some(status) {
                last_status = Some(status);
                let detail = self
                    .monitor
                    .last_report()
                    .map(|report| render::report(&report))
                    .unwrap_or_default();
                writeln!(
                    out,
                    "{} {:<8} {detail}",
                    chrono::Local::now().format("%H:%M:%S"),
                    render::health_label(status)
                )?;
            }
            if checks.is_some_and(|limit| completed >= limit) {
                break;
            }
        }
        poller.abort();
        Ok(())
    }

    fn update_configs<T>(
        &self,
        change: impl FnOnce(&mut ConfigRegistry) -> Result<T, planforge_core::config::ConfigError>,
    ) -> Result<T> {
        let configs = self.state.llm().configs();
        let mut registry = configs.write();
        let value = change(&mut registry)?;
        registry.save(self.store.as_ref())?;
        Ok(value)
    }

    fn project(&self, reference: &str) -> Result<planforge_core::Project> {
        let id = self.resolve_project(reference)?;
        self.state
            .project(id)
            .ok_or_else(|| WorkspaceError::ProjectNotFound(id).into())
    }

    /// Accepts a full id, a unique id prefix or an exact project name.
    fn resolve_project(&self, reference: &str) -> Result<Uuid> {
        let projects = self.state.projects();
        let candidates: Vec<(Uuid, String)> = projects
            .iter()
            .map(|project| (project.id, project.name.clone()))
            .collect();
        resolve_reference(reference, &candidates, "project")
    }

    fn resolve_version(&self, project: Uuid, reference: &str) -> Result<Uuid> {
        let project = self
            .state
            .project(project)
            .ok_or(WorkspaceError::ProjectNotFound(project))?;
        let candidates: Vec<(Uuid, String)> = project
            .versions
            .iter()
            .map(|version| (version.id, version.message.clone()))
            .collect();
        resolve_reference(reference, &candidates, "version")
    }
}

fn resolve_reference(reference: &str, candidates: &[(Uuid, String)], what: &str) -> Result<Uuid> {
    let reference = reference.trim();
    if let Ok(id) = Uuid::parse_str(reference) {
        if candidates.iter().any(|(candidate, _)| *candidate == id) {
            return Ok(id);
        }
        bail!("no {what} with id {id}");
    }

    let by_name: Vec<Uuid> = candidates
        .iter()
        .filter(|(_, name)| name == reference)
        .map(|(id, _)| *id)
        .collect();
    if let [id] = by_name.as_slice() {
        return Ok(*id);
    }

    let needle = reference.to_ascii_lowercase().replace('-', "");
    let by_prefix: Vec<Uuid> = if needle.len() >= 4 {
        candidates
            .iter()
            .filter(|(id, _)| id.simple().to_string().starts_with(&needle))
            .map(|(id, _)| *id)
            .collect()
    } else {
        Vec::new()
    };
    match by_prefix.as_slice() {
        [id] => Ok(*id),
        [] if by_name.len() > 1 => bail!("{what} name {reference:?} is ambiguous; use its id"),
        [] => bail!("no {what} matches {reference:?}"),
        _ => bail!("{what} id prefix {reference:?} is ambiguous"),
    }
}

fn write_into(dir: &Path, name: &str, content: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;
    let path = dir.join(name);
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
