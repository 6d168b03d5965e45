use crate::activity::{ActivityLog, LogEntry, LogLevel};
use crate::cancel::CancellationToken;
use crate::connectivity::ConnectivityMonitor;
use crate::extract::{extract_files, GRAMMAR_VERSION};
use crate::llm::{ConnectivityReport, GatewayError, LlmDriver, StreamEnd};
use crate::merge::merge_generation;
use crate::project::{Project, ProjectStatus};
use crate::store::{load_json, save_json, KeyValueStore, MemoryStore};
use crate::versions::{Version, VersionError};
use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Seek, Write};
use std::sync::Arc;
use uuid::Uuid;

pub const PROJECTS_STORAGE_KEY: &str = "planforge_projects_v1";
const DESCRIPTION_LIMIT: usize = 50;
const INTAKE_PREVIEW: usize = 40;

#[derive(thiserror::Error, Debug)]
pub enum WorkspaceError {
    #[error("project {0} not found")]
    ProjectNotFound(Uuid),
    #[error("a generation is already running for project {0}")]
    GenerationInProgress(Uuid),
    #[error("request text cannot be empty")]
    EmptyIntent,
    #[error("project name cannot be empty")]
    EmptyName,
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Outcome of one generation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    /// Everything the model streamed, in order.
    pub content: String,
    pub extracted_files: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedWorkspace {
    #[serde(default)]
    active_project: Option<Uuid>,
    #[serde(default)]
    projects: Vec<Project>,
    /// Raw markdown of each project's latest completed turn.
    #[serde(default)]
    last_output: HashMap<Uuid, String>,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<InnerState>>,
    store: Arc<dyn KeyValueStore>,
    llm: LlmDriver,
}

#[derive(Default)]
struct InnerState {
    projects: Vec<Project>,
    active_project: Option<Uuid>,
    log: ActivityLog,
    generating: HashSet<Uuid>,
    last_output: HashMap<Uuid, String>,
}

impl InnerState {
    fn project_mut(&mut self, id: Uuid) -> Result<&mut Project, WorkspaceError> {
        self.projects
            .iter_mut()
            .find(|project| project.id == id)
            .ok_or(WorkspaceError::ProjectNotFound(id))
    }
}

impl AppState {
    /// Workspace that lives only in memory.
    pub fn new(llm: LlmDriver) -> Self {
        Self::from_parts(Arc::new(MemoryStore::new()), llm, PersistedWorkspace::default())
    }

    pub fn with_store(store: Arc<dyn KeyValueStore>, llm: LlmDriver) -> Result<Self> {
        let persisted: PersistedWorkspace =
            load_json(store.as_ref(), PROJECTS_STORAGE_KEY)?.unwrap_or_default();
        Ok(Self::from_parts(store, llm, persisted))
    }

    fn from_parts(
        store: Arc<dyn KeyValueStore>,
        llm: LlmDriver,
        persisted: PersistedWorkspace,
    ) -> Self {
        let mut projects = persisted.projects;
        for project in &mut projects {
            // A turn interrupted by shutdown never finished.
            if project.status == ProjectStatus::Generating {
                project.status = ProjectStatus::Active;
            }
        }
        let active_project = persisted
            .active_project
            .filter(|id| projects.iter().any(|project| project.id == *id));
        let mut last_output = persisted.last_output;
        last_output.retain(|id, _| projects.iter().any(|project| project.id == *id));
        Self {
            inner: Arc::new(RwLock::new(InnerState {
                projects,
                active_project,
                last_output,
                ..InnerState::default()
            })),
            store,
            llm,
        }
    }

    pub fn llm(&self) -> &LlmDriver {
        &self.llm
    }

    pub fn projects(&self) -> Vec<Project> {
        self.inner.read().projects.clone()
    }

    pub fn project(&self, id: Uuid) -> Option<Project> {
        self.inner
            .read()
            .projects
            .iter()
            .find(|project| project.id == id)
            .cloned()
    }

    pub fn active_project(&self) -> Option<Project> {
        let inner = self.inner.read();
        let id = inner.active_project?;
        inner.projects.iter().find(|project| project.id == id).cloned()
    }

    pub fn is_generating(&self, id: Uuid) -> bool {
        self.inner.read().generating.contains(&id)
    }

    /// Raw markdown of the latest completed turn for `id`.
    pub fn last_output(&self, id: Uuid) -> Option<String> {
        self.inner.read().last_output.get(&id).cloned()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.read().log.entries().to_vec()
    }

    pub fn logs_since(&self, index: usize) -> Vec<LogEntry> {
        self.inner.read().log.since(index).to_vec()
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, phase: Option<&str>) {
        self.inner.write().log.push(level, message, phase);
    }

    pub fn new_project(&self) -> Project {
        let mut inner = self.inner.write();
        let project = Project::new(format!("Untitled-Project-{}", inner.projects.len() + 1));
        inner.projects.insert(0, project.clone());
        inner.active_project = Some(project.id);
        inner.log.push(
            LogLevel::Info,
            format!("Created new project: {}", project.name),
            Some("System"),
        );
        self.persist(&inner);
        project
    }

    pub fn delete_project(&self, id: Uuid) -> Result<Project, WorkspaceError> {
        let mut inner = self.inner.write();
        let position = inner
            .projects
            .iter()
            .position(|project| project.id == id)
            .ok_or(WorkspaceError::ProjectNotFound(id))?;
        let removed = inner.projects.remove(position);
        if inner.active_project == Some(id) {
            inner.active_project = None;
        }
        inner.last_output.remove(&id);
        inner
            .log
            .push(LogLevel::Warn, format!("Deleted project {id}"), Some("System"));
        self.persist(&inner);
        Ok(removed)
    }

    pub fn rename_project(&self, id: Uuid, name: &str) -> Result<(), WorkspaceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WorkspaceError::EmptyName);
        }
        let mut inner = self.inner.write();
        inner.project_mut(id)?.name = name.to_string();
        inner.log.push(
            LogLevel::Info,
            format!("Renamed project to {name}"),
            Some("System"),
        );
        self.persist(&inner);
        Ok(())
    }

    pub fn select_project(&self, id: Uuid) -> Result<(), WorkspaceError> {
        let mut inner = self.inner.write();
        inner.project_mut(id)?;
        inner.active_project = Some(id);
        self.persist(&inner);
        Ok(())
    }

    pub fn commit(&self, id: Uuid, message: &str) -> Result<Version, WorkspaceError> {
        let mut inner = self.inner.write();
        let version = inner.project_mut(id)?.commit(message)?.clone();
        inner
            .log
            .push(LogLevel::Success, "Version committed successfully", Some("VCS"));
        self.persist(&inner);
        Ok(version)
    }

    pub fn revert(&self, id: Uuid, version_id: Uuid) -> Result<(), WorkspaceError> {
        let mut inner = self.inner.write();
        inner.project_mut(id)?.revert(version_id)?;
        inner
            .log
            .push(LogLevel::Warn, "Reverted to selected version", Some("VCS"));
        self.persist(&inner);
        Ok(())
    }

    pub fn delete_version(&self, id: Uuid, version_id: Uuid) -> Result<Version, WorkspaceError> {
        let mut inner = self.inner.write();
        let removed = inner.project_mut(id)?.delete_version(version_id)?;
        inner.log.push(
            LogLevel::Info,
            format!("Deleted version \"{}\"", removed.message),
            Some("VCS"),
        );
        self.persist(&inner);
        Ok(removed)
    }

    pub fn export_project<W: Write + Seek>(&self, id: Uuid, writer: W) -> Result<()> {
        let project = self
            .project(id)
            .ok_or(WorkspaceError::ProjectNotFound(id))?;
        project.export_zip(writer)
    }

    /// Streams one generation turn for `project_id`, forwarding every delta to
    /// `on_delta`, then folds the extracted files into the project.
    pub async fn run_generation(
        &self,
        project_id: Uuid,
        intent: &str,
        cancel: &CancellationToken,
        on_delta: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<GenerationReport, WorkspaceError> {
        let intent = intent.trim();
        if intent.is_empty() {
            return Err(WorkspaceError::EmptyIntent);
        }

        let (prior_status, summary) = {
            let mut inner = self.inner.write();
            if inner.generating.contains(&project_id) {
                return Err(WorkspaceError::GenerationInProgress(project_id));
            }
            let project = inner.project_mut(project_id)?;
            let prior_status = project.status;
            let summary = project.file_summary();
            project.status = ProjectStatus::Generating;
            inner.generating.insert(project_id);
            inner.log.push(
                LogLevel::Info,
                format!("Initializing request: {}...", preview(intent, INTAKE_PREVIEW)),
                Some("Intake"),
            );
            (prior_status, summary)
        };
        let _guard = InFlight {
            inner: Arc::clone(&self.inner),
            project_id,
        };

        let mut content = String::new();
        let outcome = {
            let mut sink = |delta: &str| {
                content.push_str(delta);
                on_delta(delta);
            };
            self.llm
                .generate(intent, summary.as_deref(), cancel, &mut sink)
                .await
        };

        let mut inner = self.inner.write();
        let result = match outcome {
            Ok(StreamEnd::Cancelled) => {
                if let Ok(project) = inner.project_mut(project_id) {
                    project.status = prior_status;
                }
                inner
                    .log
                    .push(LogLevel::Warn, "Generation cancelled.", Some("Generator"));
                Ok(GenerationReport {
                    content,
                    extracted_files: 0,
                    cancelled: true,
                })
            }
            Ok(StreamEnd::Completed) if content.is_empty() => {
                if let Ok(project) = inner.project_mut(project_id) {
                    project.status = prior_status;
                }
                inner.log.push(
                    LogLevel::Warn,
                    "Model returned an empty response.",
                    Some("Generator"),
                );
                Ok(GenerationReport {
                    content,
                    extracted_files: 0,
                    cancelled: false,
                })
            }
            Ok(StreamEnd::Completed) => {
                let extracted = extract_files(&content);
                tracing::debug!(
                    project = %project_id,
                    grammar = GRAMMAR_VERSION,
                    files = extracted.len(),
                    "extracted file blocks"
                );
                match inner.project_mut(project_id) {
                    Ok(project) => {
                        let merged =
                            merge_generation(&project.files, extracted, intent, Utc::now());
                        let extracted_files = merged.extracted;
                        project.files = merged.files;
                        project.status = ProjectStatus::Completed;
                        project.description = describe(intent);
                        inner.last_output.insert(project_id, content.clone());
                        inner.log.push(
                            LogLevel::Success,
                            format!("Successfully generated {extracted_files} modules."),
                            Some("Generator"),
                        );
                        Ok(GenerationReport {
                            content,
                            extracted_files,
                            cancelled: false,
                        })
                    }
                    Err(err) => {
                        inner.log.push(
                            LogLevel::Warn,
                            "Project was deleted before generation finished; output discarded.",
                            Some("Generator"),
                        );
                        Err(err)
                    }
                }
            }
            Err(err) => {
                if let Ok(project) = inner.project_mut(project_id) {
                    project.status = ProjectStatus::Error;
                }
                inner
                    .log
                    .push(LogLevel::Error, format!("Error: {err}"), Some("System"));
                inner.log.push(
                    LogLevel::Warn,
                    "Try re-checking configuration with `planforge models`.",
                    Some("Fix"),
                );
                Err(WorkspaceError::Gateway(err))
            }
        };
        self.persist(&inner);
        result
    }

    /// Runs a connectivity check and records the outcome in the activity log.
    pub async fn test_connectivity(
        &self,
        monitor: &ConnectivityMonitor,
        force: bool,
    ) -> ConnectivityReport {
        self.log(
            LogLevel::System,
            "Testing AI Orchestrator connectivity...",
            Some("Network"),
        );
        let report = monitor.check(force).await;
        self.record_connectivity(&report);
        report
    }

    pub fn record_connectivity(&self, report: &ConnectivityReport) {
        let channel = report.channel.as_deref().unwrap_or("unknown channel");
        if report.success {
            let banner = format!(
                "╔══════════════════════════════════════════╗\n\
                 ║  API CONNECTION VERIFIED: ONLINE         ║\n\
                 ╚══════════════════════════════════════════╝\n\
                 CHANNEL : {channel}\n\
                 MODEL   : {}\n\
                 LATENCY : {}ms\n\
                 STATUS  : {}",
                report.model_id.as_deref().unwrap_or("-"),
                report.latency_ms.unwrap_or_default(),
                report.message,
            );
            self.log(LogLevel::Success, banner, Some("Verified"));
        } else {
            self.log(
                LogLevel::Error,
                format!(
                    "CRITICAL: Connection failed to {channel}.\nREASON: {}",
                    report.message
                ),
                Some("Failed"),
            );
        }
    }

    fn persist(&self, inner: &InnerState) {
        let snapshot = PersistedWorkspace {
            active_project: inner.active_project,
            projects: inner.projects.clone(),
            last_output: inner.last_output.clone(),
        };
        if let Err(err) = save_json(self.store.as_ref(), PROJECTS_STORAGE_KEY, &snapshot) {
            tracing::warn!(%err, "failed to persist workspace");
        }
    }
}

/// Clears the in-flight marker even when the generation future is dropped.
struct InFlight {
    inner: Arc<RwLock<InnerState>>,
    project_id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.write().generating.remove(&self.project_id);
    }
}

fn preview(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn describe(intent: &str) -> String {
    let mut description = preview(intent, DESCRIPTION_LIMIT);
    if intent.chars().count() > DESCRIPTION_LIMIT {
        description.push_str("...");
    }
    description
}
