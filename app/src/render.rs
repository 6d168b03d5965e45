use planforge_core::activity::{LogEntry, LogLevel};
use planforge_core::config::AiConfig;
use planforge_core::connectivity::HealthStatus;
use planforge_core::llm::ConnectivityReport;
use planforge_core::project::{Project, ProjectStatus};
use std::fmt::Write as _;
use uuid::Uuid;

pub fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

fn status_label(status: ProjectStatus) -> &'static str {
    match status {
        ProjectStatus::Active => "active",
        ProjectStatus::Generating => "generating",
        ProjectStatus::Completed => "completed",
        ProjectStatus::Error => "error",
    }
}

pub fn health_label(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Checking => "CHECKING",
        HealthStatus::Online => "ONLINE",
        HealthStatus::Offline => "OFFLINE",
    }
}

pub fn project_table(projects: &[Project], active: Option<Uuid>) -> String {
    if projects.is_empty() {
        return "No projects yet. Create one with `planforge new`.\n".to_string();
    }
    let mut out = String::new();
    for project in projects {
        let marker = if Some(project.id) == active { '*' } else { ' ' };
        let _ = writeln!(
            out,
            "{marker} {}  {:<24} {:<10} {:>3} files  {}",
            short_id(project.id),
            project.name,
            status_label(project.status),
            project.visible_files().count(),
            project.description
        );
    }
    out
}

pub fn file_listing(project: &Project, include_hidden: bool) -> String {
    let files: Vec<_> = project
        .files
        .iter()
        .filter(|file| include_hidden || !file.is_hidden())
        .collect();
    if files.is_empty() {
        return format!("{} has no files.\n", project.name);
    }
    let mut out = String::new();
    for file in files {
        let _ = writeln!(
            out,
            "{:<40} {:<12} {:>5} lines",
            file.name,
            file.language,
            file.content.lines().count()
        );
    }
    out
}

pub fn version_listing(project: &Project) -> String {
    if project.versions.is_empty() {
        return format!("{} has no versions.\n", project.name);
    }
    let mut out = String::new();
    for version in project.versions_newest_first() {
        let marker = if Some(version.id) == project.active_version_id {
            '*'
        } else {
            ' '
        };
        let _ = writeln!(
            out,
            "{marker} {}  {}  {:>3} files  {}",
            short_id(version.id),
            version.timestamp.format("%Y-%m-%d %H:%M:%S"),
            version.files().len(),
            version.message
        );
    }
    out
}

pub fn model_listing(configs: &[AiConfig]) -> String {
    let mut out = String::new();
    for config in configs {
        let kind = if config.is_internal {
            "internal".to_string()
        } else {
            config.channel.to_string()
        };
        let _ = writeln!(out, "{} [{}]", config.id, kind);
        if let Some(base_url) = &config.base_url {
            let _ = writeln!(out, "    base url: {base_url}");
        }
        for model in &config.models {
            let marker = if model.is_primary { '*' } else { ' ' };
            let model_id = if model.model_id.is_empty() {
                "<unset>"
            } else {
                model.model_id.as_str()
            };
            let _ = writeln!(out, "  {marker} {}  {}  ({})", model.id, model_id, model.name);
        }
    }
    out
}

pub fn report(report: &ConnectivityReport) -> String {
    let channel = report.channel.as_deref().unwrap_or("-");
    if report.success {
        format!(
            "ONLINE  {channel}  model={}  latency={}ms  {}",
            report.model_id.as_deref().unwrap_or("-"),
            report.latency_ms.unwrap_or_default(),
            report.message
        )
    } else {
        let reason = report.failure.map(|kind| kind.as_str()).unwrap_or("unknown");
        format!("OFFLINE {channel}  reason={reason}  {}", report.message)
    }
}

pub fn log_entry(entry: &LogEntry) -> String {
    let level = match entry.level {
        LogLevel::Info => "INFO",
        LogLevel::Warn => "WARN",
        LogLevel::Error => "ERROR",
        LogLevel::Success => "OK",
        LogLevel::System => "SYS",
    };
    match &entry.phase {
        Some(phase) => format!("[{level}] {phase}: {}", entry.message),
        None => format!("[{level}] {}", entry.message),
    }
}
