use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub phase: Option<String>,
}

/// Append-only operational trail shown to the user. Entries are mirrored to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: Vec<LogEntry>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
        phase: Option<&str>,
    ) -> &LogEntry {
        let entry = LogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
            phase: phase.map(str::to_owned),
        };
        let phase = entry.phase.as_deref().unwrap_or("-");
        match level {
            LogLevel::Error => tracing::error!(phase, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(phase, "{}", entry.message),
            LogLevel::Info | LogLevel::Success | LogLevel::System => {
                tracing::info!(phase, level = ?level, "{}", entry.message)
            }
        }
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn since(&self, index: usize) -> &[LogEntry] {
        self.entries.get(index..).unwrap_or(&[])
    }
}
