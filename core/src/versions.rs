use crate::project::{Project, ProjectFile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable snapshot of a project's file set.
///
/// `files` is an owned copy taken at commit time; later edits to the live
/// project never reach it, and reverting hands out a fresh copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Version {
    pub id: Uuid,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    files: Vec<ProjectFile>,
}

impl Version {
    fn snapshot(message: String, files: &[ProjectFile]) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            timestamp: Utc::now(),
            files: files.to_vec(),
        }
    }

    pub fn files(&self) -> &[ProjectFile] {
        &self.files
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum VersionError {
    #[error("version message cannot be empty")]
    EmptyMessage,
    #[error("version {0} not found")]
    NotFound(Uuid),
}

impl Project {
    /// Records the current file set as a new version and marks it active.
    pub fn commit(&mut self, message: &str) -> Result<&Version, VersionError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(VersionError::EmptyMessage);
        }
        let version = Version::snapshot(message.to_string(), &self.files);
        self.active_version_id = Some(version.id);
        self.versions.push(version);
        Ok(&self.versions[self.versions.len() - 1])
    }

    /// Replaces the live files with a copy of `version_id`. History is left as is.
    pub fn revert(&mut self, version_id: Uuid) -> Result<(), VersionError> {
        let target = self
            .versions
            .iter()
            .find(|version| version.id == version_id)
            .ok_or(VersionError::NotFound(version_id))?;
        self.files = target.files.clone();
        self.active_version_id = Some(version_id);
        Ok(())
    }

    /// Drops a version record. The live files and the active pointer are untouched,
    /// so the pointer may name a version that no longer exists.
    pub fn delete_version(&mut self, version_id: Uuid) -> Result<Version, VersionError> {
        let position = self
            .versions
            .iter()
            .position(|version| version.id == version_id)
            .ok_or(VersionError::NotFound(version_id))?;
        Ok(self.versions.remove(position))
    }

    pub fn version(&self, version_id: Uuid) -> Option<&Version> {
        self.versions.iter().find(|version| version.id == version_id)
    }

    pub fn versions_newest_first(&self) -> impl Iterator<Item = &Version> {
        self.versions.iter().rev()
    }

    pub fn active_version(&self) -> Option<&Version> {
        self.active_version_id.and_then(|id| self.version(id))
    }
}
