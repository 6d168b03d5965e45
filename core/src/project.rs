use crate::versions::Version;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Seek, Write};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Files whose name starts with this prefix are kept out of user-facing listings.
pub const HIDDEN_PREFIX: char = '.';

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectFile {
    pub name: String,
    pub content: String,
    pub language: String,
}

impl ProjectFile {
    pub fn new(
        name: impl Into<String>,
        language: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            language: language.into(),
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.name.starts_with(HIDDEN_PREFIX)
    }

    /// Suggested file name for a single-file download: the final path segment.
    pub fn download_name(&self) -> String {
        self.name
            .rsplit(['/', '\\'])
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("file")
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Generating,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub status: ProjectStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<ProjectFile>,
    #[serde(default)]
    pub versions: Vec<Version>,
    #[serde(default)]
    pub active_version_id: Option<Uuid>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: ProjectStatus::Active,
            description: "New empty project".to_string(),
            created_at: Utc::now(),
            files: Vec::new(),
            versions: Vec::new(),
            active_version_id: None,
        }
    }

    pub fn file(&self, name: &str) -> Option<&ProjectFile> {
        self.files.iter().find(|file| file.name == name)
    }

    pub fn visible_files(&self) -> impl Iterator<Item = &ProjectFile> {
        self.files.iter().filter(|file| !file.is_hidden())
    }

    /// One `- name (language)` line per visible file, or `None` for a fresh project.
    pub fn file_summary(&self) -> Option<String> {
        let lines: Vec<String> = self
            .visible_files()
            .map(|file| format!("- {} ({})", file.name, file.language))
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    /// Writes every visible file into a zip archive rooted at the project name.
    pub fn export_zip<W: Write + Seek>(&self, writer: W) -> Result<()> {
        let root_name = self.name.trim();
        if root_name.is_empty() {
            return Err(anyhow!("project name cannot be empty"));
        }
        let root = normalize_relative_path(root_name)
            .ok()
            .filter(|root| root.components().count() == 1)
            .ok_or_else(|| anyhow!("project name {root_name:?} is not a valid archive root"))?;
        let mut zip = ZipWriter::new(writer);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.add_directory(format!("{}/", root.to_string_lossy()), options)?;

        for file in self.visible_files() {
            let relative = normalize_relative_path(&file.name)
                .with_context(|| format!("cannot archive {}", file.name))?;
            let entry = root.join(relative);
            zip.start_file(entry.to_string_lossy().replace('\\', "/"), options)?;
            zip.write_all(file.content.as_bytes())?;
        }

        zip.finish()?;
        Ok(())
    }
}

fn normalize_relative_path(relative: &str) -> Result<PathBuf> {
    let mut result = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => result.push(part),
            Component::ParentDir => {
                if !result.pop() {
                    return Err(anyhow!("file path escapes project root"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("file paths must be relative"));
            }
        }
    }
    if result.as_os_str().is_empty() {
        return Err(anyhow!("file path is empty"));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};
    use zip::ZipArchive;

    #[test]
    fn download_name_uses_final_segment() {
        let file = ProjectFile::new("src/agents/router.py", "python", "");
        assert_eq!(file.download_name(), "router.py");
        let trailing = ProjectFile::new("docs/", "text", "");
        assert_eq!(trailing.download_name(), "file");
    }

    #[test]
    fn summary_skips_hidden_files() {
        let mut project = Project::new("demo");
        assert!(project.file_summary().is_none());
        project.files.push(ProjectFile::new(".conversation_history", "text", "x"));
        assert!(project.file_summary().is_none());
        project.files.push(ProjectFile::new("main.py", "python", "print(1)"));
        assert_eq!(project.file_summary().as_deref(), Some("- main.py (python)"));
    }

    #[test]
    fn export_writes_visible_files_only() {
        let mut project = Project::new("demo");
        project.files.push(ProjectFile::new("main.py", "python", "print(1)"));
        project.files.push(ProjectFile::new("config/ai_models.yml", "yaml", "a: 1"));
        project.files.push(ProjectFile::new(".conversation_history", "text", "USER: hi"));

        let mut buffer = Cursor::new(Vec::new());
        project.export_zip(&mut buffer).expect("export");

        let mut archive = ZipArchive::new(Cursor::new(buffer.into_inner())).expect("archive");
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["demo/", "demo/config/ai_models.yml", "demo/main.py"]
        );

        let mut content = String::new();
        archive
            .by_name("demo/main.py")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "print(1)");
    }

    #[test]
    fn export_rejects_escaping_paths() {
        let mut project = Project::new("demo");
        project.files.push(ProjectFile::new("a/../../x.txt", "text", "nope"));
        let err = project.export_zip(Cursor::new(Vec::new())).unwrap_err();
        assert!(format!("{err:#}").contains("escapes project root"));

        let mut absolute = Project::new("demo");
        absolute.files.push(ProjectFile::new("/abs.txt", "text", "nope"));
        let err = absolute.export_zip(Cursor::new(Vec::new())).unwrap_err();
        assert!(format!("{err:#}").contains("must be relative"));
    }

    #[test]
    fn export_collapses_inner_parent_segments() {
        let mut project = Project::new("demo");
        project.files.push(ProjectFile::new("src/../lib.rs", "rust", "x"));
        let mut buffer = Cursor::new(Vec::new());
        project.export_zip(&mut buffer).expect("export");
        let archive = ZipArchive::new(Cursor::new(buffer.into_inner())).expect("archive");
        assert!(archive.file_names().any(|name| name == "demo/lib.rs"));
    }

    #[test]
    fn export_rejects_project_names_that_leave_the_archive_root() {
        for name in ["../../evil", "nested/name", "/abs", ".."] {
            let mut project = Project::new(name);
            project.files.push(ProjectFile::new("main.py", "python", "x"));
            let err = project.export_zip(Cursor::new(Vec::new())).unwrap_err();
            assert!(
                err.to_string().contains("not a valid archive root"),
                "{name}: {err}"
            );
        }

        let mut plain = Project::new("./demo");
        plain.files.push(ProjectFile::new("main.py", "python", "x"));
        let mut buffer = Cursor::new(Vec::new());
        plain.export_zip(&mut buffer).expect("export");
        let archive = ZipArchive::new(Cursor::new(buffer.into_inner())).expect("archive");
        assert!(archive.file_names().any(|name| name == "demo/main.py"));
    }
}
