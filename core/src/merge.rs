use crate::project::ProjectFile;
use chrono::{DateTime, SecondsFormat, Utc};

/// Hidden file that accumulates the user side of every generation turn.
pub const CONVERSATION_HISTORY_FILE: &str = ".conversation_history";
const HISTORY_LANGUAGE: &str = "text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub files: Vec<ProjectFile>,
    /// Number of files extracted this turn; zero means the turn was conversation only.
    pub extracted: usize,
}

/// Folds freshly extracted files into `current` and appends `intent` to the
/// conversation history.
///
/// Extracted files overwrite same-named files in place and new ones are
/// appended. Files absent from the extraction are kept unchanged.
pub fn merge_generation(
    current: &[ProjectFile],
    extracted: Vec<ProjectFile>,
    intent: &str,
    at: DateTime<Utc>,
) -> MergeOutcome {
    let extracted_count = extracted.len();
    let mut files = current.to_vec();
    for file in extracted {
        upsert(&mut files, file);
    }

    let mut history = files
        .iter()
        .find(|file| file.name == CONVERSATION_HISTORY_FILE)
        .map(|file| file.content.clone())
        .unwrap_or_default();
    history.push_str(&history_entry(intent, at));
    upsert(
        &mut files,
        ProjectFile::new(CONVERSATION_HISTORY_FILE, HISTORY_LANGUAGE, history),
    );

    MergeOutcome {
        files,
        extracted: extracted_count,
    }
}

fn upsert(files: &mut Vec<ProjectFile>, file: ProjectFile) {
    match files.iter_mut().find(|existing| existing.name == file.name) {
        Some(existing) => *existing = file,
        None => files.push(file),
    }
}

fn history_entry(intent: &str, at: DateTime<Utc>) -> String {
    format!(
        "\n\n--- {} ---\nUSER: {}\n",
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        intent
    )
}
