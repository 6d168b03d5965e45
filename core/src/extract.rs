//! Recovers named files from a markdown document written in the planner's
//! file convention:
//!
//! ````text
//! **File: path/to/file.ext**
//! ```language
//! <content>
//! ```
//! ````
//!
//! The parser is pure and works on partial documents: a marker whose fenced
//! block has not been closed yet is ignored until a later call sees the rest.

use crate::project::ProjectFile;

/// Revision of the document grammar accepted by [`extract_files`].
pub const GRAMMAR_VERSION: u32 = 1;

const FILE_MARKER: &str = "**File:";
const BOLD: &str = "**";
const FENCE: char = '`';
const MIN_FENCE: usize = 3;

/// Extracts every complete file block from `markdown`.
///
/// Files come back in the order their path first appears; when a path is
/// defined more than once, the last definition supplies the content.
pub fn extract_files(markdown: &str) -> Vec<ProjectFile> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut files: Vec<ProjectFile> = Vec::new();
    let mut index = 0;

    while index < lines.len() {
        let Some(path) = marker_path(lines[index]) else {
            index += 1;
            continue;
        };
        match parse_block(&lines, index + 1) {
            Some(block) => {
                let file = ProjectFile::new(path, block.language, block.content);
                match files.iter_mut().find(|existing| existing.name == file.name) {
                    Some(existing) => *existing = file,
                    None => files.push(file),
                }
                index = block.next_line;
            }
            None => index += 1,
        }
    }

    files
}

struct Block {
    language: String,
    content: String,
    next_line: usize,
}

fn marker_path(line: &str) -> Option<String> {
    let start = line.find(FILE_MARKER)? + FILE_MARKER.len();
    let rest = &line[start..];
    let end = rest.find(BOLD)?;
    let path = rest[..end].trim();
    if path.is_empty() || path.contains('*') {
        return None;
    }
    Some(path.to_string())
}

/// Parses the fenced block that must follow a marker, allowing blank lines in between.
fn parse_block(lines: &[&str], from: usize) -> Option<Block> {
    let mut cursor = from;
    while cursor < lines.len() && lines[cursor].trim().is_empty() {
        cursor += 1;
    }
    let (fence_len, info) = fence(lines.get(cursor)?)?;
    let language = info.split_whitespace().next()?.to_string();

    let body_start = cursor + 1;
    let mut depth = 0usize;
    for (offset, line) in lines[body_start..].iter().enumerate() {
        let Some((len, inner_info)) = fence(line) else {
            continue;
        };
        if len < fence_len {
            continue;
        }
        if fence_len > MIN_FENCE {
            // A longer outer fence only closes on a bare run of at least the same length.
            if inner_info.is_empty() {
                return Some(block(lines, body_start, body_start + offset, language));
            }
            continue;
        }
        if !inner_info.is_empty() {
            depth += 1;
        } else if depth > 0 {
            depth -= 1;
        } else {
            return Some(block(lines, body_start, body_start + offset, language));
        }
    }
    None
}

fn block(lines: &[&str], start: usize, end: usize, language: String) -> Block {
    Block {
        language,
        content: lines[start..end].join("\n"),
        next_line: end + 1,
    }
}

/// Returns the backtick count and trimmed info string of a fence line.
fn fence(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let len = trimmed.chars().take_while(|ch| *ch == FENCE).count();
    if len < MIN_FENCE {
        return None;
    }
    let info = trimmed[len..].trim();
    if info.contains(FENCE) {
        return None;
    }
    Some((len, info))
}
