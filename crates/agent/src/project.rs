//! In-memory project model and edit engine.
//!
//! A project is a `path -> content` map. Paths are POSIX-style and
//! project-relative; folders are implied by file paths and never tracked.
//! Edits mutate the map in place. The engine also renders the project into
//! the deterministic prompt format the model sees (sorted paths, `[n]`
//! line-number prefixes).

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

use crate::token::HistoryMessage;

pub type ProjectFiles = IndexMap<String, String>;

/// Arguments for a range-scoped find/replace edit.
#[derive(Debug, Clone, Deserialize)]
pub struct EditArgs {
    pub file_path: String,
    pub find: String,
    pub find_start_line: i64,
    pub find_end_line: i64,
    pub replace: String,
}

/// Successful edit: pre-image, post-image, and the full new file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub old_text: String,
    pub new_text: String,
    pub new_code: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("Line numbers out of range or invalid")]
    OutOfRange { total_lines: usize },
    #[error("Find text not found at specified lines")]
    FindNotInRange { existing_text: String },
}

/// Apply a range-scoped edit to a single file's content.
///
/// Lines are 1-based and inclusive. Only the first occurrence of `find`
/// inside the joined slice is replaced; content outside the slice is
/// byte-identical afterwards.
pub fn apply_edit(content: &str, args: &EditArgs) -> Result<EditOutcome, EditError> {
    let lines: Vec<&str> = content.split('\n').collect();
    // A trailing newline produces an empty final slot that is not an
    // addressable line; line counts follow splitlines semantics.
    let total_lines = if content.ends_with('\n') && lines.len() > 1 {
        lines.len() - 1
    } else {
        lines.len()
    };

    let start = args.find_start_line - 1;
    let end = args.find_end_line - 1;
    if start < 0 || end >= total_lines as i64 || start > end {
        return Err(EditError::OutOfRange { total_lines });
    }
    let (start, end) = (start as usize, end as usize);

    let existing_text = lines[start..=end].join("\n");
    if !existing_text.contains(&args.find) {
        return Err(EditError::FindNotInRange { existing_text });
    }

    let new_text = existing_text.replacen(&args.find, &args.replace, 1);
    let mut new_lines: Vec<&str> = Vec::with_capacity(total_lines);
    new_lines.extend(&lines[..start]);
    new_lines.extend(new_text.split('\n'));
    new_lines.extend(&lines[end + 1..]);
    let new_code = new_lines.join("\n");

    Ok(EditOutcome {
        old_text: existing_text,
        new_text,
        new_code,
    })
}

/// Remove every file at or under `folder_path`. Returns the removal count.
pub fn delete_folder(project: &mut ProjectFiles, folder_path: &str) -> usize {
    let normalized = folder_path.trim_end_matches('/');
    let prefix = format!("{normalized}/");
    let before = project.len();
    project.retain(|path, _| path != normalized && !path.starts_with(&prefix));
    before - project.len()
}

/// Rewrite every path under `old_path` to live under `new_path`, preserving
/// suffixes and contents. Returns the number of moved files.
pub fn rename_folder(project: &mut ProjectFiles, old_path: &str, new_path: &str) -> usize {
    let old_norm = old_path.trim_end_matches('/');
    let new_norm = new_path.trim_end_matches('/');
    let prefix = format!("{old_norm}/");

    let mut moved = 0;
    let mut next: ProjectFiles = IndexMap::with_capacity(project.len());
    for (path, content) in project.drain(..) {
        if path == old_norm || path.starts_with(&prefix) {
            let suffix = &path[old_norm.len()..];
            let new_file_path = format!("{new_norm}{suffix}");
            let new_file_path = new_file_path.trim_start_matches('/').to_string();
            next.insert(new_file_path, content);
            moved += 1;
        } else {
            next.insert(path, content);
        }
    }
    *project = next;
    moved
}

/// Render one file with `[n]` line-number prefixes for the prompt.
pub fn display_code_with_line_numbers(code: &str) -> String {
    code.split('\n')
        .enumerate()
        .map(|(i, line)| format!("[{}]{}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the project plus query into the single prompt string the model
/// receives. Paths are sorted and line separators are always `\n` so the
/// rendering is deterministic.
pub fn build_project_input(
    query: &str,
    project: &ProjectFiles,
    history: &[HistoryMessage],
) -> String {
    let mut prior_block = String::new();
    let lines: Vec<String> = history
        .iter()
        .filter(|m| !m.content.is_empty())
        .map(|m| format!("- {}: {}", m.role, m.content))
        .collect();
    if !lines.is_empty() {
        prior_block = format!(
            "\n---\nPrevious conversation (for context):\n{}\n",
            lines.join("\n")
        );
    }

    let mut paths: Vec<&String> = project.keys().collect();
    paths.sort();

    let file_list = paths
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let files_rendered = paths
        .iter()
        .map(|path| {
            format!(
                "FILE: {}\n{}",
                path,
                display_code_with_line_numbers(&project[path.as_str()])
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Project files (paths):\n{file_list}\n---\n\
         Project contents (with line numbers):\n{files_rendered}\n---\n\
         Query: {query}{prior_block}\n---\n\
         Guidance: When proposing edits, call the edit tool with the target \
         file_path, the line range, and your replacement text."
    )
}
