//! Incremental extraction of `<file path="…">…</file>` blocks from a growing
//! generation stream.
//!
//! The parser keeps its scan position between chunks, so each byte of the
//! stream is examined a bounded number of times. A block that has opened but
//! not yet closed is exposed as the "currently generating" entry and is
//! reported as completed exactly once, when its closing tag arrives.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::paths::normalize_relative;

const OPEN_TAG: &str = "<file";
const CLOSE_TAG: &str = "</file>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Script,
    Style,
    Markup,
    Data,
    Text,
}

impl FileKind {
    pub fn from_path(path: &str) -> Self {
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => FileKind::Script,
            "css" | "scss" | "sass" | "less" => FileKind::Style,
            "html" | "htm" | "svg" | "vue" | "svelte" => FileKind::Markup,
            "json" | "yaml" | "yml" | "toml" | "xml" => FileKind::Data,
            _ => FileKind::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
    pub kind: FileKind,
    pub completed: bool,
    pub change_type: ChangeType,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum ScanState {
    /// Between blocks, looking for the next opening tag.
    Prose,
    /// Inside a block whose body starts at `body_start`.
    InFile { path: String, body_start: usize },
}

#[derive(Debug)]
pub struct StreamingFileParser {
    buffer: String,
    /// Bytes before this offset will never be looked at again.
    scan_offset: usize,
    state: ScanState,
    known_files: HashSet<String>,
    /// Decided once per pass and never revised.
    change_types: HashMap<String, ChangeType>,
    completed: Vec<FileEntry>,
    completed_paths: HashSet<String>,
    current: Option<FileEntry>,
}

impl StreamingFileParser {
    /// `known_files` is the file set that existed before this pass; it
    /// decides `Created` vs `Modified`.
    pub fn new<I, S>(known_files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let known_files = known_files
            .into_iter()
            .filter_map(|p| normalize_relative(p.as_ref()).ok())
            .collect();
        Self {
            buffer: String::new(),
            scan_offset: 0,
            state: ScanState::Prose,
            known_files,
            change_types: HashMap::new(),
            completed: Vec::new(),
            completed_paths: HashSet::new(),
            current: None,
        }
    }

    /// Append a chunk and return the entries that became complete, in the
    /// order their closing tags appear.
    pub fn push(&mut self, chunk: &str) -> Vec<FileEntry> {
        self.buffer.push_str(chunk);
        self.scan()
    }

    /// Feed the full accumulated text seen so far. Only the part beyond what
    /// was already consumed is scanned; a text that does not extend the
    /// previous one is ignored.
    pub fn advance_to(&mut self, accumulated: &str) -> Vec<FileEntry> {
        match accumulated.strip_prefix(self.buffer.as_str()) {
            Some(rest) => self.push(rest),
            None => {
                tracing::warn!(
                    previous_len = self.buffer.len(),
                    new_len = accumulated.len(),
                    "accumulated text does not extend the scanned prefix"
                );
                Vec::new()
            }
        }
    }

    /// Completed entries so far, in completion order.
    pub fn completed(&self) -> &[FileEntry] {
        &self.completed
    }

    /// The block that is open but not closed yet.
    pub fn current(&self) -> Option<&FileEntry> {
        self.current.as_ref()
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn into_completed(self) -> Vec<FileEntry> {
        self.completed
    }

    fn change_type(&mut self, path: &str) -> ChangeType {
        let known = self.known_files.contains(path);
        *self.change_types.entry(path.to_string()).or_insert(if known {
            ChangeType::Modified
        } else {
            ChangeType::Created
        })
    }

    fn scan(&mut self) -> Vec<FileEntry> {
        let mut newly_completed = Vec::new();
        loop {
            match self.state.clone() {
                ScanState::Prose => {
                    let Some(rel) = self.buffer[self.scan_offset..].find(OPEN_TAG) else {
                        // Keep a possible partial "<fil" at the tail.
                        self.scan_offset = self.retreat(self.buffer.len(), OPEN_TAG.len() - 1);
                        break;
                    };
                    let tag_start = self.scan_offset + rel;
                    let after_name = tag_start + OPEN_TAG.len();
                    let Some(next) = self.buffer[after_name..].chars().next() else {
                        self.scan_offset = tag_start;
                        break;
                    };
                    if !(next.is_whitespace() || next == '>') {
                        self.scan_offset = after_name;
                        continue;
                    }
                    let Some(gt) = self.buffer[after_name..].find('>') else {
                        self.scan_offset = tag_start;
                        break;
                    };
                    let tag_end = after_name + gt;
                    let path = path_attribute(&self.buffer[after_name..tag_end])
                        .and_then(|p| normalize_relative(&p).ok())
                        .filter(|p| !p.is_empty());
                    match path {
                        Some(path) => {
                            self.scan_offset = tag_end + 1;
                            self.state = ScanState::InFile {
                                path,
                                body_start: tag_end + 1,
                            };
                        }
                        None => {
                            tracing::debug!(tag = %&self.buffer[tag_start..=tag_end], "file tag without usable path");
                            self.scan_offset = tag_end + 1;
                        }
                    }
                }
                ScanState::InFile { path, body_start } => {
                    let Some(rel) = self.buffer[self.scan_offset..].find(CLOSE_TAG) else {
                        let provisional = clean_body(&self.buffer[body_start..]);
                        self.set_current(&path, provisional);
                        self.scan_offset = self
                            .retreat(self.buffer.len(), CLOSE_TAG.len() - 1)
                            .max(body_start);
                        break;
                    };
                    let close_start = self.scan_offset + rel;
                    let content = clean_body(&self.buffer[body_start..close_start]);
                    self.scan_offset = close_start + CLOSE_TAG.len();
                    self.state = ScanState::Prose;
                    self.current = None;
                    if let Some(entry) = self.complete(path, content) {
                        newly_completed.push(entry);
                    }
                }
            }
        }
        newly_completed
    }

    fn set_current(&mut self, path: &str, content: String) {
        let change_type = self.change_type(path);
        self.current = Some(FileEntry {
            path: path.to_string(),
            kind: FileKind::from_path(path),
            content,
            completed: false,
            change_type,
            last_updated: Utc::now(),
        });
    }

    fn complete(&mut self, path: String, content: String) -> Option<FileEntry> {
        if self.completed_paths.contains(&path) {
            tracing::debug!(%path, "ignoring repeated block for completed path");
            return None;
        }
        let entry = FileEntry {
            kind: FileKind::from_path(&path),
            change_type: self.change_type(&path),
            path: path.clone(),
            content,
            completed: true,
            last_updated: Utc::now(),
        };
        self.completed_paths.insert(path);
        self.completed.push(entry.clone());
        Some(entry)
    }

    /// `from` moved back by up to `by` bytes, on a char boundary.
    fn retreat(&self, from: usize, by: usize) -> usize {
        let mut idx = from.saturating_sub(by).max(self.scan_offset);
        while idx > 0 && !self.buffer.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }
}

/// Parse every complete block out of a finished text in one go.
pub fn extract_files<I, S>(text: &str, known_files: I) -> Vec<FileEntry>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parser = StreamingFileParser::new(known_files);
    parser.push(text);
    parser.into_completed()
}

/// The text outside every `<file …>…</file>` block. A block that never
/// closes swallows the rest of the text.
pub fn prose_outside_files(text: &str) -> String {
    let mut prose = String::new();
    let mut rest = text;
    while let Some(start) = find_open_tag(rest) {
        prose.push_str(&rest[..start]);
        match rest[start..].find(CLOSE_TAG) {
            Some(end) => rest = &rest[start + end + CLOSE_TAG.len()..],
            None => return prose,
        }
    }
    prose.push_str(rest);
    prose
}

/// Offset of the next `<file` that starts a tag, not `<filename` or similar.
fn find_open_tag(text: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(rel) = text[from..].find(OPEN_TAG) {
        let idx = from + rel;
        let after = idx + OPEN_TAG.len();
        match text[after..].chars().next() {
            Some(c) if c.is_whitespace() || c == '>' => return Some(idx),
            None => return Some(idx),
            Some(_) => from = after,
        }
    }
    None
}

/// Value of `path="…"` (or single-quoted) inside an opening tag.
fn path_attribute(attrs: &str) -> Option<String> {
    let mut rest = attrs;
    while let Some(idx) = rest.find("path") {
        let before_ok = idx == 0
            || rest[..idx]
                .chars()
                .next_back()
                .is_some_and(char::is_whitespace);
        let after = rest[idx + 4..].trim_start();
        if before_ok {
            if let Some(value) = after.strip_prefix('=') {
                let value = value.trim_start();
                let quote = value.chars().next()?;
                if quote == '"' || quote == '\'' {
                    let body = &value[1..];
                    let end = body.find(quote)?;
                    return Some(body[..end].to_string());
                }
            }
        }
        rest = &rest[idx + 4..];
    }
    None
}

/// Drop the newline that usually follows the opening tag and trailing
/// whitespace before the closing one.
fn clean_body(raw: &str) -> String {
    raw.strip_prefix("\r\n")
        .or_else(|| raw.strip_prefix('\n'))
        .unwrap_or(raw)
        .trim_end()
        .to_string()
}
