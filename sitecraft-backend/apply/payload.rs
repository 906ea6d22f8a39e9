//! Turns a finished generation into the work for one apply pass: files,
//! packages and commands.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use super::parser::{extract_files, prose_outside_files, FileEntry, FileKind};
use crate::sandbox::scaffold::{is_scaffold_config, PREINSTALLED_PACKAGES};

/// Options that shape payload extraction.
#[derive(Debug, Clone)]
pub struct PayloadPolicy {
    /// Drop generated copies of config files the scaffold owns.
    pub skip_scaffold_configs: bool,
    /// Add packages imported by generated scripts to the install list.
    pub detect_imports: bool,
}

impl Default for PayloadPolicy {
    fn default() -> Self {
        Self {
            skip_scaffold_configs: true,
            detect_imports: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyPayload {
    pub files: Vec<FileEntry>,
    pub packages: Vec<String>,
    pub commands: Vec<String>,
    /// Paths present in the generation but not applied.
    pub skipped: Vec<String>,
}

impl ApplyPayload {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.packages.is_empty() && self.commands.is_empty()
    }
}

const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "crypto", "events", "fs", "http", "https", "os",
    "path", "process", "stream", "url", "util", "zlib",
];

/// Build the payload for `text`. `explicit_packages` are names announced
/// outside the text (package events, the completion envelope).
pub fn extract_payload(
    text: &str,
    known_files: &[String],
    explicit_packages: &[String],
    policy: &PayloadPolicy,
) -> ApplyPayload {
    let mut payload = ApplyPayload::default();
    let mut seen_packages = HashSet::new();
    let mut add_package = |name: &str, packages: &mut Vec<String>| {
        let name = name.trim();
        if !name.is_empty() && seen_packages.insert(name.to_string()) {
            packages.push(name.to_string());
        }
    };

    for name in explicit_packages {
        add_package(name.as_str(), &mut payload.packages);
    }
    // Tags inside a generated file are that file's content, never instructions.
    let prose = prose_outside_files(text);
    for body in tag_bodies(&prose, "package") {
        add_package(body.as_str(), &mut payload.packages);
    }
    for body in tag_bodies(&prose, "packages") {
        for name in body.split([',', '\n']) {
            add_package(name, &mut payload.packages);
        }
    }
    payload.commands = tag_bodies(&prose, "command")
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    for mut entry in extract_files(text, known_files) {
        if policy.skip_scaffold_configs && is_scaffold_config(&entry.path) {
            tracing::debug!(path = %entry.path, "skipping scaffold-owned config file");
            payload.skipped.push(entry.path);
            continue;
        }
        if entry.kind == FileKind::Script {
            entry.content = strip_css_imports(&entry.content);
            if policy.detect_imports {
                for pkg in imported_packages(&entry.content) {
                    add_package(pkg.as_str(), &mut payload.packages);
                }
            }
        }
        payload.files.push(entry);
    }

    payload
}

/// Trimmed bodies of every complete `<tag>…</tag>` pair.
pub fn tag_bodies(text: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&open) {
        let body_start = start + open.len();
        let Some(len) = rest[body_start..].find(&close) else {
            break;
        };
        out.push(rest[body_start..body_start + len].trim().to_string());
        rest = &rest[body_start + len + close.len()..];
    }
    out
}

fn import_pattern() -> Option<&'static Regex> {
    static IMPORT_RE: OnceLock<Option<Regex>> = OnceLock::new();
    IMPORT_RE
        .get_or_init(|| {
            Regex::new(r#"(?m)^\s*import\s+(?:[\w*{}\s,$]+\s+from\s+)?['"]([^'"]+)['"]"#).ok()
        })
        .as_ref()
}

fn css_import_pattern() -> Option<&'static Regex> {
    static CSS_RE: OnceLock<Option<Regex>> = OnceLock::new();
    CSS_RE
        .get_or_init(|| Regex::new(r#"(?m)^\s*import\s+['"](\.{1,2}/[^'"]+\.css)['"];?[ \t]*\r?\n?"#).ok())
        .as_ref()
}

/// Third-party package roots imported by a script.
pub fn imported_packages(source: &str) -> Vec<String> {
    let Some(re) = import_pattern() else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for caps in re.captures_iter(source) {
        let Some(spec) = caps.get(1).map(|m| m.as_str()) else {
            continue;
        };
        if let Some(root) = package_root(spec) {
            if !out.contains(&root) {
                out.push(root);
            }
        }
    }
    out
}

/// `@scope/name/deep` → `@scope/name`, `name/deep` → `name`. `None` for
/// relative, absolute, node built-in and preinstalled imports.
fn package_root(spec: &str) -> Option<String> {
    if spec.starts_with('.') || spec.starts_with('/') || spec.starts_with("node:") {
        return None;
    }
    let mut parts = spec.split('/');
    let first = parts.next()?;
    let root = if first.starts_with('@') {
        format!("{first}/{}", parts.next()?)
    } else {
        first.to_string()
    };
    if root.is_empty()
        || NODE_BUILTINS.contains(&root.as_str())
        || PREINSTALLED_PACKAGES.contains(&root.as_str())
    {
        return None;
    }
    Some(root)
}

/// Remove relative stylesheet imports other than `index.css`; styling goes
/// through Tailwind utility classes.
pub fn strip_css_imports(source: &str) -> String {
    let Some(re) = css_import_pattern() else {
        return source.to_string();
    };
    re.replace_all(source, |caps: &regex::Captures<'_>| {
        let path = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if path.ends_with("/index.css") {
            caps[0].to_string()
        } else {
            String::new()
        }
    })
    .into_owned()
}
