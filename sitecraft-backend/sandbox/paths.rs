use std::path::{Component, Path};

use super::error::SandboxError;

/// Normalize a caller path to a slash-separated path relative to the
/// working directory. Leading `/` and `./` are dropped; `..` that would
/// climb above the working directory is rejected.
pub fn normalize_relative(path: &str) -> Result<String, SandboxError> {
    let mut segments: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(seg) => segments.push(seg.to_string_lossy().into_owned()),
            Component::ParentDir => {
                if segments.pop().is_none() {
                    return Err(SandboxError::Exec(format!(
                        "path escapes working directory: {path}"
                    )));
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(segments.join("/"))
}

/// Absolute path of `relative` inside `working_directory`.
pub fn join_workdir(working_directory: &str, path: &str) -> Result<String, SandboxError> {
    let relative = normalize_relative(path)?;
    let root = working_directory.trim_end_matches('/');
    if relative.is_empty() {
        Ok(root.to_string())
    } else {
        Ok(format!("{root}/{relative}"))
    }
}

/// Directories that never hold user-authored application files.
const ARTIFACT_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    ".cache",
    ".sitecraft",
];

/// True when a relative path lies inside a dependency or build directory.
pub fn is_build_artifact(relative: &str) -> bool {
    relative.split('/').any(|seg| ARTIFACT_DIRS.contains(&seg))
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
