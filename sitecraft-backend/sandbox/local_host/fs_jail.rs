use std::path::{Path, PathBuf};

use crate::sandbox::error::SandboxError;
use crate::sandbox::paths::{is_build_artifact, normalize_relative};

/// Session directory on the local host with path containment.
///
/// Every path is normalized relative to the root and rejected if it would
/// climb out of it. This is NOT a chroot; symlinks inside the directory are
/// followed.
pub struct FsJail {
    root: PathBuf,
}

impl FsJail {
    /// Create a new jail rooted at `root`. Creates the directory if needed.
    pub fn create(root: PathBuf) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&root).map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create session dir {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    /// Attach to an existing session directory.
    pub fn attach(root: PathBuf) -> Result<Self, SandboxError> {
        if !root.is_dir() {
            return Err(SandboxError::NotFound(format!(
                "session dir does not exist: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let relative = normalize_relative(path)?;
        if relative.is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(relative))
        }
    }

    /// Write `content`, creating parent directories as needed.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::read_to_string(&target).await?)
    }

    /// Regular files under `dir`, relative to the jail root, sorted.
    /// Dependency and build directories are not descended into.
    pub async fn list_files(&self, dir: &str) -> Result<Vec<String>, SandboxError> {
        let start = normalize_relative(dir)?;
        let mut pending = vec![start];
        let mut files = Vec::new();

        while let Some(rel_dir) = pending.pop() {
            let abs = if rel_dir.is_empty() {
                self.root.clone()
            } else {
                self.root.join(&rel_dir)
            };
            let mut entries = match tokio::fs::read_dir(&abs).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let rel = if rel_dir.is_empty() {
                    name
                } else {
                    format!("{rel_dir}/{name}")
                };
                if is_build_artifact(&rel) {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(rel);
                } else if file_type.is_file() {
                    files.push(rel);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Remove the entire session directory.
    pub async fn destroy(&self) -> Result<(), SandboxError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
