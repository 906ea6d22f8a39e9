use std::sync::Arc;

use async_trait::async_trait;

use super::error::SandboxError;
use super::types::{CommandResult, ProviderKind, SandboxInfo};

/// Capability set every execution backend implements.
///
/// A provider owns at most one session at a time. Every command or file
/// operation requires that session and fails with
/// `SandboxError::NoActiveSandbox` when there is none.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Provision a new session. A session already owned by this provider is
    /// terminated first.
    async fn create_sandbox(&self) -> Result<SandboxInfo, SandboxError>;

    /// Re-adopt an existing remote session. `Ok(false)` when the backend no
    /// longer knows the id.
    async fn reconnect(&self, session_id: &str) -> Result<bool, SandboxError>;

    /// Run a shell command in the working directory. A non-zero exit is
    /// reported through `CommandResult::success`, never as an error.
    async fn run_command(&self, command: &str) -> Result<CommandResult, SandboxError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Paths of regular files under `dir`, relative to the working directory.
    async fn list_files(&self, dir: &str) -> Result<Vec<String>, SandboxError>;

    async fn install_packages(&self, packages: &[String]) -> Result<CommandResult, SandboxError>;

    /// First-time application scaffold, dependency install and dev-server
    /// start. Calling it again on a prepared session is a no-op.
    async fn setup_runtime(&self) -> Result<(), SandboxError>;

    async fn restart_dev_server(&self) -> Result<(), SandboxError>;

    async fn sandbox_info(&self) -> Option<SandboxInfo>;

    async fn is_alive(&self) -> bool;

    async fn terminate(&self) -> Result<(), SandboxError>;

    /// The owned session, or `NoActiveSandbox`.
    async fn require_session(&self) -> Result<SandboxInfo, SandboxError> {
        self.sandbox_info()
            .await
            .ok_or(SandboxError::NoActiveSandbox)
    }
}

/// Builds fresh, unprovisioned providers for the configured backend.
pub trait ProviderFactory: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn make(&self) -> Arc<dyn SandboxProvider>;
}
