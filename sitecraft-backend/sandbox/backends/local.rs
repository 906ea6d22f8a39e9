use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::sandbox::error::SandboxError;
use crate::sandbox::local_host::fs_jail::FsJail;
use crate::sandbox::local_host::process_supervisor::ProcessSupervisor;
use crate::sandbox::provider::{ProviderFactory, SandboxProvider};
use crate::sandbox::scaffold;
use crate::sandbox::types::*;

/// Host variables passed through to commands run in a local session.
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM", "NODE_OPTIONS"];

const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Session directories on the local host.
///
/// Each session gets its own directory under `root_dir` and its own
/// dev-server port, picked from the free loopback ports when the session is
/// created and kept in the session directory. `dev_server_port` from the
/// settings is not used. Commands run as the current user with a filtered
/// env. NOT a security boundary, intended for development without a remote
/// execution backend.
pub struct LocalProvider {
    root_dir: PathBuf,
    settings: ProviderSettings,
    supervisor: ProcessSupervisor,
    session: RwLock<Option<LocalSession>>,
    runtime_ready: AtomicBool,
    lifecycle: Mutex<CancellationToken>,
}

struct LocalSession {
    info: SandboxInfo,
    jail: Arc<FsJail>,
    port: u16,
}

fn free_port() -> Result<u16, SandboxError> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// The port recorded for this session directory, or a fresh one that is
/// then recorded.
async fn assign_port(jail: &FsJail) -> Result<u16, SandboxError> {
    if let Ok(saved) = jail.read_file(scaffold::PORT_FILE).await {
        if let Ok(port) = saved.trim().parse::<u16>() {
            return Ok(port);
        }
    }
    let port = free_port()?;
    jail.write_file(scaffold::PORT_FILE, &port.to_string()).await?;
    Ok(port)
}

impl LocalProvider {
    pub fn new(root_dir: PathBuf, settings: ProviderSettings) -> Self {
        Self {
            root_dir,
            settings,
            supervisor: ProcessSupervisor::new(
                ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
                MAX_OUTPUT_BYTES,
            ),
            session: RwLock::new(None),
            runtime_ready: AtomicBool::new(false),
            lifecycle: Mutex::new(CancellationToken::new()),
        }
    }

    fn local_url(port: u16) -> String {
        format!("http://localhost:{port}")
    }

    fn lifecycle_token(&self) -> CancellationToken {
        match self.lifecycle.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn reset_lifecycle(&self) {
        let mut guard = match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.cancel();
        *guard = CancellationToken::new();
    }

    async fn jail(&self) -> Result<Arc<FsJail>, SandboxError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.jail.clone())
            .ok_or(SandboxError::NoActiveSandbox)
    }

    async fn port(&self) -> Result<u16, SandboxError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.port)
            .ok_or(SandboxError::NoActiveSandbox)
    }

    async fn run_with_timeout(
        &self,
        command: &str,
        timeout: std::time::Duration,
    ) -> Result<CommandResult, SandboxError> {
        let jail = self.jail().await?;
        tracing::debug!(cwd = %jail.root().display(), %command, "running local command");
        self.supervisor.run(command, jail.root(), timeout).await
    }

    fn adopt(&self, session_id: &str, jail: FsJail, port: u16) -> LocalSession {
        LocalSession {
            port,
            info: SandboxInfo {
                session_id: session_id.to_string(),
                url: None,
                provider: ProviderKind::Local,
                created_at: Utc::now(),
                working_directory: jail.root().display().to_string(),
            },
            jail: Arc::new(jail),
        }
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, SandboxError> {
        if session_id.is_empty()
            || !session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SandboxError::NotFound(format!("invalid local session id: {session_id}")));
        }
        Ok(self.root_dir.join(session_id))
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn create_sandbox(&self) -> Result<SandboxInfo, SandboxError> {
        if self.sandbox_info().await.is_some() {
            self.terminate().await?;
        }

        let session_id = format!("local-{}", uuid::Uuid::new_v4().simple());
        let jail = FsJail::create(self.session_dir(&session_id)?)?;
        let port = assign_port(&jail).await?;
        let session = self.adopt(&session_id, jail, port);
        let info = session.info.clone();

        tracing::info!(
            session_id = %info.session_id,
            working_directory = %info.working_directory,
            port,
            "local sandbox created"
        );
        self.reset_lifecycle();
        self.runtime_ready.store(false, Ordering::SeqCst);
        *self.session.write().await = Some(session);
        Ok(info)
    }

    async fn reconnect(&self, session_id: &str) -> Result<bool, SandboxError> {
        let dir = match self.session_dir(session_id) {
            Ok(dir) => dir,
            Err(_) => return Ok(false),
        };
        let jail = match FsJail::attach(dir) {
            Ok(jail) => jail,
            Err(e) if e.is_session_missing() => return Ok(false),
            Err(e) => return Err(e),
        };
        let port = assign_port(&jail).await?;
        let session = self.adopt(session_id, jail, port);
        tracing::info!(%session_id, port, "reattached local sandbox");
        self.reset_lifecycle();
        self.runtime_ready.store(false, Ordering::SeqCst);
        *self.session.write().await = Some(session);
        Ok(true)
    }

    async fn run_command(&self, command: &str) -> Result<CommandResult, SandboxError> {
        self.run_with_timeout(command, self.settings.command_timeout)
            .await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.jail().await?.write_file(path, content).await
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.jail().await?.read_file(path).await
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>, SandboxError> {
        self.jail().await?.list_files(dir).await
    }

    async fn install_packages(&self, packages: &[String]) -> Result<CommandResult, SandboxError> {
        self.jail().await?;
        if packages.is_empty() {
            return Ok(CommandResult::from_exit("", "", 0));
        }
        if let Some(bad) = packages.iter().find(|p| p.is_empty() || p.starts_with('-')) {
            return Err(SandboxError::Exec(format!("invalid package name: {bad:?}")));
        }
        let result = self
            .run_with_timeout(&scaffold::install_command(packages), self.settings.install_timeout)
            .await?;
        if result.success && self.settings.restart_after_install {
            if let Err(e) = self.restart_dev_server().await {
                tracing::warn!(error = %e, "dev server restart after install failed");
            }
        }
        Ok(result)
    }

    async fn setup_runtime(&self) -> Result<(), SandboxError> {
        let jail = self.jail().await?;
        if self.runtime_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !jail.root().join(scaffold::RUNTIME_MARKER).is_file() {
            for file in scaffold::skeleton_files(self.port().await?) {
                jail.write_file(file.path, &file.content).await?;
            }
            let install = self
                .run_with_timeout(&scaffold::install_command(&[]), self.settings.install_timeout)
                .await?;
            if !install.success {
                return Err(SandboxError::Exec(format!(
                    "initial dependency install exited {}: {}",
                    install.exit_code, install.stderr
                )));
            }
        }
        self.restart_dev_server().await?;
        self.runtime_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn restart_dev_server(&self) -> Result<(), SandboxError> {
        let token = self.lifecycle_token();
        let port = self.port().await?;
        self.run_command(&scaffold::kill_dev_server_command()).await?;
        let started = self
            .run_command(&scaffold::start_dev_server_command(port))
            .await?;
        if !started.success {
            return Err(SandboxError::Exec(format!(
                "dev server launch exited {}: {}",
                started.exit_code, started.stderr
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(self.settings.dev_server_settle) => {}
            _ = token.cancelled() => {
                return Err(SandboxError::Cancelled("dev server restart interrupted by teardown".into()));
            }
        }

        if let Some(session) = self.session.write().await.as_mut() {
            if session.info.url.is_none() {
                session.info.url = Some(Self::local_url(session.port));
            }
        }
        Ok(())
    }

    async fn sandbox_info(&self) -> Option<SandboxInfo> {
        self.session.read().await.as_ref().map(|s| s.info.clone())
    }

    async fn is_alive(&self) -> bool {
        match self.session.read().await.as_ref() {
            Some(session) => session.jail.root().is_dir(),
            None => false,
        }
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        let taken = self.session.write().await.take();
        self.reset_lifecycle();
        self.runtime_ready.store(false, Ordering::SeqCst);
        if let Some(session) = taken {
            tracing::info!(session_id = %session.info.session_id, "destroying local sandbox");
            let stop = scaffold::kill_dev_server_command();
            if let Err(e) = self
                .supervisor
                .run(&stop, session.jail.root(), self.settings.command_timeout)
                .await
            {
                tracing::warn!(session_id = %session.info.session_id, error = %e, "failed to stop dev server");
            }
            session.jail.destroy().await?;
        }
        Ok(())
    }
}

pub struct LocalProviderFactory {
    root_dir: PathBuf,
    settings: ProviderSettings,
}

impl LocalProviderFactory {
    pub fn new(root_dir: PathBuf, settings: ProviderSettings) -> Self {
        Self { root_dir, settings }
    }
}

impl ProviderFactory for LocalProviderFactory {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn make(&self) -> Arc<dyn SandboxProvider> {
        Arc::new(LocalProvider::new(self.root_dir.clone(), self.settings.clone()))
    }
}
