//! Remote execution backend reached over HTTP.
//!
//! Each provider instance owns at most one remote session. Commands and
//! file I/O go through the shared `ExecClient`, so all sessions created by
//! one factory reuse the same pooled connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::sandbox::error::SandboxError;
use crate::sandbox::exec_client::ExecClient;
use crate::sandbox::file_write::{
    shell_write_script, write_with_fallback, StrategyWriter, WriteStrategy, DEFAULT_WRITE_CHAIN,
};
use crate::sandbox::paths::{is_build_artifact, join_workdir, normalize_relative};
use crate::sandbox::provider::{ProviderFactory, SandboxProvider};
use crate::sandbox::scaffold;
use crate::sandbox::types::*;

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    working_directory: &'a str,
    ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    working_directory: Option<String>,
}

impl SessionResponse {
    fn is_running(&self) -> bool {
        !matches!(
            self.status.as_deref(),
            Some("terminated") | Some("stopped") | Some("error")
        )
    }
}

#[derive(Debug, Serialize)]
struct ExecBody<'a> {
    command: &'a str,
    cwd: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
struct WriteFileBody<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ReadFileResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ListFilesResponse {
    #[serde(default)]
    files: Vec<String>,
}

// ── Provider ────────────────────────────────────────────────────────

pub struct HttpProvider {
    client: ExecClient,
    settings: ProviderSettings,
    write_chain: Vec<WriteStrategy>,
    session: RwLock<Option<SandboxInfo>>,
    runtime_ready: AtomicBool,
    /// Cancelled on terminate so pending settle waits end with the session.
    lifecycle: Mutex<CancellationToken>,
}

impl HttpProvider {
    pub fn new(client: ExecClient, settings: ProviderSettings) -> Self {
        Self {
            client,
            settings,
            write_chain: DEFAULT_WRITE_CHAIN.to_vec(),
            session: RwLock::new(None),
            runtime_ready: AtomicBool::new(false),
            lifecycle: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_write_chain(mut self, chain: Vec<WriteStrategy>) -> Self {
        self.write_chain = chain;
        self
    }

    fn lifecycle_token(&self) -> CancellationToken {
        match self.lifecycle.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Cancel everything tied to the current session and arm a fresh token.
    fn reset_lifecycle(&self) {
        let mut guard = match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.cancel();
        *guard = CancellationToken::new();
    }

    fn session_path(session_id: &str, suffix: &str) -> String {
        format!("/sessions/{session_id}{suffix}")
    }

    async fn run_with_timeout(
        &self,
        command: &str,
        timeout: std::time::Duration,
    ) -> Result<CommandResult, SandboxError> {
        let info = self.require_session().await?;
        let body = ExecBody {
            command,
            cwd: &info.working_directory,
            timeout_ms: timeout.as_millis() as u64,
        };
        let resp: ExecResponse = match self
            .client
            .post(&Self::session_path(&info.session_id, "/exec"), &body, Some(timeout))
            .await
        {
            Ok(resp) => resp,
            Err(e) => return Err(self.confirm_missing(&info.session_id, e).await),
        };
        let exit_code = resp.exit_code.unwrap_or_else(|| {
            tracing::warn!(session_id = %info.session_id, %command, "backend returned no exit code");
            -1
        });
        tracing::debug!(session_id = %info.session_id, %command, exit_code, "command finished");
        Ok(CommandResult::from_exit(resp.stdout, resp.stderr, exit_code))
    }

    /// A 404 from a session sub-resource (a missing file, an unknown
    /// route) only means the session is gone when the session itself is
    /// gone too. Anything else becomes a plain backend error.
    async fn confirm_missing(&self, session_id: &str, err: SandboxError) -> SandboxError {
        let SandboxError::NotFound(detail) = err else {
            return err;
        };
        match self
            .client
            .get::<SessionResponse>(&Self::session_path(session_id, ""), &[], None)
            .await
        {
            Ok(resp) if resp.is_running() => SandboxError::Backend(detail),
            Ok(_) | Err(SandboxError::NotFound(_)) => SandboxError::NotFound(detail),
            Err(e) => {
                tracing::debug!(%session_id, error = %e, "could not confirm session after 404");
                SandboxError::Backend(detail)
            }
        }
    }

    fn info_from_response(&self, resp: SessionResponse) -> SandboxInfo {
        SandboxInfo {
            session_id: resp.session_id,
            url: resp.url,
            provider: ProviderKind::Http,
            created_at: Utc::now(),
            working_directory: resp
                .working_directory
                .unwrap_or_else(|| self.settings.working_directory.clone()),
        }
    }

    fn relative_to_workdir(&self, working_directory: &str, path: &str) -> Option<String> {
        let root = working_directory.trim_end_matches('/');
        let trimmed = path
            .strip_prefix(root)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(path);
        normalize_relative(trimmed).ok().filter(|p| !p.is_empty())
    }
}

#[async_trait]
impl StrategyWriter for HttpProvider {
    async fn write_via(
        &self,
        strategy: WriteStrategy,
        relative_path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let info = self.require_session().await?;
        let absolute = join_workdir(&info.working_directory, relative_path)?;
        match strategy {
            WriteStrategy::Api => {
                let written: Result<serde_json::Value, _> = self
                    .client
                    .post(
                        &Self::session_path(&info.session_id, "/files/write"),
                        &WriteFileBody {
                            path: &absolute,
                            content,
                        },
                        None,
                    )
                    .await;
                match written {
                    Ok(_) => Ok(()),
                    Err(e) => Err(self.confirm_missing(&info.session_id, e).await),
                }
            }
            WriteStrategy::ShellScript => {
                let result = self
                    .run_command(&shell_write_script(&absolute, content))
                    .await?;
                if result.success {
                    Ok(())
                } else {
                    Err(SandboxError::Exec(format!(
                        "script write of {relative_path} exited {}: {}",
                        result.exit_code, result.stderr
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl SandboxProvider for HttpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Http
    }

    async fn create_sandbox(&self) -> Result<SandboxInfo, SandboxError> {
        if let Some(existing) = self.sandbox_info().await {
            tracing::info!(session_id = %existing.session_id, "terminating owned session before provisioning");
            if let Err(e) = self.terminate().await {
                tracing::warn!(session_id = %existing.session_id, error = %e, "failed to terminate previous session");
            }
        }

        let body = CreateSessionRequest {
            working_directory: &self.settings.working_directory,
            ports: vec![self.settings.dev_server_port],
        };
        let resp: SessionResponse = self
            .client
            .post("/sessions", &body, None)
            .await
            .map_err(|e| SandboxError::Provision(e.to_string()))?;

        let info = self.info_from_response(resp);
        tracing::info!(
            session_id = %info.session_id,
            working_directory = %info.working_directory,
            "sandbox session created"
        );

        self.reset_lifecycle();
        self.runtime_ready.store(false, Ordering::SeqCst);
        *self.session.write().await = Some(info.clone());
        Ok(info)
    }

    async fn reconnect(&self, session_id: &str) -> Result<bool, SandboxError> {
        match self
            .client
            .get::<SessionResponse>(&Self::session_path(session_id, ""), &[], None)
            .await
        {
            Ok(resp) if !resp.is_running() => {
                tracing::info!(%session_id, status = ?resp.status, "session exists but is not running");
                Ok(false)
            }
            Ok(resp) => {
                let info = self.info_from_response(resp);
                tracing::info!(session_id = %info.session_id, "reconnected to existing session");
                self.reset_lifecycle();
                self.runtime_ready.store(false, Ordering::SeqCst);
                *self.session.write().await = Some(info);
                Ok(true)
            }
            Err(SandboxError::NotFound(_)) => {
                tracing::info!(%session_id, "backend no longer knows session");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_command(&self, command: &str) -> Result<CommandResult, SandboxError> {
        self.run_with_timeout(command, self.settings.command_timeout)
            .await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.require_session().await?;
        let relative = normalize_relative(path)?;
        write_with_fallback(self, &self.write_chain, &relative, content).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let info = self.require_session().await?;
        let absolute = join_workdir(&info.working_directory, path)?;
        let resp: ReadFileResponse = match self
            .client
            .get(
                &Self::session_path(&info.session_id, "/files/read"),
                &[("path", absolute.as_str())],
                None,
            )
            .await
        {
            Ok(resp) => resp,
            Err(e) => return Err(self.confirm_missing(&info.session_id, e).await),
        };
        Ok(resp.content)
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>, SandboxError> {
        let info = self.require_session().await?;
        let absolute = join_workdir(&info.working_directory, dir)?;
        let resp: ListFilesResponse = match self
            .client
            .get(
                &Self::session_path(&info.session_id, "/files/list"),
                &[("dir", absolute.as_str())],
                None,
            )
            .await
        {
            Ok(resp) => resp,
            Err(e) => return Err(self.confirm_missing(&info.session_id, e).await),
        };
        let mut files: Vec<String> = resp
            .files
            .iter()
            .filter_map(|f| self.relative_to_workdir(&info.working_directory, f))
            .filter(|f| !is_build_artifact(f))
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    async fn install_packages(&self, packages: &[String]) -> Result<CommandResult, SandboxError> {
        let info = self.require_session().await?;
        if packages.is_empty() {
            return Ok(CommandResult::from_exit("", "", 0));
        }
        if let Some(bad) = packages.iter().find(|p| p.is_empty() || p.starts_with('-')) {
            return Err(SandboxError::Exec(format!("invalid package name: {bad:?}")));
        }

        tracing::info!(session_id = %info.session_id, ?packages, "installing packages");
        let result = self
            .run_with_timeout(&scaffold::install_command(packages), self.settings.install_timeout)
            .await?;

        if result.success && self.settings.restart_after_install {
            if let Err(e) = self.restart_dev_server().await {
                tracing::warn!(session_id = %info.session_id, error = %e, "dev server restart after install failed");
            }
        }
        Ok(result)
    }

    async fn setup_runtime(&self) -> Result<(), SandboxError> {
        let info = self.require_session().await?;
        if self.runtime_ready.load(Ordering::SeqCst) {
            return Ok(());
        }

        let marker = self
            .run_command(&format!("test -f {}", scaffold::RUNTIME_MARKER))
            .await?;
        if marker.success {
            tracing::debug!(session_id = %info.session_id, "runtime already scaffolded");
        } else {
            let mut from_template = false;
            if let Some(template) = &self.settings.template_dir {
                let copy = self
                    .run_with_timeout(
                        &scaffold::copy_template_command(template, &info.working_directory),
                        self.settings.install_timeout,
                    )
                    .await?;
                from_template = copy.success;
                if !from_template {
                    tracing::warn!(session_id = %info.session_id, %template, "template copy failed, scaffolding from scratch");
                }
            }

            if !from_template {
                for file in scaffold::skeleton_files(self.settings.dev_server_port) {
                    self.write_file(file.path, &file.content).await?;
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
            tracing::info!(session_id = %info.session_id, from_template, "runtime scaffolded");
        }

        self.restart_dev_server().await?;
        self.runtime_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn restart_dev_server(&self) -> Result<(), SandboxError> {
        let info = self.require_session().await?;
        let token = self.lifecycle_token();

        self.run_command(&scaffold::kill_dev_server_command()).await?;
        let started = self
            .run_command(&scaffold::start_dev_server_command(self.settings.dev_server_port))
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
                return Err(SandboxError::Cancelled(format!(
                    "dev server restart for {} interrupted by teardown",
                    info.session_id
                )));
            }
        }

        let mut guard = self.session.write().await;
        if let Some(current) = guard.as_mut() {
            if current.session_id == info.session_id && current.url.is_none() {
                current.url = Some(preview_url(
                    &current.session_id,
                    self.settings.dev_server_port,
                    &self.settings.preview_host_suffix,
                ));
            }
        }
        tracing::info!(session_id = %info.session_id, "dev server restarted");
        Ok(())
    }

    async fn sandbox_info(&self) -> Option<SandboxInfo> {
        self.session.read().await.clone()
    }

    async fn is_alive(&self) -> bool {
        let Some(info) = self.sandbox_info().await else {
            return false;
        };
        match self
            .client
            .get::<SessionResponse>(&Self::session_path(&info.session_id, ""), &[], None)
            .await
        {
            Ok(resp) => resp.is_running(),
            Err(e) => {
                tracing::debug!(session_id = %info.session_id, error = %e, "liveness check failed");
                false
            }
        }
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        let taken = self.session.write().await.take();
        self.reset_lifecycle();
        self.runtime_ready.store(false, Ordering::SeqCst);

        let Some(info) = taken else {
            return Ok(());
        };
        match self
            .client
            .post::<serde_json::Value, _>(
                &Self::session_path(&info.session_id, "/terminate"),
                &serde_json::json!({}),
                None,
            )
            .await
        {
            Ok(_) | Err(SandboxError::NotFound(_)) => {
                tracing::info!(session_id = %info.session_id, "sandbox session terminated");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ── Factory ─────────────────────────────────────────────────────────

pub struct HttpProviderFactory {
    client: ExecClient,
    settings: ProviderSettings,
}

impl HttpProviderFactory {
    pub fn new(client: ExecClient, settings: ProviderSettings) -> Self {
        Self { client, settings }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Http
    }

    fn make(&self) -> Arc<dyn SandboxProvider> {
        Arc::new(HttpProvider::new(self.client.clone(), self.settings.clone()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
