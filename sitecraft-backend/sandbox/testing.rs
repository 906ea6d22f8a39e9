//! In-memory provider used by registry, apply and preview tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::error::SandboxError;
use super::paths::normalize_relative;
use super::provider::{ProviderFactory, SandboxProvider};
use super::types::*;

/// Shared state of the fake remote backend. All providers made by one
/// `FakeFactory` talk to the same backend.
#[derive(Default)]
pub struct FakeBackend {
    pub create_calls: AtomicUsize,
    pub reconnect_calls: AtomicUsize,
    pub terminate_calls: AtomicUsize,
    pub restart_calls: AtomicUsize,
    pub setup_calls: AtomicUsize,
    pub create_delay_ms: AtomicUsize,
    pub fail_create: AtomicBool,
    /// Every session-scoped call answers `NotFound`.
    pub sessions_lost: AtomicBool,
    pub dead: AtomicBool,
    pub failing_packages: Mutex<Vec<String>>,
    pub failing_paths: Mutex<Vec<String>>,
    pub failing_commands: Mutex<Vec<String>>,
    pub known_ids: Mutex<HashSet<String>>,
    pub files: Mutex<BTreeMap<String, String>>,
    pub commands: Mutex<Vec<String>>,
    pub installs: Mutex<Vec<Vec<String>>>,
    /// Global operation log, e.g. `install`, `write:src/App.jsx`, `run:..`.
    pub log: Mutex<Vec<String>>,
    seq: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn seed_file(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
    }
}

pub struct FakeProvider {
    backend: Arc<FakeBackend>,
    session: Mutex<Option<SandboxInfo>>,
}

impl FakeProvider {
    pub fn new(backend: Arc<FakeBackend>) -> Self {
        Self {
            backend,
            session: Mutex::new(None),
        }
    }

    fn live(&self) -> Result<SandboxInfo, SandboxError> {
        let info = self
            .session
            .lock()
            .unwrap()
            .clone()
            .ok_or(SandboxError::NoActiveSandbox)?;
        if self.backend.sessions_lost.load(Ordering::SeqCst) {
            return Err(SandboxError::NotFound(info.session_id));
        }
        Ok(info)
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn create_sandbox(&self) -> Result<SandboxInfo, SandboxError> {
        self.backend.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.backend.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.backend.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::Provision("backend at capacity".into()));
        }
        let n = self.backend.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let info = SandboxInfo {
            session_id: format!("fake-{n}"),
            url: Some(format!("http://fake-{n}.test")),
            provider: ProviderKind::Local,
            created_at: Utc::now(),
            working_directory: "/app".into(),
        };
        self.backend
            .known_ids
            .lock()
            .unwrap()
            .insert(info.session_id.clone());
        *self.session.lock().unwrap() = Some(info.clone());
        Ok(info)
    }

    async fn reconnect(&self, session_id: &str) -> Result<bool, SandboxError> {
        self.backend.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if !self.backend.known_ids.lock().unwrap().contains(session_id) {
            return Ok(false);
        }
        *self.session.lock().unwrap() = Some(SandboxInfo {
            session_id: session_id.to_string(),
            url: Some(format!("http://{session_id}.test")),
            provider: ProviderKind::Local,
            created_at: Utc::now(),
            working_directory: "/app".into(),
        });
        Ok(true)
    }

    async fn run_command(&self, command: &str) -> Result<CommandResult, SandboxError> {
        self.live()?;
        self.backend.record(format!("run:{command}"));
        self.backend.commands.lock().unwrap().push(command.to_string());
        if self.backend.failing_commands.lock().unwrap().iter().any(|c| c == command) {
            return Ok(CommandResult::from_exit("", "command failed", 1));
        }
        Ok(CommandResult::from_exit(format!("ran {command}"), "", 0))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.live()?;
        let path = normalize_relative(path)?;
        self.backend.record(format!("write:{path}"));
        if self.backend.failing_paths.lock().unwrap().contains(&path) {
            return Err(SandboxError::Backend(format!("disk full writing {path}")));
        }
        self.backend.seed_file(&path, content);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.live()?;
        self.backend
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::Exec(format!("no such file: {path}")))
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>, SandboxError> {
        self.live()?;
        let prefix = normalize_relative(dir)?;
        Ok(self
            .backend
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|p| prefix.is_empty() || p.starts_with(&format!("{prefix}/")))
            .cloned()
            .collect())
    }

    async fn install_packages(&self, packages: &[String]) -> Result<CommandResult, SandboxError> {
        self.live()?;
        self.backend.record("install");
        self.backend.installs.lock().unwrap().push(packages.to_vec());
        let failing = self.backend.failing_packages.lock().unwrap();
        if packages.iter().any(|p| failing.contains(p)) {
            return Ok(CommandResult::from_exit("", "npm ERR! 404", 1));
        }
        Ok(CommandResult::from_exit("added", "", 0))
    }

    async fn setup_runtime(&self) -> Result<(), SandboxError> {
        self.live()?;
        self.backend.setup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart_dev_server(&self) -> Result<(), SandboxError> {
        self.live()?;
        self.backend.record("restart");
        self.backend.restart_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sandbox_info(&self) -> Option<SandboxInfo> {
        self.session.lock().unwrap().clone()
    }

    async fn is_alive(&self) -> bool {
        self.session.lock().unwrap().is_some()
            && !self.backend.dead.load(Ordering::SeqCst)
            && !self.backend.sessions_lost.load(Ordering::SeqCst)
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        self.backend.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(info) = self.session.lock().unwrap().take() {
            self.backend.known_ids.lock().unwrap().remove(&info.session_id);
        }
        Ok(())
    }
}

pub struct FakeFactory {
    pub backend: Arc<FakeBackend>,
}

impl FakeFactory {
    pub fn new(backend: Arc<FakeBackend>) -> Arc<Self> {
        Arc::new(Self { backend })
    }
}

impl ProviderFactory for FakeFactory {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn make(&self) -> Arc<dyn SandboxProvider> {
        Arc::new(FakeProvider::new(self.backend.clone()))
    }
}
