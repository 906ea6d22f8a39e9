use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::CommandResult;

/// Runs shell command lines with a filtered environment, an output cap and
/// a hard timeout. Used by `LocalProvider`.
pub struct ProcessSupervisor {
    /// Environment variables inherited from the host.
    pub env_allowlist: Vec<String>,
    /// Maximum bytes kept per stream; the rest is dropped.
    pub max_output_bytes: usize,
}

impl ProcessSupervisor {
    pub fn new(env_allowlist: Vec<String>, max_output_bytes: usize) -> Self {
        Self {
            env_allowlist,
            max_output_bytes,
        }
    }

    fn build_env(&self) -> Vec<(String, String)> {
        self.env_allowlist
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|val| (key.clone(), val)))
            .collect()
    }

    /// Run `command` through `sh -c` in `cwd`.
    ///
    /// A non-zero exit is a normal result. Exceeding `timeout` kills the
    /// child and returns an aborted `Transport` error.
    pub async fn run(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandResult, SandboxError> {
        if command.trim().is_empty() {
            return Err(SandboxError::Exec("empty command".into()));
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(cwd);
        cmd.env_clear();
        for (k, v) in self.build_env() {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Exec(format!("spawn failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Exec("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Exec("stderr not captured".into()))?;
        let max_bytes = self.max_output_bytes;
        let stdout_task = tokio::spawn(collect_capped(stdout, max_bytes));
        let stderr_task = tokio::spawn(collect_capped(stderr, max_bytes));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(SandboxError::Exec(format!("wait failed: {e}"))),
            Err(_) => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(SandboxError::Transport {
                    operation: format!("exec `{command}`"),
                    timeout_ms: timeout.as_millis() as u64,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    aborted: true,
                    message: "command did not finish in time".into(),
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(CommandResult::from_exit(
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr),
            status.code().unwrap_or(-1),
        ))
    }
}

async fn collect_capped<R: AsyncRead + Unpin>(mut reader: R, max_bytes: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max_bytes.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buf
}
