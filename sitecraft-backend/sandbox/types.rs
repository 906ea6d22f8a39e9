use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Session identity ────────────────────────────────────────────────

pub type SessionId = String;

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Remote execution backend reached over HTTP.
    Http,
    /// Session directories on the local host.
    Local,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Http => f.write_str("http"),
            ProviderKind::Local => f.write_str("local"),
        }
    }
}

// ── Session info ────────────────────────────────────────────────────

/// Identity and addressing of a live session.
///
/// Everything except `url` is fixed at creation; `url` may be filled in once
/// the dev server is up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub provider: ProviderKind,
    pub created_at: DateTime<Utc>,
    pub working_directory: String,
}

/// Compose the public preview address for a session's dev server port.
pub fn preview_url(session_id: &str, port: u16, host_suffix: &str) -> String {
    format!(
        "https://{port}-{session_id}.{}",
        host_suffix.trim_start_matches('.')
    )
}

// ── Command results ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

impl CommandResult {
    pub fn from_exit(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            success: exit_code == 0,
        }
    }
}

// ── Provider settings ───────────────────────────────────────────────

/// Per-provider knobs. Install-class operations get their own, longer
/// timeout; `command_timeout` is never used for them.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub working_directory: String,
    pub command_timeout: Duration,
    pub install_timeout: Duration,
    pub dev_server_port: u16,
    pub preview_host_suffix: String,
    /// Prebuilt application template inside the sandbox, copied instead of
    /// running a cold install when present.
    pub template_dir: Option<String>,
    pub restart_after_install: bool,
    /// Wait after (re)launching the dev server before reporting success.
    pub dev_server_settle: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            working_directory: "/home/user/app".into(),
            command_timeout: Duration::from_secs(30),
            install_timeout: Duration::from_secs(300),
            dev_server_port: 5173,
            preview_host_suffix: "sandbox.local".into(),
            template_dir: None,
            restart_after_install: true,
            dev_server_settle: Duration::from_secs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_url_composes_port_and_session() {
        assert_eq!(
            preview_url("abc123", 5173, "sandbox.example.com"),
            "https://5173-abc123.sandbox.example.com"
        );
        assert_eq!(
            preview_url("abc123", 3000, ".sandbox.example.com"),
            "https://3000-abc123.sandbox.example.com"
        );
    }

    #[test]
    fn command_result_success_tracks_exit_code() {
        assert!(CommandResult::from_exit("ok", "", 0).success);
        let failed = CommandResult::from_exit("", "boom", 1);
        assert!(!failed.success);
        assert_eq!(failed.exit_code, 1);
    }

    #[test]
    fn provider_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_value(ProviderKind::Http).unwrap(), "http");
        assert_eq!(ProviderKind::Local.to_string(), "local");
    }

    #[test]
    fn sandbox_info_omits_missing_url() {
        let info = SandboxInfo {
            session_id: "s1".into(),
            url: None,
            provider: ProviderKind::Http,
            created_at: Utc::now(),
            working_directory: "/home/user/app".into(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("url").is_none());
        assert_eq!(json["provider"], "http");
    }

    #[test]
    fn install_timeout_is_longer_than_command_timeout() {
        let settings = ProviderSettings::default();
        assert!(settings.install_timeout > settings.command_timeout);
    }
}
