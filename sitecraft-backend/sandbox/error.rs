use std::io;
use std::sync::Arc;

/// Errors from sandbox operations.
///
/// Backends map their internal failures into these variants. `NotFound`
/// means the backend no longer knows the session id; it is the one failure
/// the apply engine recovers from by itself. The type is `Clone` so a single
/// provisioning failure can be handed to every caller awaiting a shared
/// creation future.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SandboxError {
    #[error("no active sandbox session")]
    NoActiveSandbox,

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error(
        "{operation} failed after {elapsed_ms}ms (timeout {timeout_ms}ms){}: {message}",
        abort_marker(.aborted)
    )]
    Transport {
        operation: String,
        timeout_ms: u64,
        elapsed_ms: u64,
        aborted: bool,
        message: String,
    },

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("io: {0}")]
    Io(Arc<io::Error>),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

fn abort_marker(aborted: &bool) -> &'static str {
    if *aborted { " (aborted)" } else { "" }
}

impl From<io::Error> for SandboxError {
    fn from(err: io::Error) -> Self {
        SandboxError::Io(Arc::new(err))
    }
}

impl SandboxError {
    /// True when the backend reported that the session id is gone.
    pub fn is_session_missing(&self) -> bool {
        matches!(self, SandboxError::NotFound(_))
    }

    /// True for network failures and timeouts on a backend call.
    pub fn is_transport(&self) -> bool {
        matches!(self, SandboxError::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_active_sandbox_displays() {
        assert_eq!(
            SandboxError::NoActiveSandbox.to_string(),
            "no active sandbox session"
        );
    }

    #[test]
    fn not_found_displays_id() {
        let err = SandboxError::NotFound("sbx-123".into());
        assert_eq!(err.to_string(), "sandbox not found: sbx-123");
        assert!(err.is_session_missing());
    }

    #[test]
    fn transport_aborted_carries_diagnostics() {
        let err = SandboxError::Transport {
            operation: "POST http://backend/sessions/abc/exec".into(),
            timeout_ms: 250,
            elapsed_ms: 251,
            aborted: true,
            message: "request timed out".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("timeout 250ms"));
        assert!(msg.contains("after 251ms"));
        assert!(msg.contains("(aborted)"));
        assert!(msg.starts_with("POST http://backend/sessions/abc/exec"));
        assert!(err.is_transport());
    }

    #[test]
    fn transport_without_abort_has_no_marker() {
        let err = SandboxError::Transport {
            operation: "GET http://backend/sessions/abc".into(),
            timeout_ms: 1000,
            elapsed_ms: 12,
            aborted: false,
            message: "connection refused".into(),
        };
        assert!(!err.to_string().contains("aborted"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: SandboxError = io_err.into();
        assert!(err.to_string().contains("file missing"));
        assert!(matches!(err, SandboxError::Io(_)));
        assert!(!err.is_session_missing());
    }

    #[test]
    fn provision_exec_serde_backend_display() {
        assert_eq!(
            SandboxError::Provision("quota exceeded".into()).to_string(),
            "provision failed: quota exceeded"
        );
        assert_eq!(
            SandboxError::Exec("process died".into()).to_string(),
            "exec failed: process died"
        );
        assert_eq!(
            SandboxError::Serde("bad json".into()).to_string(),
            "serialization: bad json"
        );
        assert_eq!(
            SandboxError::Backend("502 Bad Gateway".into()).to_string(),
            "backend error: 502 Bad Gateway"
        );
    }

    #[test]
    fn error_is_send_sync_and_clone() {
        fn assert_traits<T: Send + Sync + Clone>() {}
        assert_traits::<SandboxError>();
    }
}
