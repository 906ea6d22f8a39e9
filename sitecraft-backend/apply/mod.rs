pub mod checkpoint;
pub mod engine;
pub mod events;
pub mod parser;
pub mod payload;
pub mod transcript;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxError;
use checkpoint::Checkpoint;

pub use engine::{ApplyEngine, ApplyPolicy, ApplyRequest};
pub use events::{ApplyEvent, EventSink, GenerationEvent, GenerationSource};

/// Stages of one apply pass, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Reading the generation stream; precedes the apply pass proper.
    Stream,
    Analyze,
    Install,
    Write,
    Run,
    Restart,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Stream => "stream",
            Stage::Analyze => "analyze",
            Stage::Install => "install",
            Stage::Write => "write",
            Stage::Run => "run",
            Stage::Restart => "restart",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedCommand {
    pub command: String,
    pub exit_code: i32,
    pub success: bool,
}

/// Outcome of one apply pass. Stage failures land in `errors` and
/// `packages_failed`; they never abort the pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub session_id: String,
    pub attempts: usize,
    pub files_created: Vec<String>,
    pub files_updated: Vec<String>,
    pub files_skipped: Vec<String>,
    pub packages_installed: Vec<String>,
    pub packages_failed: Vec<String>,
    pub commands_executed: Vec<ExecutedCommand>,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

impl ApplyResult {
    pub fn files_written(&self) -> usize {
        self.files_created.len() + self.files_updated.len()
    }

    /// Something failed but the pass ran to the end.
    pub fn is_partial_failure(&self) -> bool {
        !self.errors.is_empty() || !self.packages_failed.is_empty()
    }

    /// Worth reloading the preview for.
    pub fn needs_refresh(&self) -> bool {
        self.files_written() > 0 || !self.packages_installed.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("malformed generation event: {0}")]
    MalformedEnvelope(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("generation produced no file blocks")]
    EmptyGeneration,

    #[error("apply cancelled during {stage} stage")]
    Cancelled { stage: Stage },

    #[error("sandbox session was lost {attempts} times, giving up: {last}")]
    RecoveryExhausted { attempts: usize, last: String },
}

impl ApplyError {
    /// The session disappeared under the request; the one failure the
    /// engine recovers from by itself.
    pub fn is_session_missing(&self) -> bool {
        matches!(self, ApplyError::Sandbox(e) if e.is_session_missing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_and_refresh_flags() {
        let mut result = ApplyResult::default();
        assert!(!result.is_partial_failure());
        assert!(!result.needs_refresh());

        result.files_created.push("src/App.jsx".into());
        result.packages_failed.push("left-pad".into());
        assert!(result.is_partial_failure());
        assert!(result.needs_refresh());
    }

    #[test]
    fn only_not_found_counts_as_missing_session() {
        assert!(ApplyError::from(SandboxError::NotFound("s".into())).is_session_missing());
        assert!(!ApplyError::from(SandboxError::NoActiveSandbox).is_session_missing());
        assert!(!ApplyError::EmptyGeneration.is_session_missing());
    }

    #[test]
    fn cancelled_names_the_stage() {
        let err = ApplyError::Cancelled { stage: Stage::Write };
        assert_eq!(err.to_string(), "apply cancelled during write stage");
    }
}
