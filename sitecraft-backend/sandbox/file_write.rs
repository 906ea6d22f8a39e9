use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::error::SandboxError;
use super::paths::shell_quote;

/// Ways a provider can put file content into a session, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// The backend's structured file-write endpoint.
    Api,
    /// A shell script run through the generic exec capability.
    ShellScript,
}

pub const DEFAULT_WRITE_CHAIN: &[WriteStrategy] = &[WriteStrategy::Api, WriteStrategy::ShellScript];

/// Executes a single write strategy.
#[async_trait]
pub trait StrategyWriter: Send + Sync {
    async fn write_via(
        &self,
        strategy: WriteStrategy,
        relative_path: &str,
        content: &str,
    ) -> Result<(), SandboxError>;
}

/// Try each strategy in order and return the one that succeeded.
///
/// A missing session is returned at once: no other strategy can reach a
/// session the backend has forgotten.
pub async fn write_with_fallback<W: StrategyWriter + ?Sized>(
    writer: &W,
    chain: &[WriteStrategy],
    relative_path: &str,
    content: &str,
) -> Result<WriteStrategy, SandboxError> {
    let mut last_err = SandboxError::Unsupported("no file write strategy configured");
    for (idx, strategy) in chain.iter().copied().enumerate() {
        match writer.write_via(strategy, relative_path, content).await {
            Ok(()) => {
                if idx > 0 {
                    tracing::info!(path = %relative_path, ?strategy, "file written via fallback strategy");
                }
                return Ok(strategy);
            }
            Err(e) if e.is_session_missing() => return Err(e),
            Err(e) => {
                tracing::warn!(path = %relative_path, ?strategy, error = %e, "file write strategy failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Shell script writing `content` to `absolute_path`. Parent directories
/// are created with `mkdir -p`, which succeeds when they already exist.
pub fn shell_write_script(absolute_path: &str, content: &str) -> String {
    let encoded = BASE64.encode(content.as_bytes());
    let dir = match absolute_path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir,
        _ => ".",
    };
    format!(
        "mkdir -p {} && printf '%s' {} | base64 -d > {}",
        shell_quote(dir),
        shell_quote(&encoded),
        shell_quote(absolute_path)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedWriter {
        failing: Vec<WriteStrategy>,
        missing_session: bool,
        calls: Mutex<Vec<WriteStrategy>>,
    }

    impl ScriptedWriter {
        fn new(failing: Vec<WriteStrategy>) -> Self {
            Self {
                failing,
                missing_session: false,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StrategyWriter for ScriptedWriter {
        async fn write_via(
            &self,
            strategy: WriteStrategy,
            _relative_path: &str,
            _content: &str,
        ) -> Result<(), SandboxError> {
            self.calls.lock().unwrap().push(strategy);
            if self.missing_session {
                return Err(SandboxError::NotFound("s-1".into()));
            }
            if self.failing.contains(&strategy) {
                return Err(SandboxError::Backend("write endpoint unavailable".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn primary_strategy_wins_when_it_works() {
        let writer = ScriptedWriter::new(vec![]);
        let used = write_with_fallback(&writer, DEFAULT_WRITE_CHAIN, "a.js", "x")
            .await
            .unwrap();
        assert_eq!(used, WriteStrategy::Api);
        assert_eq!(*writer.calls.lock().unwrap(), vec![WriteStrategy::Api]);
    }

    #[tokio::test]
    async fn falls_back_to_shell_script() {
        let writer = ScriptedWriter::new(vec![WriteStrategy::Api]);
        let used = write_with_fallback(&writer, DEFAULT_WRITE_CHAIN, "a.js", "x")
            .await
            .unwrap();
        assert_eq!(used, WriteStrategy::ShellScript);
        assert_eq!(writer.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn all_strategies_failing_returns_last_error() {
        let writer = ScriptedWriter::new(vec![WriteStrategy::Api, WriteStrategy::ShellScript]);
        let err = write_with_fallback(&writer, DEFAULT_WRITE_CHAIN, "a.js", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Backend(_)));
    }

    #[tokio::test]
    async fn missing_session_short_circuits() {
        let mut writer = ScriptedWriter::new(vec![]);
        writer.missing_session = true;
        let err = write_with_fallback(&writer, DEFAULT_WRITE_CHAIN, "a.js", "x")
            .await
            .unwrap_err();
        assert!(err.is_session_missing());
        assert_eq!(writer.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_chain_is_unsupported() {
        let writer = ScriptedWriter::new(vec![]);
        let err = write_with_fallback(&writer, &[], "a.js", "x").await.unwrap_err();
        assert!(matches!(err, SandboxError::Unsupported(_)));
    }

    #[test]
    fn shell_script_encodes_content_and_creates_parents() {
        let script = shell_write_script("/home/user/app/src/App.jsx", "const x = 'y';");
        assert!(script.starts_with("mkdir -p '/home/user/app/src' && "));
        assert!(script.contains(&BASE64.encode("const x = 'y';")));
        assert!(script.ends_with("> '/home/user/app/src/App.jsx'"));
    }
}
