use super::events::{ApplyEvent, OutputStream};
use super::Stage;

/// Human-readable log of an apply, folded from its progress events.
/// Live file-progress ticks are left out.
#[derive(Debug, Default)]
pub struct Transcript {
    lines: Vec<String>,
    stage: Option<Stage>,
    finished: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in. Returns the line it produced, if any.
    pub fn apply(&mut self, event: &ApplyEvent) -> Option<&str> {
        let line = match event {
            ApplyEvent::Start { session_id, attempt } => {
                self.stage = None;
                format!("attempt {attempt} on session {session_id}")
            }
            ApplyEvent::Status { message, stage } => {
                if stage.is_some() {
                    self.stage = *stage;
                }
                match stage {
                    Some(stage) => format!("[{stage}] {message}"),
                    None => message.clone(),
                }
            }
            ApplyEvent::PackageProgress { message, .. } => {
                self.stage = Some(Stage::Install);
                format!("[install] {message}")
            }
            ApplyEvent::FileProgress { .. } => return None,
            ApplyEvent::CommandProgress { command } => {
                self.stage = Some(Stage::Run);
                format!("$ {command}")
            }
            ApplyEvent::CommandOutput { stream, output, .. } => {
                let prefix = match stream {
                    OutputStream::Stdout => "  ",
                    OutputStream::Stderr => "! ",
                };
                output
                    .lines()
                    .map(|l| format!("{prefix}{l}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            ApplyEvent::CommandComplete { exit_code, success, .. } => {
                if *success {
                    return None;
                }
                format!("  exited {exit_code}")
            }
            ApplyEvent::Complete { result } => {
                self.finished = true;
                format!(
                    "done: {} created, {} updated, {} skipped, {} errors",
                    result.files_created.len(),
                    result.files_updated.len(),
                    result.files_skipped.len(),
                    result.errors.len()
                )
            }
            ApplyEvent::Error { message, terminal } => {
                if *terminal {
                    self.finished = true;
                    format!("failed: {message}")
                } else {
                    format!("warning: {message}")
                }
            }
        };
        self.lines.push(line);
        self.lines.last().map(String::as_str)
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Last stage seen.
    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
