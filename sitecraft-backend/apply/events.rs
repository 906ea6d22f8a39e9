use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use super::{ApplyError, ApplyResult, Stage};
use crate::sandbox::{SandboxError, SandboxInfo};

// ── Inbound generation envelopes ────────────────────────────────────

/// One event of the model output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GenerationEvent {
    Stream {
        text: String,
    },
    Package {
        name: String,
    },
    Complete {
        #[serde(rename = "generatedCode")]
        generated_code: String,
        #[serde(default)]
        packages: Vec<String>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Envelope types this engine has no use for (status pings, usage).
    #[serde(other)]
    Unknown,
}

/// Error code a generation backend uses when the session it was asked to
/// read from is gone.
pub const SESSION_NOT_FOUND_CODE: &str = "session_not_found";

/// Decode one line of the stream. Blank lines, SSE comments and `[DONE]`
/// yield `None`; anything else must be a valid envelope.
pub fn decode_envelope(line: &str) -> Result<Option<GenerationEvent>, ApplyError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }
    let payload = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }
    serde_json::from_str(payload)
        .map(Some)
        .map_err(|e| ApplyError::MalformedEnvelope(format!("{e}: {}", truncate(payload, 120))))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl GenerationEvent {
    /// Convert an `error` envelope into the engine error it stands for.
    pub fn into_error(error: String, code: Option<String>) -> ApplyError {
        if code.as_deref() == Some(SESSION_NOT_FOUND_CODE) {
            ApplyError::Sandbox(SandboxError::NotFound(error))
        } else {
            ApplyError::Generation(error)
        }
    }
}

/// Splits an arbitrary chunking of the stream into lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: String,
}

impl LineFramer {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=idx).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        (!rest.trim().is_empty()).then_some(rest)
    }
}

// ── Generation sources ──────────────────────────────────────────────

pub type ChunkStream = BoxStream<'static, Result<String, ApplyError>>;

/// Where the model output comes from. Opened once per attempt, so a
/// recovered request replays the generation against the new session.
#[async_trait]
pub trait GenerationSource: Send + Sync {
    async fn open(&self, session: &SandboxInfo, attempt: usize) -> Result<ChunkStream, ApplyError>;
}

/// Replays a finished model response as a single `complete` envelope.
pub struct ResponseSource {
    response: String,
    packages: Vec<String>,
}

impl ResponseSource {
    pub fn new(response: impl Into<String>, packages: Vec<String>) -> Self {
        Self {
            response: response.into(),
            packages,
        }
    }
}

#[async_trait]
impl GenerationSource for ResponseSource {
    async fn open(&self, _session: &SandboxInfo, _attempt: usize) -> Result<ChunkStream, ApplyError> {
        let envelope = GenerationEvent::Complete {
            generated_code: self.response.clone(),
            packages: self.packages.clone(),
        };
        let line = serde_json::to_string(&envelope)
            .map_err(|e| ApplyError::Generation(format!("failed to encode response: {e}")))?;
        Ok(Box::pin(stream::iter(vec![Ok(format!("data: {line}\n"))])))
    }
}

/// A generation that is still being produced, read chunk by chunk from a
/// request body or a pipe.
///
/// The live stream can only be read once. Chunks are recorded as they
/// arrive, so a later attempt replays what earlier attempts saw and then
/// keeps reading where they stopped.
pub struct LiveSource {
    state: Arc<Mutex<LiveState>>,
}

struct LiveState {
    live: Option<ChunkStream>,
    recorded: Vec<String>,
}

impl LiveSource {
    pub fn new(live: ChunkStream) -> Self {
        Self {
            state: Arc::new(Mutex::new(LiveState {
                live: Some(live),
                recorded: Vec::new(),
            })),
        }
    }

    /// Decode a byte stream as UTF-8. A character split across two chunks
    /// is held back until its remaining bytes arrive.
    pub fn from_bytes<S, B, E>(bytes: S) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Display + Send + 'static,
    {
        let chunks = async_stream::stream! {
            let mut pending: Vec<u8> = Vec::new();
            let mut failed = false;
            let mut bytes = Box::pin(bytes);
            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        failed = true;
                        yield Err(ApplyError::Generation(format!("generation stream failed: {e}")));
                        break;
                    }
                };
                pending.extend_from_slice(chunk.as_ref());
                let valid = match std::str::from_utf8(&pending) {
                    Ok(text) => text.len(),
                    Err(e) if e.error_len().is_none() => e.valid_up_to(),
                    Err(e) => {
                        failed = true;
                        yield Err(ApplyError::MalformedEnvelope(format!("generation stream is not UTF-8: {e}")));
                        break;
                    }
                };
                if valid > 0 {
                    let text: Vec<u8> = pending.drain(..valid).collect();
                    yield Ok(String::from_utf8_lossy(&text).into_owned());
                }
            }
            if !failed && !pending.is_empty() {
                yield Err(ApplyError::MalformedEnvelope("generation stream ended inside a UTF-8 sequence".into()));
            }
        };
        Self::new(Box::pin(chunks))
    }
}

#[async_trait]
impl GenerationSource for LiveSource {
    async fn open(&self, session: &SandboxInfo, attempt: usize) -> Result<ChunkStream, ApplyError> {
        let state = self.state.clone();
        {
            let guard = state.lock().await;
            if attempt > 1 {
                tracing::info!(
                    session_id = %session.session_id,
                    attempt,
                    replayed = guard.recorded.len(),
                    live = guard.live.is_some(),
                    "replaying live generation"
                );
            }
        }
        let chunks = async_stream::stream! {
            let mut next = 0;
            loop {
                let mut guard = state.lock().await;
                if next < guard.recorded.len() {
                    let chunk = guard.recorded[next].clone();
                    next += 1;
                    drop(guard);
                    yield Ok(chunk);
                    continue;
                }
                let Some(live) = guard.live.as_mut() else {
                    break;
                };
                match live.next().await {
                    Some(Ok(chunk)) => {
                        guard.recorded.push(chunk.clone());
                        next += 1;
                        drop(guard);
                        yield Ok(chunk);
                    }
                    Some(Err(e)) => {
                        guard.live = None;
                        drop(guard);
                        yield Err(e);
                        break;
                    }
                    None => {
                        guard.live = None;
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(chunks))
    }
}

/// Replays a recorded stream chunk by chunk.
#[cfg(test)]
pub struct RecordedSource {
    chunks: Vec<String>,
}

#[cfg(test)]
impl RecordedSource {
    pub fn new(chunks: Vec<String>) -> Self {
        Self { chunks }
    }
}

#[cfg(test)]
#[async_trait]
impl GenerationSource for RecordedSource {
    async fn open(&self, _session: &SandboxInfo, _attempt: usize) -> Result<ChunkStream, ApplyError> {
        let chunks: Vec<Result<String, ApplyError>> = self.chunks.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

// ── Outbound progress events ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Progress reported while a request is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ApplyEvent {
    Start {
        session_id: String,
        attempt: usize,
    },
    Status {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<Stage>,
    },
    PackageProgress {
        packages: Vec<String>,
        message: String,
    },
    /// Live progress on the file being generated.
    FileProgress {
        path: String,
        bytes: usize,
    },
    CommandProgress {
        command: String,
    },
    CommandOutput {
        command: String,
        stream: OutputStream,
        output: String,
    },
    CommandComplete {
        command: String,
        exit_code: i32,
        success: bool,
    },
    Complete {
        result: ApplyResult,
    },
    Error {
        message: String,
        terminal: bool,
    },
}

/// Sending half for progress events. A receiver that went away is not an
/// error: applying continues without an audience.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ApplyEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ApplyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ApplyEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn status(&self, stage: Option<Stage>, message: impl Into<String>) {
        self.emit(ApplyEvent::Status {
            message: message.into(),
            stage,
        });
    }
}
