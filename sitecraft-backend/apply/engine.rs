//! Drives one user request from generation stream to applied files.
//!
//! Each attempt acquires a provider, reads the generation, extracts the
//! payload and runs the stages analyze → install → write → run → restart.
//! A lost session restarts the whole request in a fresh session, at most
//! `retry_budget` times.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::checkpoint::CheckpointLog;
use super::events::{
    decode_envelope, ApplyEvent, EventSink, GenerationEvent, GenerationSource, LineFramer,
    OutputStream,
};
use super::parser::{ChangeType, StreamingFileParser};
use super::payload::{extract_payload, ApplyPayload, PayloadPolicy};
use super::{ApplyError, ApplyResult, ExecutedCommand, Stage};
use crate::sandbox::{SandboxError, SandboxInfo, SandboxProvider, SessionId};
use crate::sessions::SessionRegistry;

#[derive(Debug, Clone)]
pub struct ApplyPolicy {
    /// Fresh-session retries after the session goes missing.
    pub retry_budget: usize,
    /// Run `setup_runtime` before reading the generation.
    pub ensure_runtime: bool,
    pub restart_after_apply: bool,
    pub payload: PayloadPolicy,
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        Self {
            retry_budget: 2,
            ensure_runtime: true,
            restart_after_apply: true,
            payload: PayloadPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyRequest {
    /// Session to apply to. Without one the registry's active session is
    /// used, or a new one is provisioned.
    pub session_hint: Option<SessionId>,
    /// Paths the caller already knows about, merged with the session's
    /// file listing to classify created vs modified.
    pub known_files: Vec<String>,
    /// Packages to install in addition to the ones the generation names.
    pub packages: Vec<String>,
}

struct InFlight {
    seq: u64,
    token: CancellationToken,
    lock: Arc<tokio::sync::Mutex<()>>,
}

/// Claim on a session for one attempt. Dropping it clears the in-flight
/// entry unless a newer request already replaced it.
struct Ticket {
    map: Arc<Mutex<HashMap<SessionId, InFlight>>>,
    session_id: SessionId,
    seq: u64,
    token: CancellationToken,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut map = match self.map.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if map.get(&self.session_id).is_some_and(|f| f.seq == self.seq) {
            map.remove(&self.session_id);
        }
    }
}

pub struct ApplyEngine {
    registry: SessionRegistry,
    checkpoints: CheckpointLog,
    policy: ApplyPolicy,
    in_flight: Arc<Mutex<HashMap<SessionId, InFlight>>>,
    seq: AtomicU64,
}

impl ApplyEngine {
    pub fn new(registry: SessionRegistry, checkpoints: CheckpointLog, policy: ApplyPolicy) -> Self {
        Self {
            registry,
            checkpoints,
            policy,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn checkpoints(&self) -> &CheckpointLog {
        &self.checkpoints
    }

    /// Apply one generation. Progress goes to `events`; the final result (or
    /// terminal error) is emitted there too before being returned.
    pub async fn apply_generated_output(
        &self,
        source: &dyn GenerationSource,
        request: ApplyRequest,
        events: &EventSink,
    ) -> Result<ApplyResult, ApplyError> {
        let attempts = self.policy.retry_budget + 1;
        let mut fresh = false;
        let mut last_missing = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                events.status(None, "Sandbox session expired, recreating…");
            }
            match self.attempt(source, &request, attempt, fresh, events).await {
                Ok(result) => {
                    tracing::info!(
                        session_id = %result.session_id,
                        attempt,
                        created = result.files_created.len(),
                        updated = result.files_updated.len(),
                        errors = result.errors.len(),
                        "apply finished"
                    );
                    events.emit(ApplyEvent::Complete {
                        result: result.clone(),
                    });
                    return Ok(result);
                }
                Err(e) if e.is_session_missing() => {
                    tracing::warn!(attempt, attempts, error = %e, "session lost during apply");
                    fresh = true;
                    last_missing = Some(e);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "apply failed");
                    events.emit(ApplyEvent::Error {
                        message: e.to_string(),
                        terminal: true,
                    });
                    return Err(e);
                }
            }
        }

        let err = ApplyError::RecoveryExhausted {
            attempts,
            last: last_missing.map(|e| e.to_string()).unwrap_or_default(),
        };
        tracing::error!(error = %err, "giving up on apply");
        events.emit(ApplyEvent::Error {
            message: err.to_string(),
            terminal: true,
        });
        Err(err)
    }

    async fn acquire(&self, hint: Option<&str>, fresh: bool) -> Result<Arc<dyn SandboxProvider>, ApplyError> {
        if fresh {
            return Ok(self.registry.create_provider(None).await?);
        }
        match hint {
            Some(id) => Ok(self.registry.get_or_create_provider(id).await?),
            None => match self.registry.active_provider().await {
                Some(provider) => Ok(provider),
                None => Ok(self.registry.create_provider(None).await?),
            },
        }
    }

    /// Register a new request on `session_id`, cancelling the one in flight.
    fn begin(&self, session_id: &str) -> Ticket {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let mut map = match self.in_flight.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let lock = match map.get(session_id) {
            Some(previous) => {
                tracing::info!(%session_id, "cancelling in-flight apply for newer request");
                previous.token.cancel();
                previous.lock.clone()
            }
            None => Arc::new(tokio::sync::Mutex::new(())),
        };
        map.insert(
            session_id.to_string(),
            InFlight {
                seq,
                token: token.clone(),
                lock: lock.clone(),
            },
        );
        Ticket {
            map: self.in_flight.clone(),
            session_id: session_id.to_string(),
            seq,
            token,
            lock,
        }
    }

    async fn attempt(
        &self,
        source: &dyn GenerationSource,
        request: &ApplyRequest,
        attempt: usize,
        fresh: bool,
        events: &EventSink,
    ) -> Result<ApplyResult, ApplyError> {
        let provider = self.acquire(request.session_hint.as_deref(), fresh).await?;
        let info = provider.require_session().await?;

        let ticket = self.begin(&info.session_id);
        let _exclusive = tokio::select! {
            biased;
            _ = ticket.token.cancelled() => return Err(ApplyError::Cancelled { stage: Stage::Stream }),
            guard = ticket.lock.clone().lock_owned() => guard,
        };

        let outcome = self
            .run_attempt(provider.as_ref(), &info, source, request, attempt, &ticket.token, events)
            .await;
        if let Err(e) = &outcome {
            if e.is_session_missing() {
                self.registry.forget(&info.session_id).await;
                self.checkpoints.remove(&info.session_id).await;
                tracing::warn!(
                    orphaned_session = %info.session_id,
                    "dropping lost session, work applied there is abandoned"
                );
            }
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        provider: &dyn SandboxProvider,
        info: &SandboxInfo,
        source: &dyn GenerationSource,
        request: &ApplyRequest,
        attempt: usize,
        token: &CancellationToken,
        events: &EventSink,
    ) -> Result<ApplyResult, ApplyError> {
        events.emit(ApplyEvent::Start {
            session_id: info.session_id.clone(),
            attempt,
        });

        if self.policy.ensure_runtime {
            events.status(None, "Preparing sandbox runtime");
            guarded(token, Stage::Stream, provider.setup_runtime()).await?;
        }

        let mut known = guarded(token, Stage::Stream, provider.list_files("")).await?;
        known.extend(request.known_files.iter().cloned());
        known.sort();
        known.dedup();

        let mut stream = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ApplyError::Cancelled { stage: Stage::Stream }),
            opened = source.open(info, attempt) => opened?,
        };

        let mut reader = StreamReader::new(&known, request.packages.clone());
        let mut framer = LineFramer::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ApplyError::Cancelled { stage: Stage::Stream }),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            for line in framer.push(&chunk?) {
                reader.handle_line(&line, events)?;
            }
        }
        if let Some(rest) = framer.finish() {
            reader.handle_line(&rest, events)?;
        }

        let (text, packages) = reader.into_payload_text()?;
        let payload = extract_payload(&text, &known, &packages, &self.policy.payload);
        if payload.is_empty() {
            return Err(ApplyError::EmptyGeneration);
        }
        self.apply_payload(provider, info, payload, attempt, token, events)
            .await
    }

    async fn apply_payload(
        &self,
        provider: &dyn SandboxProvider,
        info: &SandboxInfo,
        payload: ApplyPayload,
        attempt: usize,
        token: &CancellationToken,
        events: &EventSink,
    ) -> Result<ApplyResult, ApplyError> {
        let mut result = ApplyResult {
            session_id: info.session_id.clone(),
            attempts: attempt,
            files_skipped: payload.skipped.clone(),
            ..ApplyResult::default()
        };

        // ── Analyze ──
        check(token, Stage::Analyze)?;
        events.status(
            Some(Stage::Analyze),
            format!(
                "Analyzing {} files, {} packages, {} commands",
                payload.files.len(),
                payload.packages.len(),
                payload.commands.len()
            ),
        );

        // ── Install ──
        if !payload.packages.is_empty() {
            check(token, Stage::Install)?;
            events.emit(ApplyEvent::PackageProgress {
                packages: payload.packages.clone(),
                message: format!("Installing {} packages", payload.packages.len()),
            });
            match guarded(token, Stage::Install, provider.install_packages(&payload.packages)).await {
                Ok(out) if out.success => {
                    result.packages_installed = payload.packages.clone();
                    events.emit(ApplyEvent::PackageProgress {
                        packages: payload.packages.clone(),
                        message: "Packages installed".into(),
                    });
                }
                Ok(out) => {
                    let message = format!(
                        "package install exited {}: {}",
                        out.exit_code,
                        out.stderr.trim()
                    );
                    tracing::warn!(session_id = %info.session_id, packages = ?payload.packages, %message, "package install failed");
                    result.packages_failed = payload.packages.clone();
                    result.errors.push(message.clone());
                    events.emit(ApplyEvent::Error {
                        message,
                        terminal: false,
                    });
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(session_id = %info.session_id, error = %e, "package install failed");
                    result.packages_failed = payload.packages.clone();
                    result.errors.push(format!("package install: {e}"));
                    events.emit(ApplyEvent::Error {
                        message: e.to_string(),
                        terminal: false,
                    });
                }
            }
        }

        // ── Write ──
        check(token, Stage::Write)?;
        events.status(Some(Stage::Write), format!("Writing {} files", payload.files.len()));
        for file in &payload.files {
            if file.content.is_empty() {
                result.files_skipped.push(file.path.clone());
                continue;
            }
            match guarded(token, Stage::Write, provider.write_file(&file.path, &file.content)).await {
                Ok(()) => match file.change_type {
                    ChangeType::Created => result.files_created.push(file.path.clone()),
                    ChangeType::Modified => result.files_updated.push(file.path.clone()),
                },
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(session_id = %info.session_id, path = %file.path, error = %e, "file write failed");
                    result.errors.push(format!("{}: {e}", file.path));
                }
            }
        }

        // ── Run ──
        if !payload.commands.is_empty() {
            check(token, Stage::Run)?;
        }
        for command in &payload.commands {
            events.emit(ApplyEvent::CommandProgress {
                command: command.clone(),
            });
            match guarded(token, Stage::Run, provider.run_command(command)).await {
                Ok(out) => {
                    for (stream, text) in [(OutputStream::Stdout, &out.stdout), (OutputStream::Stderr, &out.stderr)] {
                        if !text.is_empty() {
                            events.emit(ApplyEvent::CommandOutput {
                                command: command.clone(),
                                stream,
                                output: text.clone(),
                            });
                        }
                    }
                    events.emit(ApplyEvent::CommandComplete {
                        command: command.clone(),
                        exit_code: out.exit_code,
                        success: out.success,
                    });
                    if !out.success {
                        result.errors.push(format!("`{command}` exited {}", out.exit_code));
                    }
                    result.commands_executed.push(ExecutedCommand {
                        command: command.clone(),
                        exit_code: out.exit_code,
                        success: out.success,
                    });
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(session_id = %info.session_id, %command, error = %e, "command failed");
                    result.errors.push(format!("`{command}`: {e}"));
                }
            }
        }

        // ── Restart ──
        if self.policy.restart_after_apply {
            check(token, Stage::Restart)?;
            events.status(Some(Stage::Restart), "Restarting dev server");
            match guarded(token, Stage::Restart, provider.restart_dev_server()).await {
                Ok(()) => {}
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(session_id = %info.session_id, error = %e, "dev server restart failed");
                    result.errors.push(format!("dev server restart: {e}"));
                }
            }
        }

        if result.files_written() > 0 && result.errors.is_empty() {
            let files: Vec<String> = result
                .files_created
                .iter()
                .chain(&result.files_updated)
                .cloned()
                .collect();
            let label = format!(
                "{} created, {} updated",
                result.files_created.len(),
                result.files_updated.len()
            );
            result.checkpoint = Some(self.checkpoints.record(&info.session_id, label, files).await);
        }

        Ok(result)
    }
}

/// Folds decoded envelopes into the text and packages of one generation.
struct StreamReader {
    parser: StreamingFileParser,
    packages: Vec<String>,
    completed: Option<String>,
}

impl StreamReader {
    fn new(known: &[String], packages: Vec<String>) -> Self {
        Self {
            parser: StreamingFileParser::new(known),
            packages,
            completed: None,
        }
    }

    fn handle_line(&mut self, line: &str, events: &EventSink) -> Result<(), ApplyError> {
        match decode_envelope(line)? {
            None | Some(GenerationEvent::Unknown) => {}
            Some(GenerationEvent::Stream { text }) => {
                for entry in self.parser.push(&text) {
                    events.status(
                        Some(Stage::Stream),
                        format!("Generated {} ({:?})", entry.path, entry.change_type),
                    );
                }
                if let Some(current) = self.parser.current() {
                    events.emit(ApplyEvent::FileProgress {
                        path: current.path.clone(),
                        bytes: current.content.len(),
                    });
                }
            }
            Some(GenerationEvent::Package { name }) => {
                events.emit(ApplyEvent::PackageProgress {
                    packages: vec![name.clone()],
                    message: format!("Queued {name}"),
                });
                self.packages.push(name);
            }
            Some(GenerationEvent::Complete {
                generated_code,
                packages,
            }) => {
                self.packages.extend(packages);
                self.completed = Some(generated_code);
            }
            Some(GenerationEvent::Error { error, code }) => {
                return Err(GenerationEvent::into_error(error, code));
            }
        }
        Ok(())
    }

    /// The text to apply: the completion payload, or the streamed text when
    /// the stream ended early but produced at least one whole file.
    fn into_payload_text(self) -> Result<(String, Vec<String>), ApplyError> {
        match self.completed {
            Some(code) => Ok((code, self.packages)),
            None if !self.parser.completed().is_empty() => {
                tracing::warn!(
                    files = self.parser.completed().len(),
                    "stream ended without completion, applying streamed output"
                );
                Ok((self.parser.text().to_string(), self.packages))
            }
            None => Err(ApplyError::EmptyGeneration),
        }
    }
}

fn check(token: &CancellationToken, stage: Stage) -> Result<(), ApplyError> {
    if token.is_cancelled() {
        tracing::info!(%stage, "apply cancelled");
        Err(ApplyError::Cancelled { stage })
    } else {
        Ok(())
    }
}

/// Await a provider call unless the request is cancelled first.
async fn guarded<T, F>(token: &CancellationToken, stage: Stage, fut: F) -> Result<T, ApplyError>
where
    F: Future<Output = Result<T, SandboxError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ApplyError::Cancelled { stage }),
        out = fut => out.map_err(ApplyError::from),
    }
}

/// Errors that end the attempt instead of being recorded in the result.
fn is_fatal(err: &ApplyError) -> bool {
    err.is_session_missing() || matches!(err, ApplyError::Cancelled { .. })
}
