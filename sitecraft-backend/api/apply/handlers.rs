use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;

use crate::api::AppState;
use crate::apply::events::{ApplyEvent, EventSink, GenerationSource, LiveSource, ResponseSource};
use crate::apply::{ApplyEngine, ApplyRequest};
use crate::preview::{HeadlessSurface, PreviewReadinessController, ReadinessOutcome};

#[derive(Debug, Deserialize)]
pub(crate) struct ApplyBody {
    /// Full model response containing `<file>` blocks.
    pub response: String,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub known_files: Vec<String>,
}

/// POST /api/sessions/{id}/apply — apply a model response, streaming
/// progress as SSE. The last event is `complete` or a terminal `error`.
pub(crate) async fn apply_response(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ApplyBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!(session_id = %id, bytes = body.response.len(), "apply requested");

    let request = ApplyRequest {
        session_hint: Some(id),
        known_files: body.known_files,
        packages: Vec::new(),
    };
    let source = ResponseSource::new(body.response, body.packages);
    progress_stream(state.engine.clone(), source, request)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct StreamQuery {
    /// Comma-separated paths that already exist in the session.
    pub known_files: String,
    /// Comma-separated packages to install besides the generated ones.
    pub packages: String,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// POST /api/sessions/{id}/apply/stream — the request body is the live
/// generation stream (NDJSON or SSE envelopes). Files are applied while the
/// body is still arriving; progress comes back as SSE.
pub(crate) async fn apply_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    body: Body,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!(session_id = %id, "streaming apply requested");

    let request = ApplyRequest {
        session_hint: Some(id),
        known_files: split_list(&query.known_files),
        packages: split_list(&query.packages),
    };
    let source = LiveSource::from_bytes(body.into_data_stream());
    progress_stream(state.engine.clone(), source, request)
}

fn progress_stream<S>(
    engine: Arc<ApplyEngine>,
    source: S,
    request: ApplyRequest,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: GenerationSource + 'static,
{
    let (sink, mut rx) = EventSink::channel();

    // Runs to completion even if the client disconnects.
    tokio::spawn(async move {
        let _ = engine.apply_generated_output(&source, request, &sink).await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok(to_sse(&event));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: &ApplyEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode apply event");
            Event::default().event("error").data(e.to_string())
        }
    }
}

/// POST /api/sessions/{id}/preview/verify — wait until the session's
/// preview is served, recreating the session if it has to.
pub(crate) async fn verify_preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ReadinessOutcome> {
    let controller = PreviewReadinessController::new(
        state.registry.clone(),
        Arc::new(HeadlessSurface::new()),
        state.probe.clone(),
        state.readiness.clone(),
    )
    .with_checkpoints(state.checkpoints.clone());
    Json(controller.ensure_ready(&id).await)
}
