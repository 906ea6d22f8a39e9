use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::middleware;
use super::AppState;

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route("/", get(health));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .nest("/health", health_routes)
        .nest("/api", api_router())
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
}

fn api_router() -> Router<AppState> {
    Router::new()
        .merge(super::sessions::router())
        .merge(super::apply::router())
}

async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "provider": state.config.sandbox.kind(),
        "sessions": state.registry.session_ids().await.len(),
    }))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::checkpoint::CheckpointLog;
    use crate::apply::{ApplyEngine, ApplyPolicy};
    use crate::config::Config;
    use crate::preview::{HttpProbe, ReadinessPolicy};
    use crate::sandbox::testing::{FakeBackend, FakeFactory};
    use crate::sessions::SessionRegistry;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn serve() -> (Arc<FakeBackend>, String) {
        let backend = FakeBackend::new();
        let registry = SessionRegistry::new(FakeFactory::new(backend.clone()));
        let checkpoints = CheckpointLog::new();
        let engine = ApplyEngine::new(registry.clone(), checkpoints.clone(), ApplyPolicy::default());
        let state = AppState {
            config: Arc::new(Config::from_lookup(|_| None)),
            registry,
            engine: Arc::new(engine),
            checkpoints,
            probe: Arc::new(HttpProbe::new(Duration::from_secs(1)).unwrap()),
            readiness: ReadinessPolicy::default(),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        (backend, format!("http://{addr}"))
    }

    #[tokio::test]
    async fn health_and_unknown_paths() {
        let (_backend, base) = serve().await;
        let client = reqwest::Client::new();

        let health: Value = client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["provider"], "local");

        let missing = client.get(format!("{base}/nope")).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_lifecycle_over_http() {
        let (backend, base) = serve().await;
        let client = reqwest::Client::new();

        let info: Value = client
            .post(format!("{base}/api/sessions"))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = info["session_id"].as_str().unwrap().to_string();
        assert_eq!(id, "fake-1");

        let ran: Value = client
            .post(format!("{base}/api/sessions/{id}/commands"))
            .json(&json!({ "command": "ls" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ran["success"], true);

        let status: Value = client
            .get(format!("{base}/api/sessions/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["active"], true);
        assert_eq!(status["healthy"], true);

        let gone = client
            .post(format!("{base}/api/sessions/unknown/commands"))
            .json(&json!({ "command": "ls" }))
            .send()
            .await
            .unwrap();
        assert_eq!(gone.status(), reqwest::StatusCode::NOT_FOUND);

        let deleted = client.delete(format!("{base}/api/sessions/{id}")).send().await.unwrap();
        assert!(deleted.status().is_success());
        assert_eq!(backend.terminate_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn apply_streams_events_and_records_checkpoint() {
        let (backend, base) = serve().await;
        let client = reqwest::Client::new();
        let info: Value = client
            .post(format!("{base}/api/sessions"))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = info["session_id"].as_str().unwrap().to_string();

        let body = client
            .post(format!("{base}/api/sessions/{id}/apply"))
            .json(&json!({ "response": "<file path=\"src/App.jsx\">export default 1</file>" }))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        let events: Vec<Value> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();
        assert_eq!(events.first().unwrap()["type"], "start");
        let last = events.last().unwrap();
        assert_eq!(last["type"], "complete");
        assert_eq!(last["result"]["files_created"][0], "src/App.jsx");
        assert!(backend.files.lock().unwrap().contains_key("src/App.jsx"));

        let checkpoints: Value = client
            .get(format!("{base}/api/sessions/{id}/checkpoints"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(checkpoints["checkpoints"].as_array().unwrap().len(), 1);

        client.delete(format!("{base}/api/sessions/{id}")).send().await.unwrap();
        let after: Value = client
            .get(format!("{base}/api/sessions/{id}/checkpoints"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(after["checkpoints"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_stream_reads_envelopes_from_request_body() {
        let (backend, base) = serve().await;
        let client = reqwest::Client::new();
        let info: Value = client
            .post(format!("{base}/api/sessions"))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = info["session_id"].as_str().unwrap().to_string();

        let ndjson = [
            json!({ "type": "stream", "text": "<file path=\"src/App.jsx\">export " }),
            json!({ "type": "stream", "text": "default 2</file>" }),
            json!({ "type": "package", "name": "clsx" }),
        ]
        .iter()
        .map(|v| format!("{v}\n"))
        .collect::<String>();

        let body = client
            .post(format!("{base}/api/sessions/{id}/apply/stream?packages=zod"))
            .header("content-type", "application/x-ndjson")
            .body(ndjson)
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        let events: Vec<Value> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();
        assert!(events.iter().any(|e| e["type"] == "file-progress"));
        let last = events.last().unwrap();
        assert_eq!(last["type"], "complete");
        assert_eq!(last["result"]["packages_installed"], json!(["zod", "clsx"]));
        assert_eq!(
            backend.files.lock().unwrap().get("src/App.jsx").unwrap(),
            "export default 2"
        );
    }
}
