//! HTTP client for the remote execution backend.
//!
//! Every call carries its own abort timeout. Underlying `reqwest::Client`s
//! are pooled per timeout value so chatty exec / file traffic reuses
//! connections instead of opening one per request.
//!
//! API: POST /sessions, GET /sessions/{id}, POST /sessions/{id}/exec,
//! POST|GET /sessions/{id}/files/{write,read,list}, POST /sessions/{id}/terminate

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::sandbox::error::SandboxError;

/// Extra slack given to reqwest's own timeout so the client-side abort
/// always fires first and produces the diagnostic error.
const POOL_TIMEOUT_SLACK: Duration = Duration::from_secs(1);

/// Request payload. Strings go out verbatim, everything else as JSON.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    Text(String),
}

impl RequestBody {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, SandboxError> {
        serde_json::to_value(value)
            .map(RequestBody::Json)
            .map_err(|e| SandboxError::Serde(format!("failed to serialize request body: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct ExecClient {
    base_url: String,
    api_key: Option<String>,
    default_timeout: Duration,
    pools: Arc<Mutex<HashMap<u64, reqwest::Client>>>,
}

impl ExecClient {
    pub fn new(base_url: String, api_key: Option<String>, default_timeout: Duration) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            default_timeout,
            pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Absolute URL for a backend path. The path is always appended to the
    /// configured base, whatever it looks like.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn pooled_client(&self, timeout: Duration) -> Result<reqwest::Client, SandboxError> {
        let key = timeout.as_millis() as u64;
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| SandboxError::Backend("client pool lock poisoned".into()))?;
        if let Some(client) = pools.get(&key) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(timeout + POOL_TIMEOUT_SLACK)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| SandboxError::Backend(format!("failed to build HTTP client: {e}")))?;
        tracing::debug!(timeout_ms = key, "created pooled HTTP client");
        pools.insert(key, client.clone());
        Ok(client)
    }

    #[cfg(test)]
    fn pool_len(&self) -> usize {
        self.pools.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<T, SandboxError> {
        self.request(Method::GET, path, query, None, timeout).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T, SandboxError> {
        let body = RequestBody::json(body)?;
        self.request(Method::POST, path, &[], Some(body), timeout).await
    }

    /// Send one request and decode the response.
    ///
    /// An empty body decodes as `{}`. A non-empty body that is not JSON is a
    /// `Serde` error. 404 maps to `NotFound`; other non-2xx statuses to
    /// `Backend`. Callers hitting a session sub-resource must confirm a
    /// `NotFound` against the session before treating it as session loss.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<RequestBody>,
        timeout: Option<Duration>,
    ) -> Result<T, SandboxError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let url = self.url(path);
        let operation = format!("{method} {url}");
        let client = self.pooled_client(timeout)?;

        let mut req = client.request(method, &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req = match body {
            Some(RequestBody::Json(value)) => req
                .header(CONTENT_TYPE, "application/json")
                .body(value.to_string()),
            Some(RequestBody::Text(text)) => req
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(text),
            None => req,
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, async {
            let resp = req.send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        })
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let timeout_ms = timeout.as_millis() as u64;

        let (status, text) = match outcome {
            Err(_) => {
                tracing::warn!(%operation, timeout_ms, elapsed_ms, "backend request aborted");
                return Err(SandboxError::Transport {
                    operation,
                    timeout_ms,
                    elapsed_ms,
                    aborted: true,
                    message: "request exceeded its timeout".into(),
                });
            }
            Ok(Err(e)) => {
                tracing::warn!(%operation, elapsed_ms, error = %e, "backend request failed");
                return Err(SandboxError::Transport {
                    operation,
                    timeout_ms,
                    elapsed_ms,
                    aborted: e.is_timeout(),
                    message: e.to_string(),
                });
            }
            Ok(Ok(pair)) => pair,
        };

        tracing::debug!(%operation, status = status.as_u16(), elapsed_ms, "backend request done");

        if status.as_u16() == 404 {
            return Err(SandboxError::NotFound(format!("{operation} returned 404: {text}")));
        }
        if !status.is_success() {
            return Err(SandboxError::Backend(format!(
                "{operation} returned {status}: {text}"
            )));
        }

        if text.trim().is_empty() {
            return serde_json::from_value(Value::Object(serde_json::Map::new())).map_err(|e| {
                SandboxError::Serde(format!("{operation} returned an empty body: {e}"))
            });
        }
        serde_json::from_str(&text)
            .map_err(|e| SandboxError::Serde(format!("{operation} returned unparseable body: {e}")))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize)]
    struct Created {
        session_id: String,
    }

    #[derive(Debug, Default, Deserialize)]
    struct Ack {
        #[serde(default)]
        ok: bool,
    }

    fn client(base: &str) -> ExecClient {
        ExecClient::new(base.into(), Some("sk-test".into()), Duration::from_secs(5))
    }

    #[test]
    fn url_joins_base_and_relative_path() {
        let c = ExecClient::new("http://backend:8080/".into(), None, Duration::from_secs(1));
        assert_eq!(c.url("/sessions"), "http://backend:8080/sessions");
        assert_eq!(c.url("sessions/abc/exec"), "http://backend:8080/sessions/abc/exec");
        assert_eq!(
            c.url("http://elsewhere/x"),
            "http://backend:8080/http://elsewhere/x"
        );
    }

    #[test]
    fn empty_api_key_is_ignored() {
        let c = ExecClient::new("http://b".into(), Some(String::new()), Duration::from_secs(1));
        assert!(c.api_key.is_none());
    }

    #[tokio::test]
    async fn post_sends_bearer_and_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({ "ports": [5173] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "session_id": "s-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let created: Created = client(&server.uri())
            .post("/sessions", &json!({ "ports": [5173] }), None)
            .await
            .unwrap();
        assert_eq!(created.session_id, "s-1");
    }

    #[tokio::test]
    async fn get_passes_query_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions/s-1/files/read"))
            .and(query_param("path", "src/App.jsx"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .mount(&server)
            .await;

        let ack: Ack = client(&server.uri())
            .get("/sessions/s-1/files/read", &[("path", "src/App.jsx")], None)
            .await
            .unwrap();
        assert!(ack.ok);
    }

    #[tokio::test]
    async fn empty_body_is_empty_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s-1/terminate"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let ack: Ack = client(&server.uri())
            .post("/sessions/s-1/terminate", &json!({}), None)
            .await
            .unwrap();
        assert!(!ack.ok);

        let raw: Value = client(&server.uri())
            .post("/sessions/s-1/terminate", &json!({}), None)
            .await
            .unwrap();
        assert_eq!(raw, json!({}));
    }

    #[tokio::test]
    async fn non_json_body_is_hard_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions/s-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .get::<Value>("/sessions/s-1", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Serde(_)));
    }

    #[tokio::test]
    async fn not_found_status_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sessions/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("unknown session"))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .get::<Value>("/sessions/gone", &[], None)
            .await
            .unwrap_err();
        assert!(err.is_session_missing());
    }

    #[tokio::test]
    async fn server_error_maps_to_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("at capacity"))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .post::<Value, _>("/sessions", &json!({}), None)
            .await
            .unwrap_err();
        match err {
            SandboxError::Backend(msg) => {
                assert!(msg.contains("503"));
                assert!(msg.contains("at capacity"));
            }
            other => panic!("expected Backend, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_reports_elapsed_and_abort() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions/s-1/exec"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "exit_code": 0 }))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .post::<Value, _>(
                "/sessions/s-1/exec",
                &json!({ "command": "sleep 10" }),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(err.is_transport());
        assert!(msg.contains("timeout 100ms"), "{msg}");
        assert!(msg.contains("(aborted)"), "{msg}");
        assert!(msg.contains("POST "), "{msg}");
        match err {
            SandboxError::Transport { elapsed_ms, aborted, .. } => {
                assert!(aborted);
                assert!(elapsed_ms >= 100);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn clients_are_pooled_per_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let _: Value = c.get("/a", &[], None).await.unwrap();
        let _: Value = c.get("/b", &[], None).await.unwrap();
        assert_eq!(c.pool_len(), 1);

        let _: Value = c.get("/c", &[], Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(c.pool_len(), 2);

        let cloned = c.clone();
        let _: Value = cloned.get("/d", &[], Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(c.pool_len(), 2);
    }
}
