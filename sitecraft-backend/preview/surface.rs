use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// The thing showing the preview to the user (an iframe in the browser,
/// or nothing at all for headless callers).
#[async_trait]
pub trait PreviewSurface: Send + Sync {
    /// Mounted and able to take a target url.
    async fn is_mounted(&self) -> bool;

    /// Reload at `url`, which already carries a cache-busting parameter.
    async fn reload(&self, url: &str);

    /// Tear the surface down and mount a fresh one at the current target.
    async fn recreate(&self);

    /// Point the surface at a different session's url.
    async fn retarget(&self, url: &str);
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, url: &str) -> bool;
}

/// `url` with a `t=<millis>` query parameter appended.
pub fn cache_busted(url: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}t={}", chrono::Utc::now().timestamp_millis())
}

// ── HTTP probe ──────────────────────────────────────────────────────

/// Reachable means the dev server answered with a success or redirect.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                tracing::debug!(%url, %status, "preview probe");
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                tracing::debug!(%url, error = %e, "preview probe failed");
                false
            }
        }
    }
}

// ── Headless surface ────────────────────────────────────────────────

/// Surface for callers with no UI. Always mounted; only tracks the target.
#[derive(Default)]
pub struct HeadlessSurface {
    target: RwLock<Option<String>>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn target(&self) -> Option<String> {
        self.target.read().await.clone()
    }
}

#[async_trait]
impl PreviewSurface for HeadlessSurface {
    async fn is_mounted(&self) -> bool {
        true
    }

    async fn reload(&self, url: &str) {
        tracing::debug!(%url, "headless preview reload");
    }

    async fn recreate(&self) {}

    async fn retarget(&self, url: &str) {
        *self.target.write().await = Some(url.to_string());
    }
}
