//! Decides when a session's preview is actually being served.
//!
//! After an apply, the dev server may take a few seconds to come back. The
//! controller polls health, then escalates: reload the surface, recreate
//! the surface, and finally provision a new session within a small budget.

pub mod surface;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::apply::checkpoint::CheckpointLog;
use crate::sessions::SessionRegistry;
pub use surface::{cache_busted, HeadlessSurface, HttpProbe, PreviewSurface, ReachabilityProbe};

#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub poll_attempts: usize,
    pub poll_interval: Duration,
    /// Wait after a reload or surface recreation before checking again.
    pub settle_wait: Duration,
    /// Delay before retrying when the url or surface is not available yet.
    pub rearm_delay: Duration,
    pub max_rearms: usize,
    /// Session recreations allowed over the controller's lifetime.
    pub recreate_budget: usize,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            poll_attempts: 12,
            poll_interval: Duration::from_secs(1),
            settle_wait: Duration::from_secs(2),
            rearm_delay: Duration::from_millis(500),
            max_rearms: 20,
            recreate_budget: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReadinessOutcome {
    Ready {
        session_id: String,
        url: String,
        /// Health checks it took.
        checks: usize,
        recreated_sessions: usize,
    },
    /// The session may still work; only the preview is unconfirmed.
    Unreachable {
        session_id: String,
        url: Option<String>,
        reason: String,
        recreated_sessions: usize,
    },
}

impl ReadinessOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessOutcome::Ready { .. })
    }
}

pub struct PreviewReadinessController {
    registry: SessionRegistry,
    surface: Arc<dyn PreviewSurface>,
    probe: Arc<dyn ReachabilityProbe>,
    policy: ReadinessPolicy,
    checkpoints: Option<CheckpointLog>,
    /// Session recreations spent so far. Also serializes concurrent checks.
    recreated: Mutex<usize>,
}

impl PreviewReadinessController {
    pub fn new(
        registry: SessionRegistry,
        surface: Arc<dyn PreviewSurface>,
        probe: Arc<dyn ReachabilityProbe>,
        policy: ReadinessPolicy,
    ) -> Self {
        Self {
            registry,
            surface,
            probe,
            policy,
            checkpoints: None,
            recreated: Mutex::new(0),
        }
    }

    /// Drop the checkpoint history of sessions this controller replaces.
    pub fn with_checkpoints(mut self, checkpoints: CheckpointLog) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Wait until `session_id`'s preview is served, escalating as needed.
    /// A check that arrives while another one runs waits for it, then
    /// starts from the first step.
    pub async fn ensure_ready(&self, session_id: &str) -> ReadinessOutcome {
        let mut recreated = self.recreated.lock().await;
        let mut session_id = session_id.to_string();
        let mut recreated_here = 0;
        let mut checks = 0;

        let Some(mut url) = self.wait_for_target(&session_id).await else {
            tracing::warn!(%session_id, "preview target never became available");
            return ReadinessOutcome::Unreachable {
                session_id,
                url: None,
                reason: "preview url or surface never became available".into(),
                recreated_sessions: 0,
            };
        };

        loop {
            for attempt in 1..=self.policy.poll_attempts {
                checks += 1;
                if self.healthy(&session_id, &url).await {
                    return self.ready(session_id, url, checks, recreated_here);
                }
                if attempt < self.policy.poll_attempts {
                    sleep(self.policy.poll_interval).await;
                }
            }

            tracing::info!(%session_id, "preview not reachable, forcing reload");
            self.surface.reload(&cache_busted(&url)).await;
            sleep(self.policy.settle_wait).await;
            checks += 1;
            if self.healthy(&session_id, &url).await {
                return self.ready(session_id, url, checks, recreated_here);
            }

            tracing::info!(%session_id, "preview still unreachable, recreating surface");
            self.surface.recreate().await;
            sleep(self.policy.settle_wait).await;
            checks += 1;
            if self.healthy(&session_id, &url).await {
                return self.ready(session_id, url, checks, recreated_here);
            }

            if *recreated >= self.policy.recreate_budget {
                tracing::warn!(
                    %session_id,
                    %url,
                    checks,
                    budget = self.policy.recreate_budget,
                    "preview unreachable, session recreate budget spent"
                );
                return ReadinessOutcome::Unreachable {
                    session_id,
                    url: Some(url),
                    reason: format!("preview not reachable after {checks} checks"),
                    recreated_sessions: recreated_here,
                };
            }

            *recreated += 1;
            recreated_here += 1;
            match self.replace_session(&session_id).await {
                Ok((new_id, new_url)) => {
                    self.surface.retarget(&new_url).await;
                    session_id = new_id;
                    url = new_url;
                }
                Err(reason) => {
                    tracing::warn!(%session_id, %reason, "could not replace session for preview");
                    return ReadinessOutcome::Unreachable {
                        session_id,
                        url: Some(url),
                        reason,
                        recreated_sessions: recreated_here,
                    };
                }
            }
        }
    }

    /// Session recreations spent so far.
    pub async fn recreations(&self) -> usize {
        *self.recreated.lock().await
    }

    /// Re-arm until the session reports a url and the surface is mounted.
    async fn wait_for_target(&self, session_id: &str) -> Option<String> {
        for rearm in 0..=self.policy.max_rearms {
            let url = self
                .registry
                .check_session_status(session_id)
                .await
                .info
                .and_then(|info| info.url);
            if let Some(url) = url {
                if self.surface.is_mounted().await {
                    return Some(url);
                }
            }
            if rearm < self.policy.max_rearms {
                tracing::debug!(%session_id, rearm, "preview target not ready, re-arming");
                sleep(self.policy.rearm_delay).await;
            }
        }
        None
    }

    async fn healthy(&self, session_id: &str, url: &str) -> bool {
        self.registry.check_session_status(session_id).await.healthy && self.probe.is_reachable(url).await
    }

    fn ready(&self, session_id: String, url: String, checks: usize, recreated_sessions: usize) -> ReadinessOutcome {
        tracing::info!(%session_id, %url, checks, "preview ready");
        ReadinessOutcome::Ready {
            session_id,
            url,
            checks,
            recreated_sessions,
        }
    }

    /// Provision a fresh session with a running dev server and drop the old one.
    async fn replace_session(&self, old_id: &str) -> Result<(String, String), String> {
        let provider = self
            .registry
            .create_provider(None)
            .await
            .map_err(|e| format!("session recreate failed: {e}"))?;
        provider
            .setup_runtime()
            .await
            .map_err(|e| format!("runtime setup on new session failed: {e}"))?;
        let info = provider.require_session().await.map_err(|e| e.to_string())?;
        let url = info
            .url
            .ok_or_else(|| format!("new session {} has no preview url", info.session_id))?;

        if let Err(e) = self.registry.terminate_session(old_id).await {
            tracing::warn!(session_id = %old_id, error = %e, "failed to terminate replaced session");
        }
        if let Some(checkpoints) = &self.checkpoints {
            checkpoints.remove(old_id).await;
        }
        tracing::info!(old = %old_id, new = %info.session_id, "preview moved to new session");
        Ok((info.session_id, url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::{FakeBackend, FakeFactory};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Reachable once it has been asked `ready_after` times, or always for
    /// urls containing `good_host`.
    #[derive(Default)]
    struct ScriptedProbe {
        calls: AtomicUsize,
        ready_after: Option<usize>,
        good_host: Option<&'static str>,
    }

    #[async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn is_reachable(&self, url: &str) -> bool {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.ready_after.is_some_and(|after| n >= after)
                || self.good_host.is_some_and(|host| url.contains(host))
        }
    }

    #[derive(Default)]
    struct RecordingSurface {
        unmounted: AtomicBool,
        reloads: std::sync::Mutex<Vec<String>>,
        recreates: AtomicUsize,
        retargets: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PreviewSurface for RecordingSurface {
        async fn is_mounted(&self) -> bool {
            !self.unmounted.load(Ordering::SeqCst)
        }
        async fn reload(&self, url: &str) {
            self.reloads.lock().unwrap().push(url.to_string());
        }
        async fn recreate(&self) {
            self.recreates.fetch_add(1, Ordering::SeqCst);
        }
        async fn retarget(&self, url: &str) {
            self.retargets.lock().unwrap().push(url.to_string());
        }
    }

    async fn setup(
        probe: ScriptedProbe,
    ) -> (Arc<FakeBackend>, SessionRegistry, Arc<RecordingSurface>, PreviewReadinessController) {
        let backend = FakeBackend::new();
        let registry = SessionRegistry::new(FakeFactory::new(backend.clone()));
        let surface = Arc::new(RecordingSurface::default());
        let controller = PreviewReadinessController::new(
            registry.clone(),
            surface.clone(),
            Arc::new(probe),
            ReadinessPolicy::default(),
        );
        (backend, registry, surface, controller)
    }

    #[tokio::test(start_paused = true)]
    async fn stops_polling_at_first_success() {
        let (_backend, registry, surface, controller) = setup(ScriptedProbe {
            ready_after: Some(3),
            ..Default::default()
        })
        .await;
        let info = registry.create_session(None).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = controller.ensure_ready(&info.session_id).await;

        assert_eq!(
            outcome,
            ReadinessOutcome::Ready {
                session_id: "fake-1".into(),
                url: "http://fake-1.test".into(),
                checks: 3,
                recreated_sessions: 0,
            }
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
        assert!(surface.reloads.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reload_is_cache_busted_and_can_fix_it() {
        let (_backend, registry, surface, controller) = setup(ScriptedProbe {
            ready_after: Some(13),
            ..Default::default()
        })
        .await;
        let info = registry.create_session(None).await.unwrap();

        let outcome = controller.ensure_ready(&info.session_id).await;

        assert!(outcome.is_ready());
        let reloads = surface.reloads.lock().unwrap().clone();
        assert_eq!(reloads.len(), 1);
        assert!(reloads[0].starts_with("http://fake-1.test?t="));
        assert_eq!(surface.recreates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn surface_is_recreated_before_the_session() {
        let (backend, registry, surface, controller) = setup(ScriptedProbe {
            ready_after: Some(14),
            ..Default::default()
        })
        .await;
        let info = registry.create_session(None).await.unwrap();

        assert!(controller.ensure_ready(&info.session_id).await.is_ready());
        assert_eq!(surface.recreates.load(Ordering::SeqCst), 1);
        assert_eq!(backend.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_session_is_replaced_and_preview_retargeted() {
        let (backend, registry, surface, controller) = setup(ScriptedProbe {
            good_host: Some("fake-2"),
            ..Default::default()
        })
        .await;
        let info = registry.create_session(None).await.unwrap();

        let outcome = controller.ensure_ready(&info.session_id).await;

        match outcome {
            ReadinessOutcome::Ready {
                session_id,
                recreated_sessions,
                ..
            } => {
                assert_eq!(session_id, "fake-2");
                assert_eq!(recreated_sessions, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(*surface.retargets.lock().unwrap(), vec!["http://fake-2.test"]);
        assert_eq!(backend.setup_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.terminate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.session_ids().await, vec!["fake-2".to_string()]);
        assert_eq!(controller.recreations().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recreate_budget_bounds_escalation() {
        let (backend, registry, _surface, controller) = setup(ScriptedProbe::default()).await;
        let info = registry.create_session(None).await.unwrap();

        let outcome = controller.ensure_ready(&info.session_id).await;

        assert!(matches!(
            outcome,
            ReadinessOutcome::Unreachable {
                recreated_sessions: 3,
                ..
            }
        ));
        assert_eq!(backend.create_calls.load(Ordering::SeqCst), 4);

        // Budget is spent: the next check does not provision again.
        let next = registry.active_session_id().await.unwrap();
        assert!(!controller.ensure_ready(&next).await.is_ready());
        assert_eq!(backend.create_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_before_session_exists_rearms_and_waits() {
        let (_backend, registry, _surface, controller) = setup(ScriptedProbe {
            ready_after: Some(1),
            ..Default::default()
        })
        .await;

        let creator = {
            let registry = registry.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(3)).await;
                registry.create_session(None).await.unwrap()
            })
        };
        let outcome = controller.ensure_ready("fake-1").await;

        assert!(outcome.is_ready());
        assert_eq!(creator.await.unwrap().session_id, "fake-1");
    }

    #[tokio::test(start_paused = true)]
    async fn unmounted_surface_gives_up_after_rearms() {
        let (_backend, registry, surface, controller) = setup(ScriptedProbe {
            ready_after: Some(1),
            ..Default::default()
        })
        .await;
        surface.unmounted.store(true, Ordering::SeqCst);
        let info = registry.create_session(None).await.unwrap();

        let outcome = controller.ensure_ready(&info.session_id).await;

        assert!(matches!(outcome, ReadinessOutcome::Unreachable { url: None, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_session_is_not_healthy_even_if_reachable() {
        let (backend, registry, _surface, controller) = setup(ScriptedProbe {
            ready_after: Some(1),
            ..Default::default()
        })
        .await;
        let info = registry.create_session(None).await.unwrap();
        backend.dead.store(true, Ordering::SeqCst);

        let outcome = controller.ensure_ready(&info.session_id).await;
        // Every session from this backend reports dead, so escalation runs
        // through the whole budget.
        assert!(!outcome.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_session_loses_its_checkpoints() {
        let backend = FakeBackend::new();
        let registry = SessionRegistry::new(FakeFactory::new(backend.clone()));
        let checkpoints = CheckpointLog::new();
        let controller = PreviewReadinessController::new(
            registry.clone(),
            Arc::new(RecordingSurface::default()),
            Arc::new(ScriptedProbe {
                good_host: Some("fake-2"),
                ..Default::default()
            }),
            ReadinessPolicy::default(),
        )
        .with_checkpoints(checkpoints.clone());
        let info = registry.create_session(None).await.unwrap();
        checkpoints.record(&info.session_id, "apply", vec!["a.js".into()]).await;

        assert!(controller.ensure_ready(&info.session_id).await.is_ready());
        assert!(checkpoints.list(&info.session_id).await.is_empty());
    }
}
