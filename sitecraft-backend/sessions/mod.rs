//! Process-wide registry of live sandbox sessions.
//!
//! The registry is an explicit object handed to whoever needs it (API
//! state, apply engine); there is no global. Concurrent requests for the
//! same session share one in-flight future instead of racing to provision
//! or reconnect twice.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::sandbox::{ProviderFactory, SandboxError, SandboxInfo, SandboxProvider, SessionId};

type ProviderResult = Result<Arc<dyn SandboxProvider>, SandboxError>;
type PendingProvider = Shared<BoxFuture<'static, ProviderResult>>;

/// What an in-flight future is doing, so unrelated requests never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingKey {
    /// Re-adopt this id, never provision.
    Attach(SessionId),
    /// Reconnect to the id when given, otherwise provision a fresh session.
    Create(Option<SessionId>),
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// The registry holds a provider for the id.
    pub active: bool,
    pub healthy: bool,
    pub info: Option<SandboxInfo>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    factory: Arc<dyn ProviderFactory>,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    providers: HashMap<SessionId, Arc<dyn SandboxProvider>>,
    /// Default session for call sites that carry no explicit id.
    active: Option<SessionId>,
    pending: HashMap<PendingKey, PendingProvider>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                factory,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Pure lookup.
    pub async fn get_provider(&self, session_id: &str) -> Option<Arc<dyn SandboxProvider>> {
        self.inner.state.lock().await.providers.get(session_id).cloned()
    }

    /// Registered provider for `session_id`, reconnecting when it is not
    /// held yet. An id the backend no longer knows is `NotFound`; this never
    /// provisions a different session in its place.
    pub async fn get_or_create_provider(&self, session_id: &str) -> ProviderResult {
        if session_id.is_empty() {
            return Err(SandboxError::NotFound("empty session id".into()));
        }
        self.shared(PendingKey::Attach(session_id.to_string())).await
    }

    /// Reconnect to `existing_id` when the backend still knows it, otherwise
    /// provision a fresh session. The result becomes the active session.
    pub async fn create_session(&self, existing_id: Option<&str>) -> Result<SandboxInfo, SandboxError> {
        let provider = self.create_provider(existing_id).await?;
        provider.require_session().await
    }

    /// Same as `create_session` but hands back the provider itself.
    pub async fn create_provider(&self, existing_id: Option<&str>) -> ProviderResult {
        let key = PendingKey::Create(existing_id.filter(|id| !id.is_empty()).map(String::from));
        self.shared(key).await
    }

    pub async fn check_session_status(&self, session_id: &str) -> SessionStatus {
        let Some(provider) = self.get_provider(session_id).await else {
            return SessionStatus {
                active: false,
                healthy: false,
                info: None,
            };
        };
        SessionStatus {
            active: true,
            healthy: provider.is_alive().await,
            info: provider.sandbox_info().await,
        }
    }

    /// Drop the registry's reference without touching the remote session.
    pub async fn forget(&self, session_id: &str) -> Option<Arc<dyn SandboxProvider>> {
        let mut state = self.inner.state.lock().await;
        if state.active.as_deref() == Some(session_id) {
            state.active = None;
        }
        state.providers.remove(session_id)
    }

    /// Unregister and terminate a session. `false` when it was not held.
    pub async fn terminate_session(&self, session_id: &str) -> Result<bool, SandboxError> {
        let Some(provider) = self.forget(session_id).await else {
            return Ok(false);
        };
        provider.terminate().await?;
        tracing::info!(%session_id, "session terminated and unregistered");
        Ok(true)
    }

    pub async fn active_provider(&self) -> Option<Arc<dyn SandboxProvider>> {
        let state = self.inner.state.lock().await;
        state
            .active
            .as_ref()
            .and_then(|id| state.providers.get(id))
            .cloned()
    }

    pub async fn active_session_id(&self) -> Option<SessionId> {
        self.inner.state.lock().await.active.clone()
    }

    /// Point the default session at a registered id. `false` when unknown.
    pub async fn set_active(&self, session_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.providers.contains_key(session_id) {
            state.active = Some(session_id.to_string());
            true
        } else {
            false
        }
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.inner.state.lock().await.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Join the in-flight future for `key`, starting one if none exists.
    async fn shared(&self, key: PendingKey) -> ProviderResult {
        let pending = {
            let mut state = self.inner.state.lock().await;
            if let PendingKey::Attach(id) | PendingKey::Create(Some(id)) = &key {
                if let Some(provider) = state.providers.get(id) {
                    let provider = provider.clone();
                    if matches!(key, PendingKey::Create(_)) {
                        state.active = Some(id.clone());
                    }
                    return Ok(provider);
                }
            }
            match state.pending.get(&key) {
                Some(pending) => {
                    tracing::debug!(?key, "joining in-flight session request");
                    pending.clone()
                }
                None => {
                    let fut = resolve(self.inner.clone(), key.clone()).boxed().shared();
                    state.pending.insert(key, fut.clone());
                    fut
                }
            }
        };
        pending.await
    }
}

/// Body of a shared future. The pending entry is removed on every exit path.
async fn resolve(inner: Arc<RegistryInner>, key: PendingKey) -> ProviderResult {
    let result = match &key {
        PendingKey::Attach(id) => attach(&inner, id).await,
        PendingKey::Create(existing) => provision(&inner, existing.as_deref()).await,
    };
    let result = match result {
        Ok(provider) => match provider.sandbox_info().await {
            Some(info) => Ok((provider, info)),
            None => Err(SandboxError::NoActiveSandbox),
        },
        Err(e) => Err(e),
    };

    let mut state = inner.state.lock().await;
    state.pending.remove(&key);
    let (provider, info) = result?;
    let provider = state
        .providers
        .entry(info.session_id.clone())
        .or_insert(provider)
        .clone();
    if matches!(key, PendingKey::Create(_)) {
        state.active = Some(info.session_id);
    }
    Ok(provider)
}

async fn attach(inner: &RegistryInner, session_id: &str) -> ProviderResult {
    let provider = inner.factory.make();
    if provider.reconnect(session_id).await? {
        tracing::info!(%session_id, "reconnected session");
        Ok(provider)
    } else {
        Err(SandboxError::NotFound(session_id.to_string()))
    }
}

async fn provision(inner: &RegistryInner, existing_id: Option<&str>) -> ProviderResult {
    let provider = inner.factory.make();
    if let Some(id) = existing_id {
        if provider.reconnect(id).await? {
            tracing::info!(session_id = %id, "reused existing session");
            return Ok(provider);
        }
        tracing::info!(session_id = %id, "existing session is gone, provisioning a new one");
    }
    let info = provider.create_sandbox().await?;
    tracing::info!(
        session_id = %info.session_id,
        provider = %info.provider,
        "session provisioned"
    );
    Ok(provider)
}
