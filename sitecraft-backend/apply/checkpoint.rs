use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Oldest checkpoints are dropped beyond this many per session.
const MAX_PER_SESSION: usize = 100;

/// Immutable marker taken after a successful apply pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub session_id: String,
    pub files: Vec<String>,
}

/// In-memory checkpoint history, per session.
#[derive(Clone, Default)]
pub struct CheckpointLog {
    inner: Arc<RwLock<HashMap<String, VecDeque<Checkpoint>>>>,
}

impl CheckpointLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, session_id: &str, label: impl Into<String>, files: Vec<String>) -> Checkpoint {
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            created_at: Utc::now(),
            session_id: session_id.to_string(),
            files,
        };
        let mut map = self.inner.write().await;
        let history = map.entry(session_id.to_string()).or_default();
        history.push_back(checkpoint.clone());
        while history.len() > MAX_PER_SESSION {
            history.pop_front();
        }
        tracing::debug!(%session_id, checkpoint_id = %checkpoint.id, "checkpoint recorded");
        checkpoint
    }

    /// Oldest first.
    pub async fn list(&self, session_id: &str) -> Vec<Checkpoint> {
        self.inner
            .read()
            .await
            .get(session_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the history of a session that no longer exists. Returns how many
    /// checkpoints went with it.
    pub async fn remove(&self, session_id: &str) -> usize {
        let removed = self
            .inner
            .write()
            .await
            .remove(session_id)
            .map(|h| h.len())
            .unwrap_or(0);
        if removed > 0 {
            tracing::debug!(%session_id, removed, "checkpoint history dropped");
        }
        removed
    }

    #[cfg(test)]
    async fn sessions(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn get(&self, session_id: &str, checkpoint_id: &str) -> Option<Checkpoint> {
        self.inner
            .read()
            .await
            .get(session_id)
            .and_then(|h| h.iter().find(|c| c.id == checkpoint_id).cloned())
    }
}
