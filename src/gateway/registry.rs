//! Bookkeeping of open channels. Used at accept and attach time only; the
//! I/O relay never touches it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub opened_at: DateTime<Utc>,
    pub user_id: Option<i64>,
    pub container_id: Option<i64>,
    pub backend: Option<&'static str>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Register a new channel, or `None` when the gateway is full.
    pub async fn accept(&self) -> Option<Uuid> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return None;
        }
        let id = Uuid::new_v4();
        sessions.insert(
            id,
            SessionInfo {
                id,
                opened_at: Utc::now(),
                user_id: None,
                container_id: None,
                backend: None,
            },
        );
        Some(id)
    }

    pub async fn mark_attached(&self, id: Uuid, user_id: i64, container_id: i64, backend: &'static str) {
        if let Some(info) = self.sessions.write().await.get_mut(&id) {
            info.user_id = Some(user_id);
            info.container_id = Some(container_id);
            info.backend = Some(backend);
        }
    }

    /// Forget a channel. Safe to call more than once.
    pub async fn release(&self, id: Uuid) {
        self.sessions.write().await.remove(&id);
    }

    pub async fn get(&self, id: Uuid) -> Option<SessionInfo> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
