//! Worker-local table of live sessions.
//!
//! The table is the worker's own record of which protocol connections it
//! holds. Entries are inserted on create/resume and removed on
//! delete/release; the heartbeat loop snapshots it to report per-session
//! state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::registry::{SessionSnapshot, SessionStatus};

/// One live protocol connection held by this worker.
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub session_id: String,
    pub status: SessionStatus,
    pub external_identity: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// Owned table of live sessions, keyed by session id.
pub struct SessionTable {
    sessions: RwLock<HashMap<String, LiveSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a live session.
    pub async fn insert(&self, session: LiveSession) {
        self.sessions
            .write()
            .await
            .insert(session.session_id.clone(), session);
    }

    /// Remove a session, returning it if present.
    pub async fn remove(&self, session_id: &str) -> Option<LiveSession> {
        self.sessions.write().await.remove(session_id)
    }

    /// Update status and external identity in place. Returns false when
    /// the session is not in the table.
    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        external_identity: Option<String>,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.status = status;
                if external_identity.is_some() {
                    session.external_identity = external_identity;
                }
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Per-session state for a heartbeat, ordered by session id for a
    /// stable wire shape.
    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut snapshots: Vec<SessionSnapshot> = sessions
            .values()
            .map(|s| SessionSnapshot {
                session_id: s.session_id.clone(),
                status: s.status,
                external_identity: s.external_identity.clone(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
