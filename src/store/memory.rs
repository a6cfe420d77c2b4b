//! In-memory Registry Store.
//!
//! Backs the test suite and local development. Semantics mirror the
//! Postgres backend, including the conditional ownership writes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::registry::{
    Capabilities, SessionRecord, SessionStatus, WorkerRecord, WorkerStatus,
};
use crate::store::{RegistryStore, WriteOutcome};

#[derive(Default)]
struct Inner {
    workers: HashMap<String, WorkerRecord>,
    sessions: HashMap<String, SessionRecord>,
}

/// Registry Store held entirely in process memory.
pub struct MemoryRegistryStore {
    inner: RwLock<Inner>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Overwrite a worker's heartbeat timestamp. Test seeding helper; the
    /// trait only ever writes server-observed time.
    pub async fn set_last_heartbeat(&self, worker_id: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.last_heartbeat = at;
        }
    }
}

impl Default for MemoryRegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn upsert_worker(
        &self,
        worker_id: &str,
        endpoint: &str,
        capacity: u32,
        capabilities: &Capabilities,
    ) -> Result<WorkerRecord, DatabaseError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let record = inner
            .workers
            .entry(worker_id.to_string())
            .and_modify(|w| {
                w.endpoint = endpoint.to_string();
                w.status = WorkerStatus::Online;
                w.capacity = capacity;
                w.capabilities = capabilities.clone();
                w.last_heartbeat = now;
                w.updated_at = now;
            })
            .or_insert_with(|| WorkerRecord {
                worker_id: worker_id.to_string(),
                endpoint: endpoint.to_string(),
                status: WorkerStatus::Online,
                capacity,
                session_count: 0,
                capabilities: capabilities.clone(),
                last_heartbeat: now,
                created_at: now,
                updated_at: now,
            });

        Ok(record.clone())
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DatabaseError> {
        Ok(self.inner.read().await.workers.get(worker_id).cloned())
    }

    async fn record_worker_heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        session_count: u32,
        capabilities: &Capabilities,
    ) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        match inner.workers.get_mut(worker_id) {
            Some(worker) => {
                worker.status = status;
                worker.session_count = session_count;
                worker.capabilities = capabilities.clone();
                worker.last_heartbeat = now;
                worker.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.write().await;
        match inner.workers.get_mut(worker_id) {
            Some(worker) => {
                worker.status = status;
                worker.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_worker_session_count(
        &self,
        worker_id: &str,
        count: u32,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().await;
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            worker.session_count = count;
            worker.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_stale_workers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let inner = self.inner.read().await;
        let mut stale: Vec<WorkerRecord> = inner
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Online && w.last_heartbeat < cutoff)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.last_heartbeat.cmp(&b.last_heartbeat));
        Ok(stale)
    }

    async fn demote_worker_if_stale(
        &self,
        worker_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.write().await;
        match inner.workers.get_mut(worker_id) {
            Some(worker)
                if worker.status == WorkerStatus::Online && worker.last_heartbeat < cutoff =>
            {
                worker.status = WorkerStatus::Offline;
                worker.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_session(&self, record: &SessionRecord) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&record.session_id) {
            return Ok(false);
        }
        inner
            .sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(true)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        Ok(self.inner.read().await.sessions.get(session_id).cloned())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.inner.write().await.sessions.remove(session_id).is_some())
    }

    async fn list_active_sessions_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<SessionRecord>, DatabaseError> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<SessionRecord> = inner
            .sessions
            .values()
            .filter(|s| s.owner_worker.as_deref() == Some(worker_id) && s.status.is_active())
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn count_active_sessions(&self, worker_id: &str) -> Result<u32, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.owner_worker.as_deref() == Some(worker_id) && s.status.is_active())
            .count() as u32)
    }

    async fn claim_session(
        &self,
        session_id: &str,
        worker_id: &str,
        status: SessionStatus,
        external_identity: Option<&str>,
    ) -> Result<WriteOutcome, DatabaseError> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Ok(WriteOutcome::NotFound);
        };

        match session.owner_worker.as_deref() {
            Some(owner) if owner != worker_id => {
                return Ok(WriteOutcome::OwnedByOther(owner.to_string()));
            }
            _ => {}
        }

        let now = Utc::now();
        session.owner_worker = Some(worker_id.to_string());
        session.status = status;
        if external_identity.is_some() {
            session.external_identity = external_identity.map(String::from);
        }
        session.last_seen = Some(now);
        session.updated_at = now;
        Ok(WriteOutcome::Applied)
    }

    async fn release_session(
        &self,
        session_id: &str,
        expected_owner: &str,
    ) -> Result<WriteOutcome, DatabaseError> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Ok(WriteOutcome::NotFound);
        };

        match session.owner_worker.as_deref() {
            Some(owner) if owner != expected_owner => {
                return Ok(WriteOutcome::OwnedByOther(owner.to_string()));
            }
            _ => {}
        }

        session.owner_worker = None;
        session.status = SessionStatus::Disconnected;
        session.updated_at = Utc::now();
        Ok(WriteOutcome::Applied)
    }

    async fn release_sessions_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut released = Vec::new();
        for session in inner.sessions.values_mut() {
            if session.owner_worker.as_deref() == Some(worker_id) && session.status.is_active() {
                session.owner_worker = None;
                session.status = SessionStatus::Disconnected;
                session.updated_at = now;
                released.push(session.session_id.clone());
            }
        }
        released.sort();
        Ok(released)
    }

    async fn sync_session_state(
        &self,
        session_id: &str,
        worker_id: &str,
        status: SessionStatus,
        external_identity: Option<&str>,
    ) -> Result<WriteOutcome, DatabaseError> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Ok(WriteOutcome::NotFound);
        };

        match session.owner_worker.as_deref() {
            Some(owner) if owner == worker_id => {}
            Some(owner) => return Ok(WriteOutcome::OwnedByOther(owner.to_string())),
            None => return Ok(WriteOutcome::Unowned),
        }

        let now = Utc::now();
        session.status = status;
        if external_identity.is_some() {
            session.external_identity = external_identity.map(String::from);
        }
        session.last_seen = Some(now);
        session.updated_at = now;
        Ok(WriteOutcome::Applied)
    }
}
