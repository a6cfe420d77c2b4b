//! Registry Store abstraction.
//!
//! The store holds the durable Worker and Session records. Ownership writes
//! are conditional (compare-and-swap on the recorded owner) so that callers
//! can retry whole operations safely under at-least-once delivery.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::registry::{
    Capabilities, SessionRecord, SessionStatus, WorkerRecord, WorkerStatus,
};

pub use memory::MemoryRegistryStore;
pub use postgres::PgRegistryStore;

/// Outcome of a conditional per-session write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied.
    Applied,
    /// No record exists for the session id.
    NotFound,
    /// The session is owned by a different worker; nothing was written.
    OwnedByOther(String),
    /// The session has no recorded owner; nothing was written.
    Unowned,
}

/// Durable registry of workers and sessions.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    // --- Workers ---

    /// Create or refresh a worker record, marking it Online with a fresh
    /// heartbeat timestamp. Returns the stored record.
    async fn upsert_worker(
        &self,
        worker_id: &str,
        endpoint: &str,
        capacity: u32,
        capabilities: &Capabilities,
    ) -> Result<WorkerRecord, DatabaseError>;

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DatabaseError>;

    /// Apply a heartbeat: status, session count, capabilities, and a
    /// server-observed `last_heartbeat`. Returns false if the worker has no
    /// record.
    async fn record_worker_heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        session_count: u32,
        capabilities: &Capabilities,
    ) -> Result<bool, DatabaseError>;

    /// Set a worker's lifecycle status without touching its heartbeat
    /// timestamp. Returns false if the worker has no record.
    async fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<bool, DatabaseError>;

    async fn set_worker_session_count(
        &self,
        worker_id: &str,
        count: u32,
    ) -> Result<(), DatabaseError>;

    /// Online workers whose last heartbeat is older than `cutoff`.
    async fn list_stale_workers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, DatabaseError>;

    /// Demote a worker to Offline only if it is still Online and its last
    /// heartbeat is older than `cutoff`. The staleness check and the status
    /// write are one atomic conditional update, so a heartbeat landing
    /// between the sweep's snapshot and the demotion keeps the worker
    /// Online. Returns whether the demotion happened.
    async fn demote_worker_if_stale(
        &self,
        worker_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // --- Sessions ---

    /// Insert a new session record. Returns false if the id already exists.
    async fn insert_session(&self, record: &SessionRecord) -> Result<bool, DatabaseError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, DatabaseError>;

    async fn delete_session(&self, session_id: &str) -> Result<bool, DatabaseError>;

    /// Sessions owned by `worker_id` in an active status, ordered by
    /// creation time.
    async fn list_active_sessions_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<SessionRecord>, DatabaseError>;

    async fn count_active_sessions(&self, worker_id: &str) -> Result<u32, DatabaseError>;

    /// Claim ownership of a session for `worker_id`, setting the reported
    /// status and external identity and refreshing `last_seen`. Applies
    /// only when the session is unowned or already owned by `worker_id`.
    async fn claim_session(
        &self,
        session_id: &str,
        worker_id: &str,
        status: SessionStatus,
        external_identity: Option<&str>,
    ) -> Result<WriteOutcome, DatabaseError>;

    /// Release a session: status Disconnected, owner cleared. Applies when
    /// the session is unowned (idempotent) or owned by `expected_owner`.
    async fn release_session(
        &self,
        session_id: &str,
        expected_owner: &str,
    ) -> Result<WriteOutcome, DatabaseError>;

    /// Release every active session owned by `worker_id`, returning the
    /// released session ids.
    async fn release_sessions_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<String>, DatabaseError>;

    /// Overwrite a session's status and external identity with the owner's
    /// reported values, refreshing `last_seen`. Applies only when
    /// `worker_id` is the recorded owner.
    async fn sync_session_state(
        &self,
        session_id: &str,
        worker_id: &str,
        status: SessionStatus,
        external_identity: Option<&str>,
    ) -> Result<WriteOutcome, DatabaseError>;
}
