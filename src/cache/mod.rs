//! Routing cache abstraction.
//!
//! The cache is a fast-path projection of session→worker ownership used by
//! request dispatch. A missing entry always means "no known owner" and
//! forces a registry lookup; it is never a false positive, so deleting an
//! entry is always safe.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::registry::{Capabilities, SessionSnapshot, WorkerStatus};

pub use memory::MemoryRoutingCache;

/// Per-worker projection refreshed wholesale on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRouteSnapshot {
    pub status: WorkerStatus,
    pub session_count: u32,
    pub sessions: Vec<SessionSnapshot>,
    pub capabilities: Capabilities,
    pub last_heartbeat: DateTime<Utc>,
}

/// Fast session→worker lookup, mutated by the registry core.
#[async_trait]
pub trait RoutingCache: Send + Sync {
    async fn set_route(&self, session_id: &str, worker_id: &str) -> Result<(), CacheError>;

    async fn remove_route(&self, session_id: &str) -> Result<(), CacheError>;

    async fn get_route(&self, session_id: &str) -> Result<Option<String>, CacheError>;

    /// Replace (not merge) the worker's projection.
    async fn put_worker_snapshot(
        &self,
        worker_id: &str,
        snapshot: WorkerRouteSnapshot,
    ) -> Result<(), CacheError>;

    async fn get_worker_snapshot(
        &self,
        worker_id: &str,
    ) -> Result<Option<WorkerRouteSnapshot>, CacheError>;
}
