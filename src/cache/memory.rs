//! In-process routing cache.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cache::{RoutingCache, WorkerRouteSnapshot};
use crate::error::CacheError;

/// Routing cache held in process memory.
pub struct MemoryRoutingCache {
    routes: RwLock<HashMap<String, String>>,
    snapshots: RwLock<HashMap<String, WorkerRouteSnapshot>>,
}

impl MemoryRoutingCache {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRoutingCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoutingCache for MemoryRoutingCache {
    async fn set_route(&self, session_id: &str, worker_id: &str) -> Result<(), CacheError> {
        self.routes
            .write()
            .await
            .insert(session_id.to_string(), worker_id.to_string());
        Ok(())
    }

    async fn remove_route(&self, session_id: &str) -> Result<(), CacheError> {
        self.routes.write().await.remove(session_id);
        Ok(())
    }

    async fn get_route(&self, session_id: &str) -> Result<Option<String>, CacheError> {
        Ok(self.routes.read().await.get(session_id).cloned())
    }

    async fn put_worker_snapshot(
        &self,
        worker_id: &str,
        snapshot: WorkerRouteSnapshot,
    ) -> Result<(), CacheError> {
        self.snapshots
            .write()
            .await
            .insert(worker_id.to_string(), snapshot);
        Ok(())
    }

    async fn get_worker_snapshot(
        &self,
        worker_id: &str,
    ) -> Result<Option<WorkerRouteSnapshot>, CacheError> {
        Ok(self.snapshots.read().await.get(worker_id).cloned())
    }
}
