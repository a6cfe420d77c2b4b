//! Stale worker monitor.
//!
//! Heartbeats renew a time-bounded lease on Online status; this sweep is
//! the expiry side. It runs on its own cadence, independent of any worker
//! process, scanning the Registry Store for Online workers whose last
//! heartbeat is past the liveness timeout, demoting them, and releasing
//! the sessions they owned.
//!
//! Each worker's demotion is an independent transaction: a crash mid-sweep
//! leaves some stale workers un-demoted, and the next sweep corrects that.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};

use crate::cache::RoutingCache;
use crate::config::MonitorConfig;
use crate::error::RegistryError;
use crate::store::RegistryStore;

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub workers_demoted: u32,
    pub sessions_released: u32,
}

/// Time-driven sweep that demotes lapsed workers and releases their
/// sessions.
pub struct StaleWorkerMonitor {
    store: Arc<dyn RegistryStore>,
    cache: Arc<dyn RoutingCache>,
    config: MonitorConfig,
}

impl StaleWorkerMonitor {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        cache: Arc<dyn RoutingCache>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Run the sweep loop forever on the configured cadence.
    pub async fn run(&self) {
        tracing::info!(
            interval = ?self.config.sweep_interval,
            timeout = ?self.config.liveness_timeout,
            "Starting stale worker monitor"
        );

        let mut interval = tokio::time::interval(self.config.sweep_interval);
        // Don't sweep immediately on startup
        interval.tick().await;

        loop {
            interval.tick().await;
            match self.sweep().await {
                Ok(outcome) if outcome.workers_demoted > 0 => {
                    tracing::info!(
                        workers = outcome.workers_demoted,
                        sessions = outcome.sessions_released,
                        "Stale sweep demoted workers"
                    );
                }
                Ok(_) => tracing::debug!("Stale sweep found nothing to do"),
                Err(e) => tracing::error!("Stale sweep failed: {}", e),
            }
        }
    }

    /// Run a single sweep. Idempotent: with no new heartbeats, a second
    /// run changes nothing.
    pub async fn sweep(&self) -> Result<SweepOutcome, RegistryError> {
        let timeout = TimeDelta::from_std(self.config.liveness_timeout)
            .unwrap_or_else(|_| TimeDelta::seconds(90));
        let cutoff = Utc::now() - timeout;

        let stale = self.store.list_stale_workers(cutoff).await?;
        let mut outcome = SweepOutcome::default();

        for worker in stale {
            match self.demote(&worker.worker_id, cutoff).await {
                Ok(Some(released)) => {
                    outcome.workers_demoted += 1;
                    outcome.sessions_released += released;
                }
                Ok(None) => {
                    // A heartbeat landed after our snapshot read; the
                    // conditional write left the worker Online.
                    tracing::debug!(
                        worker_id = %worker.worker_id,
                        "Worker revived before demotion, skipping"
                    );
                }
                Err(e) => {
                    // Other workers still get their own transaction.
                    tracing::error!(
                        worker_id = %worker.worker_id,
                        "Failed to demote stale worker: {}",
                        e
                    );
                }
            }
        }

        Ok(outcome)
    }

    async fn demote(
        &self,
        worker_id: &str,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<Option<u32>, RegistryError> {
        if !self.store.demote_worker_if_stale(worker_id, cutoff).await? {
            return Ok(None);
        }

        let released = self.store.release_sessions_for_worker(worker_id).await?;
        for session_id in &released {
            if let Err(e) = self.cache.remove_route(session_id).await {
                // A dangling route self-corrects on the next reconciliation
                // cycle; a lookup miss is the safe failure mode.
                tracing::warn!(
                    session_id = %session_id,
                    "Failed to drop routing entry for released session: {}",
                    e
                );
            }
        }

        tracing::warn!(
            worker_id = %worker_id,
            sessions = released.len(),
            "Worker marked Offline after missed heartbeats, sessions released"
        );
        Ok(Some(released.len() as u32))
    }
}

/// Spawn the monitor as a background task.
pub fn spawn_monitor(
    store: Arc<dyn RegistryStore>,
    cache: Arc<dyn RoutingCache>,
    config: MonitorConfig,
) -> tokio::task::JoinHandle<()> {
    let monitor = StaleWorkerMonitor::new(store, cache, config);
    tokio::spawn(async move {
        monitor.run().await;
    })
}
