//! Heartbeat reconciler: ingests worker self-reports and folds them back
//! into the Registry Store and the routing cache.
//!
//! For a session the worker currently owns, the worker's report wins: it
//! holds the live protocol connection, so its view of status and external
//! identity is authoritative. Reports about sessions the worker does not
//! own are skipped, never applied.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::cache::{RoutingCache, WorkerRouteSnapshot};
use crate::error::RegistryError;
use crate::metrics::{MetricsSample, MetricsSink};
use crate::registry::lock::LockTable;
use crate::store::{RegistryStore, WriteOutcome};
use crate::worker::api::HeartbeatPayload;

/// Instruction piggybacked on a heartbeat acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// The session no longer exists in the registry; the worker should
    /// retire its connection.
    DropSession { session_id: String },
}

/// Heartbeat acknowledgment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatAck {
    #[serde(default)]
    pub commands: Vec<WorkerCommand>,
}

/// Ingests heartbeats and reconciles reported session state.
pub struct HeartbeatReconciler {
    store: Arc<dyn RegistryStore>,
    cache: Arc<dyn RoutingCache>,
    metrics: Arc<dyn MetricsSink>,
    worker_locks: LockTable,
}

impl HeartbeatReconciler {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        cache: Arc<dyn RoutingCache>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            worker_locks: LockTable::new(),
        }
    }

    /// Process one heartbeat.
    ///
    /// Ingestion is serialized per worker id, so a sync run always finishes
    /// before the same worker's next heartbeat is processed. The worker
    /// record update and the session sync happen under one guard; a
    /// per-session sync failure is logged and skipped without aborting the
    /// rest or the acknowledgment.
    pub async fn ingest_heartbeat(
        &self,
        worker_id: &str,
        heartbeat: &HeartbeatPayload,
    ) -> Result<HeartbeatAck, RegistryError> {
        heartbeat.validate()?;
        let _guard = self.worker_locks.acquire(worker_id).await;

        // validate() checked both; destructure without unwrap.
        let (Some(status), Some(metrics)) = (heartbeat.status, heartbeat.metrics.as_ref()) else {
            return Err(RegistryError::Validation {
                field: "status",
                reason: "required".to_string(),
            });
        };
        let capabilities = heartbeat.capabilities.clone().unwrap_or_default();

        // `last_heartbeat` is server-observed time, never the caller's
        // clock: a skewed worker must not poison the staleness check.
        let updated = self
            .store
            .record_worker_heartbeat(worker_id, status, metrics.session_count, &capabilities)
            .await?;
        if !updated {
            return Err(RegistryError::UnknownWorker {
                worker_id: worker_id.to_string(),
            });
        }

        self.metrics
            .record_sample(MetricsSample {
                worker_id: worker_id.to_string(),
                metrics: metrics.clone(),
                observed_at: heartbeat.observed_at.unwrap_or_else(Utc::now),
            })
            .await;

        // Replace, not merge: the snapshot is this heartbeat's whole truth.
        self.cache
            .put_worker_snapshot(
                worker_id,
                WorkerRouteSnapshot {
                    status,
                    session_count: metrics.session_count,
                    sessions: heartbeat.sessions.clone(),
                    capabilities,
                    last_heartbeat: Utc::now(),
                },
            )
            .await?;

        let commands = self.sync_sessions(worker_id, heartbeat).await;

        tracing::debug!(
            worker_id = %worker_id,
            sessions = heartbeat.sessions.len(),
            commands = commands.len(),
            "Heartbeat ingested"
        );
        Ok(HeartbeatAck { commands })
    }

    async fn sync_sessions(
        &self,
        worker_id: &str,
        heartbeat: &HeartbeatPayload,
    ) -> Vec<WorkerCommand> {
        let mut commands = Vec::new();

        for snapshot in &heartbeat.sessions {
            let record = match self.store.get_session(&snapshot.session_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    // Heartbeats never create sessions; tell the worker to
                    // retire the connection instead.
                    tracing::debug!(
                        worker_id = %worker_id,
                        session_id = %snapshot.session_id,
                        "Reported session has no registry record"
                    );
                    commands.push(WorkerCommand::DropSession {
                        session_id: snapshot.session_id.clone(),
                    });
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        session_id = %snapshot.session_id,
                        "Session sync read failed: {}",
                        e
                    );
                    continue;
                }
            };

            if record.owner_worker.as_deref() != Some(worker_id) {
                tracing::warn!(
                    worker_id = %worker_id,
                    session_id = %snapshot.session_id,
                    recorded_owner = ?record.owner_worker,
                    "Ignoring heartbeat report for session this worker does not own"
                );
                continue;
            }

            let identity_changed = snapshot.external_identity.is_some()
                && record.external_identity != snapshot.external_identity;
            if record.status == snapshot.status && !identity_changed {
                continue;
            }

            match self
                .store
                .sync_session_state(
                    &snapshot.session_id,
                    worker_id,
                    snapshot.status,
                    snapshot.external_identity.as_deref(),
                )
                .await
            {
                Ok(WriteOutcome::Applied) => {
                    if let Err(e) = self.cache.set_route(&snapshot.session_id, worker_id).await {
                        tracing::warn!(
                            session_id = %snapshot.session_id,
                            "Routing refresh failed during sync: {}",
                            e
                        );
                    }
                }
                Ok(outcome) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        session_id = %snapshot.session_id,
                        ?outcome,
                        "Session sync write skipped"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        session_id = %snapshot.session_id,
                        "Session sync write failed: {}",
                        e
                    );
                }
            }
        }

        commands
    }
}
