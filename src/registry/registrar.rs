//! Session registrar: the single writer of session→worker ownership.
//!
//! Every ownership transition (claim on recovery, release on failed
//! recovery, assignment on create) flows through here, serialized per
//! session id. A session can only move from worker A to worker B through a
//! release in between; a direct A→B write is rejected as stale ownership.

use std::sync::Arc;

use uuid::Uuid;

use crate::cache::RoutingCache;
use crate::error::RegistryError;
use crate::registry::lock::LockTable;
use crate::registry::{
    SessionRecord, SessionSnapshot, SessionStatus, SessionSummary, WorkerRecord, WorkerStatus,
};
use crate::store::{RegistryStore, WriteOutcome};

/// A recovery attempt the worker could not complete.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FailedSession {
    pub session_id: String,
    pub reason: String,
}

/// Counts from a fully applied recovery report.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RecoveryReport {
    /// Sessions reaffirmed to the reporting worker.
    pub reclaimed: u32,
    /// Sessions released because recovery failed.
    pub released: u32,
}

/// Response to a worker registration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RegisterOutcome {
    /// True when a prior record with this identity still owns active
    /// sessions: the process is resuming an identity, not starting fresh.
    pub is_recovery: bool,
    pub previous_sessions: Vec<SessionSummary>,
}

/// Request to create (or assign) a session.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CreateSession {
    /// Caller-supplied identity; generated when absent.
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub name: Option<String>,
    /// Worker to assign the session to immediately.
    pub assign_to: Option<String>,
}

/// Authoritative component for session ownership and worker identity.
pub struct SessionRegistrar {
    store: Arc<dyn RegistryStore>,
    cache: Arc<dyn RoutingCache>,
    session_locks: LockTable,
}

impl SessionRegistrar {
    pub fn new(store: Arc<dyn RegistryStore>, cache: Arc<dyn RoutingCache>) -> Self {
        Self {
            store,
            cache,
            session_locks: LockTable::new(),
        }
    }

    /// Sessions the given worker should own: active status, recorded owner
    /// matches. Read-only and safe to call repeatedly.
    pub async fn get_assigned_sessions(
        &self,
        worker_id: &str,
    ) -> Result<Vec<SessionSummary>, RegistryError> {
        self.require_worker(worker_id).await?;

        let sessions = self.store.list_active_sessions_for_worker(worker_id).await?;
        Ok(sessions.iter().map(SessionRecord::summary).collect())
    }

    /// Apply a worker's recovery outcomes.
    ///
    /// Recovered sessions are reaffirmed to the worker; failed ones are
    /// released so they no longer point at a worker that does not hold
    /// them. Each entry commits independently: a failing entry is recorded
    /// and the rest proceed, then the batch surfaces `PartialWrite` with
    /// the identities to re-report.
    pub async fn report_recovery_outcome(
        &self,
        worker_id: &str,
        recovered: &[SessionSnapshot],
        failed: &[FailedSession],
    ) -> Result<RecoveryReport, RegistryError> {
        self.require_worker(worker_id).await?;

        let mut report = RecoveryReport::default();
        let mut write_failures: Vec<String> = Vec::new();

        for snapshot in recovered {
            match self.apply_recovered(worker_id, snapshot).await {
                Ok(()) => report.reclaimed += 1,
                Err(e) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        session_id = %snapshot.session_id,
                        "Recovered-session write failed: {}",
                        e
                    );
                    write_failures.push(snapshot.session_id.clone());
                }
            }
        }

        for failure in failed {
            match self.apply_failed(worker_id, failure).await {
                Ok(()) => report.released += 1,
                Err(e) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        session_id = %failure.session_id,
                        "Failed-session release failed: {}",
                        e
                    );
                    write_failures.push(failure.session_id.clone());
                }
            }
        }

        // The worker's recorded load changed; recompute it from the store.
        let count = self.store.count_active_sessions(worker_id).await?;
        self.store
            .set_worker_session_count(worker_id, count)
            .await?;

        if write_failures.is_empty() {
            Ok(report)
        } else {
            Err(RegistryError::PartialWrite {
                failed: write_failures,
                total: recovered.len() + failed.len(),
            })
        }
    }

    async fn apply_recovered(
        &self,
        worker_id: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<(), RegistryError> {
        let _guard = self.session_locks.acquire(&snapshot.session_id).await;

        let outcome = self
            .store
            .claim_session(
                &snapshot.session_id,
                worker_id,
                snapshot.status,
                snapshot.external_identity.as_deref(),
            )
            .await?;

        match outcome {
            WriteOutcome::Applied => {
                self.cache.set_route(&snapshot.session_id, worker_id).await?;
                Ok(())
            }
            WriteOutcome::NotFound => Err(RegistryError::UnknownSession {
                session_id: snapshot.session_id.clone(),
            }),
            WriteOutcome::OwnedByOther(owner) => Err(RegistryError::StaleOwnership {
                session_id: snapshot.session_id.clone(),
                current_owner: owner,
                claimant: worker_id.to_string(),
            }),
            // Lost a race with a concurrent release; the entry is
            // re-reportable.
            WriteOutcome::Unowned => Err(RegistryError::StaleOwnership {
                session_id: snapshot.session_id.clone(),
                current_owner: "(unowned)".to_string(),
                claimant: worker_id.to_string(),
            }),
        }
    }

    async fn apply_failed(
        &self,
        worker_id: &str,
        failure: &FailedSession,
    ) -> Result<(), RegistryError> {
        let _guard = self.session_locks.acquire(&failure.session_id).await;

        tracing::info!(
            worker_id = %worker_id,
            session_id = %failure.session_id,
            reason = %failure.reason,
            "Releasing session after failed recovery"
        );

        let outcome = self
            .store
            .release_session(&failure.session_id, worker_id)
            .await?;

        match outcome {
            WriteOutcome::Applied | WriteOutcome::Unowned => {
                self.cache.remove_route(&failure.session_id).await?;
                Ok(())
            }
            WriteOutcome::NotFound => Err(RegistryError::UnknownSession {
                session_id: failure.session_id.clone(),
            }),
            WriteOutcome::OwnedByOther(owner) => Err(RegistryError::StaleOwnership {
                session_id: failure.session_id.clone(),
                current_owner: owner,
                claimant: worker_id.to_string(),
            }),
        }
    }

    /// Register (or re-register) a worker identity, marking it Online with
    /// a fresh heartbeat. When a prior record with the same identity still
    /// owns active sessions, the outcome flags a recovery scenario and
    /// returns those sessions so the process knows it is resuming.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        endpoint: &str,
        capacity: u32,
        capabilities: &crate::registry::Capabilities,
    ) -> Result<RegisterOutcome, RegistryError> {
        if worker_id.is_empty() {
            return Err(RegistryError::Validation {
                field: "worker_id",
                reason: "must not be empty".to_string(),
            });
        }
        if endpoint.is_empty() {
            return Err(RegistryError::Validation {
                field: "endpoint",
                reason: "must not be empty".to_string(),
            });
        }

        let prior = self.store.get_worker(worker_id).await?;
        let previous_sessions = if prior.is_some() {
            self.store
                .list_active_sessions_for_worker(worker_id)
                .await?
                .iter()
                .map(SessionRecord::summary)
                .collect()
        } else {
            Vec::new()
        };

        self.store
            .upsert_worker(worker_id, endpoint, capacity, capabilities)
            .await?;

        let is_recovery = !previous_sessions.is_empty();
        if is_recovery {
            tracing::info!(
                worker_id = %worker_id,
                sessions = previous_sessions.len(),
                "Worker re-registered with sessions to recover"
            );
        } else {
            tracing::info!(worker_id = %worker_id, endpoint = %endpoint, "Worker registered");
        }

        Ok(RegisterOutcome {
            is_recovery,
            previous_sessions,
        })
    }

    /// Create a session, or assign an existing unowned one.
    ///
    /// Retrying the whole call is safe: creating an id that already exists
    /// returns the stored record, and re-assigning to the same worker
    /// reaffirms ownership.
    pub async fn create_session(
        &self,
        request: CreateSession,
    ) -> Result<SessionRecord, RegistryError> {
        if let Some(worker_id) = request.assign_to.as_deref() {
            let worker = self.require_worker(worker_id).await?;
            if worker.status != WorkerStatus::Online {
                return Err(RegistryError::Validation {
                    field: "assign_to",
                    reason: format!("worker {} is {}", worker_id, worker.status),
                });
            }
        }

        let session_id = request
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let _guard = self.session_locks.acquire(&session_id).await;

        if let Some(existing) = self.store.get_session(&session_id).await? {
            let Some(worker_id) = request.assign_to.as_deref() else {
                return Ok(existing);
            };

            let outcome = self
                .store
                .claim_session(&session_id, worker_id, SessionStatus::Init, None)
                .await?;
            return match outcome {
                WriteOutcome::Applied => {
                    self.cache.set_route(&session_id, worker_id).await?;
                    let record = self.store.get_session(&session_id).await?.ok_or(
                        RegistryError::UnknownSession {
                            session_id: session_id.clone(),
                        },
                    )?;
                    Ok(record)
                }
                WriteOutcome::OwnedByOther(owner) => Err(RegistryError::StaleOwnership {
                    session_id,
                    current_owner: owner,
                    claimant: worker_id.to_string(),
                }),
                WriteOutcome::NotFound => Err(RegistryError::UnknownSession { session_id }),
                WriteOutcome::Unowned => Err(RegistryError::StaleOwnership {
                    session_id,
                    current_owner: "(unowned)".to_string(),
                    claimant: worker_id.to_string(),
                }),
            };
        }

        let now = chrono::Utc::now();
        let record = SessionRecord {
            session_id: session_id.clone(),
            user_id: request.user_id,
            name: request.name,
            owner_worker: request.assign_to.clone(),
            status: SessionStatus::Init,
            external_identity: None,
            last_seen: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_session(&record).await?;

        if let Some(worker_id) = request.assign_to.as_deref() {
            self.cache.set_route(&session_id, worker_id).await?;
        }

        tracing::info!(
            session_id = %record.session_id,
            owner = ?record.owner_worker,
            "Session created"
        );
        Ok(record)
    }

    /// Explicitly delete a session and its routing entry. Returns whether a
    /// record existed.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, RegistryError> {
        let _guard = self.session_locks.acquire(session_id).await;

        let deleted = self.store.delete_session(session_id).await?;
        self.cache.remove_route(session_id).await?;
        if deleted {
            tracing::info!(session_id = %session_id, "Session deleted");
        }
        Ok(deleted)
    }

    /// Graceful-shutdown signal: park the worker in Maintenance without
    /// releasing its sessions, so a restart can reclaim them without going
    /// through the stale-timeout path.
    pub async fn suspend_worker(&self, worker_id: &str) -> Result<(), RegistryError> {
        let updated = self
            .store
            .set_worker_status(worker_id, WorkerStatus::Maintenance)
            .await?;
        if !updated {
            return Err(RegistryError::UnknownWorker {
                worker_id: worker_id.to_string(),
            });
        }
        tracing::info!(worker_id = %worker_id, "Worker suspended, sessions preserved");
        Ok(())
    }

    async fn require_worker(&self, worker_id: &str) -> Result<WorkerRecord, RegistryError> {
        self.store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| RegistryError::UnknownWorker {
                worker_id: worker_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryRoutingCache;
    use crate::registry::Capabilities;
    use crate::store::MemoryRegistryStore;
    use pretty_assertions::assert_eq;

    fn registrar() -> (SessionRegistrar, Arc<MemoryRegistryStore>, Arc<MemoryRoutingCache>) {
        let store = Arc::new(MemoryRegistryStore::new());
        let cache = Arc::new(MemoryRoutingCache::new());
        let registrar = SessionRegistrar::new(store.clone(), cache.clone());
        (registrar, store, cache)
    }

    async fn register(registrar: &SessionRegistrar, worker_id: &str) {
        registrar
            .register_worker(worker_id, "10.0.0.1:9000", 32, &Capabilities::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn assigned_sessions_require_known_worker() {
        let (registrar, _, _) = registrar();
        let err = registrar.get_assigned_sessions("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownWorker { .. }));
    }

    #[tokio::test]
    async fn create_then_assign_scenario() {
        let (registrar, _, cache) = registrar();

        // S1 exists but has no owner yet.
        registrar
            .create_session(CreateSession {
                session_id: Some("s1".to_string()),
                user_id: Some("user-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        register(&registrar, "w1").await;
        assert!(registrar.get_assigned_sessions("w1").await.unwrap().is_empty());

        // A second create call assigns it.
        let record = registrar
            .create_session(CreateSession {
                session_id: Some("s1".to_string()),
                assign_to: Some("w1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(record.owner_worker.as_deref(), Some("w1"));
        assert_eq!(record.status, SessionStatus::Init);

        let assigned = registrar.get_assigned_sessions("w1").await.unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].session_id, "s1");
        assert_eq!(assigned[0].status, SessionStatus::Init);

        assert_eq!(cache.get_route("s1").await.unwrap(), Some("w1".to_string()));
    }

    #[tokio::test]
    async fn create_rejects_offline_assignee() {
        let (registrar, store, _) = registrar();
        register(&registrar, "w1").await;
        store
            .set_worker_status("w1", WorkerStatus::Offline)
            .await
            .unwrap();

        let err = registrar
            .create_session(CreateSession {
                assign_to: Some("w1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation { field: "assign_to", .. }));
    }

    #[tokio::test]
    async fn recovery_batch_applies_per_item() {
        let (registrar, store, cache) = registrar();
        register(&registrar, "w1").await;

        for id in ["s1", "s2", "s3", "s4", "s5"] {
            registrar
                .create_session(CreateSession {
                    session_id: Some(id.to_string()),
                    assign_to: Some("w1".to_string()),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let recovered = vec![
            SessionSnapshot {
                session_id: "s1".to_string(),
                status: SessionStatus::Connected,
                external_identity: Some("+100".to_string()),
            },
            SessionSnapshot {
                session_id: "s2".to_string(),
                status: SessionStatus::QrRequired,
                external_identity: None,
            },
            SessionSnapshot {
                session_id: "s3".to_string(),
                status: SessionStatus::Connected,
                external_identity: Some("+300".to_string()),
            },
        ];
        let failed = vec![
            FailedSession {
                session_id: "s4".to_string(),
                reason: "no local material".to_string(),
            },
            FailedSession {
                session_id: "s5".to_string(),
                reason: "resume rejected".to_string(),
            },
        ];

        let report = registrar
            .report_recovery_outcome("w1", &recovered, &failed)
            .await
            .unwrap();
        assert_eq!(report.reclaimed, 3);
        assert_eq!(report.released, 2);

        // Exactly three sessions owned by w1 with reported status.
        let s1 = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(s1.owner_worker.as_deref(), Some("w1"));
        assert_eq!(s1.status, SessionStatus::Connected);
        assert_eq!(s1.external_identity.as_deref(), Some("+100"));

        // Exactly two released.
        for id in ["s4", "s5"] {
            let record = store.get_session(id).await.unwrap().unwrap();
            assert_eq!(record.owner_worker, None);
            assert_eq!(record.status, SessionStatus::Disconnected);
            assert_eq!(cache.get_route(id).await.unwrap(), None);
        }

        // Session count recomputed from the store.
        let worker = store.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(worker.session_count, 3);
    }

    #[tokio::test]
    async fn failed_recovery_releases_ownership() {
        let (registrar, store, _) = registrar();
        register(&registrar, "w1").await;
        registrar
            .create_session(CreateSession {
                session_id: Some("s1".to_string()),
                assign_to: Some("w1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let failed = vec![FailedSession {
            session_id: "s1".to_string(),
            reason: "no local material".to_string(),
        }];
        registrar
            .report_recovery_outcome("w1", &[], &failed)
            .await
            .unwrap();

        let record = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.owner_worker, None);
        assert_eq!(record.status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn direct_reassignment_is_rejected() {
        let (registrar, store, _) = registrar();
        register(&registrar, "w-a").await;
        register(&registrar, "w-b").await;
        registrar
            .create_session(CreateSession {
                session_id: Some("s1".to_string()),
                assign_to: Some("w-a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        // w-b claims s1 without a release in between.
        let recovered = vec![SessionSnapshot {
            session_id: "s1".to_string(),
            status: SessionStatus::Connected,
            external_identity: None,
        }];
        let err = registrar
            .report_recovery_outcome("w-b", &recovered, &[])
            .await
            .unwrap_err();
        match err {
            RegistryError::PartialWrite { failed, total } => {
                assert_eq!(failed, vec!["s1".to_string()]);
                assert_eq!(total, 1);
            }
            other => panic!("expected PartialWrite, got {other:?}"),
        }

        // Ownership unchanged.
        let record = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.owner_worker.as_deref(), Some("w-a"));
    }

    #[tokio::test]
    async fn register_flags_recovery_scenario() {
        let (registrar, _, _) = registrar();
        register(&registrar, "w1").await;
        registrar
            .create_session(CreateSession {
                session_id: Some("s1".to_string()),
                assign_to: Some("w1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        // Same identity registers again (process restart).
        let outcome = registrar
            .register_worker("w1", "10.0.0.2:9000", 32, &Capabilities::default())
            .await
            .unwrap();
        assert!(outcome.is_recovery);
        assert_eq!(outcome.previous_sessions.len(), 1);
        assert_eq!(outcome.previous_sessions[0].session_id, "s1");

        // A fresh identity is not a recovery.
        let outcome = registrar
            .register_worker("w2", "10.0.0.3:9000", 32, &Capabilities::default())
            .await
            .unwrap();
        assert!(!outcome.is_recovery);
        assert!(outcome.previous_sessions.is_empty());
    }

    #[tokio::test]
    async fn suspend_preserves_sessions() {
        let (registrar, store, _) = registrar();
        register(&registrar, "w1").await;
        registrar
            .create_session(CreateSession {
                session_id: Some("s1".to_string()),
                assign_to: Some("w1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        registrar.suspend_worker("w1").await.unwrap();

        let worker = store.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Maintenance);
        let record = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.owner_worker.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn delete_session_is_idempotent() {
        let (registrar, _, _) = registrar();
        registrar
            .create_session(CreateSession {
                session_id: Some("s1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(registrar.delete_session("s1").await.unwrap());
        assert!(!registrar.delete_session("s1").await.unwrap());
    }
}
