//! Startup session recovery.
//!
//! Runs once per worker process lifetime, before the process accepts new
//! session-create load: pull the assignment list, try to resume each
//! session from persisted local material, then report the full outcome
//! batch to the registrar in one call.
//!
//! Failed resumes are expected and recoverable. A crash after resuming but
//! before reporting leaves the affected sessions owned by this worker in
//! the registry until the stale sweep reclaims them; that window is
//! bounded by the liveness timeout and accepted.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::config::RecoveryConfig;
use crate::error::ClientError;
use crate::protocol::ProtocolClient;
use crate::registry::registrar::{FailedSession, RecoveryReport};
use crate::registry::{SessionSnapshot, SessionSummary};
use crate::worker::api::RecoveryReportRequest;
use crate::worker::client::RegistrarClient;
use crate::worker::sessions::{LiveSession, SessionTable};

/// Where a recovery candidate ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Attempting,
    Recovered,
    Failed,
}

/// Result of one worker's recovery pass.
#[derive(Debug, Default)]
pub struct RecoverySummary {
    pub recovered: Vec<SessionSnapshot>,
    pub failed: Vec<FailedSession>,
    /// Counts acknowledged by the registrar; `None` when there was nothing
    /// to report or the report call itself failed.
    pub report: Option<RecoveryReport>,
}

impl RecoverySummary {
    pub fn attempted(&self) -> usize {
        self.recovered.len() + self.failed.len()
    }
}

/// Recovers previously owned sessions on worker startup.
pub struct RecoveryAgent {
    worker_id: String,
    client: Arc<dyn RegistrarClient>,
    protocol: Arc<dyn ProtocolClient>,
    table: Arc<SessionTable>,
    config: RecoveryConfig,
}

impl RecoveryAgent {
    pub fn new(
        worker_id: impl Into<String>,
        client: Arc<dyn RegistrarClient>,
        protocol: Arc<dyn ProtocolClient>,
        table: Arc<SessionTable>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            client,
            protocol,
            table,
            config,
        }
    }

    /// Run the whole recovery pass.
    ///
    /// An unreachable registrar fails the pass gracefully (no recovered
    /// sessions) unless `abort_on_unreachable` is set.
    pub async fn run(&self) -> Result<RecoverySummary, ClientError> {
        let assigned = match self.fetch_assignments().await {
            Ok(assigned) => assigned,
            Err(e) if self.config.abort_on_unreachable => return Err(e),
            Err(e) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    "Registrar unreachable, continuing without recovered sessions: {}",
                    e
                );
                return Ok(RecoverySummary::default());
            }
        };

        if assigned.is_empty() {
            tracing::info!(worker_id = %self.worker_id, "No sessions to recover");
            return Ok(RecoverySummary::default());
        }

        tracing::info!(
            worker_id = %self.worker_id,
            sessions = assigned.len(),
            "Recovering previously owned sessions"
        );

        let mut summary = self.attempt_all(assigned).await;
        self.report(&mut summary).await;
        Ok(summary)
    }

    async fn fetch_assignments(&self) -> Result<Vec<SessionSummary>, ClientError> {
        tokio::time::timeout(
            self.config.call_timeout,
            self.client.get_assigned_sessions(&self.worker_id),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.call_timeout))?
    }

    /// Attempt every candidate, bounded by the configured concurrency so a
    /// large session list cannot overwhelm the protocol client.
    async fn attempt_all(&self, assigned: Vec<SessionSummary>) -> RecoverySummary {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        let attempts = assigned.into_iter().map(|candidate| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            candidate.session_id.clone(),
                            AttemptState::Failed,
                            Err("recovery cancelled".to_string()),
                        );
                    }
                };
                let outcome = self.attempt_one(&candidate).await;
                match outcome {
                    Ok(snapshot) => (candidate.session_id, AttemptState::Recovered, Ok(snapshot)),
                    Err(reason) => (candidate.session_id, AttemptState::Failed, Err(reason)),
                }
            }
        });

        let mut summary = RecoverySummary::default();
        for (session_id, state, outcome) in join_all(attempts).await {
            match (state, outcome) {
                (AttemptState::Recovered, Ok(snapshot)) => summary.recovered.push(snapshot),
                (_, Err(reason)) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        session_id = %session_id,
                        reason = %reason,
                        "Session recovery failed"
                    );
                    summary.failed.push(FailedSession { session_id, reason });
                }
                (state, Ok(_)) => {
                    tracing::error!(session_id = %session_id, ?state, "Inconsistent attempt state");
                }
            }
        }
        summary
    }

    async fn attempt_one(&self, candidate: &SessionSummary) -> Result<SessionSnapshot, String> {
        let resumed = tokio::time::timeout(
            self.config.call_timeout,
            self.protocol.resume(&candidate.session_id),
        )
        .await
        .map_err(|_| format!("resume timed out after {:?}", self.config.call_timeout))?
        .map_err(|e| e.to_string())?;

        self.table
            .insert(LiveSession {
                session_id: resumed.session_id.clone(),
                status: resumed.status,
                external_identity: resumed.external_identity.clone(),
                opened_at: chrono::Utc::now(),
            })
            .await;

        Ok(SessionSnapshot {
            session_id: resumed.session_id,
            status: resumed.status,
            external_identity: resumed.external_identity,
        })
    }

    /// Push the full batch to the registrar in one call. A failed report
    /// is logged, not fatal: recovered sessions will re-sync on the next
    /// heartbeat, and failed ones are reclaimed by the stale sweep.
    async fn report(&self, summary: &mut RecoverySummary) {
        let request = RecoveryReportRequest {
            recovered: summary.recovered.clone(),
            failed: summary.failed.clone(),
        };

        match self.client.report_recovery(&self.worker_id, &request).await {
            Ok(report) => {
                tracing::info!(
                    worker_id = %self.worker_id,
                    reclaimed = report.reclaimed,
                    released = report.released,
                    "Recovery outcome reported"
                );
                summary.report = Some(report);
            }
            Err(e) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    "Failed to report recovery outcome: {}",
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::protocol::ResumedSession;
    use crate::registry::SessionStatus;
    use crate::registry::registrar::RegisterOutcome;
    use crate::worker::api::{HeartbeatPayload, RegisterRequest};
    use crate::registry::HeartbeatAck;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn summary_for(session_id: &str) -> SessionSummary {
        let now = Utc::now();
        SessionSummary {
            session_id: session_id.to_string(),
            user_id: None,
            name: None,
            status: SessionStatus::Connected,
            external_identity: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Registrar stub: serves a fixed assignment list and records reports.
    struct StubRegistrar {
        assigned: Vec<SessionSummary>,
        unreachable: bool,
        reports: Mutex<Vec<RecoveryReportRequest>>,
    }

    impl StubRegistrar {
        fn with_assigned(assigned: Vec<SessionSummary>) -> Self {
            Self {
                assigned,
                unreachable: false,
                reports: Mutex::new(Vec::new()),
            }
        }

        fn unreachable() -> Self {
            Self {
                assigned: Vec::new(),
                unreachable: true,
                reports: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RegistrarClient for StubRegistrar {
        async fn register(
            &self,
            _worker_id: &str,
            _request: &RegisterRequest,
        ) -> Result<RegisterOutcome, ClientError> {
            Ok(RegisterOutcome {
                is_recovery: false,
                previous_sessions: Vec::new(),
            })
        }

        async fn get_assigned_sessions(
            &self,
            _worker_id: &str,
        ) -> Result<Vec<SessionSummary>, ClientError> {
            if self.unreachable {
                return Err(ClientError::Status {
                    status: 502,
                    body: "bad gateway".to_string(),
                });
            }
            Ok(self.assigned.clone())
        }

        async fn report_recovery(
            &self,
            _worker_id: &str,
            request: &RecoveryReportRequest,
        ) -> Result<RecoveryReport, ClientError> {
            self.reports.lock().await.push(request.clone());
            Ok(RecoveryReport {
                reclaimed: request.recovered.len() as u32,
                released: request.failed.len() as u32,
            })
        }

        async fn push_heartbeat(
            &self,
            _worker_id: &str,
            _heartbeat: &HeartbeatPayload,
        ) -> Result<HeartbeatAck, ClientError> {
            Ok(HeartbeatAck::default())
        }

        async fn announce_shutdown(&self, _worker_id: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    /// Protocol stub: succeeds or fails per session id, tracking peak
    /// concurrency.
    struct StubProtocol {
        fail_ids: Vec<String>,
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StubProtocol {
        fn new(fail_ids: &[&str]) -> Self {
            Self {
                fail_ids: fail_ids.iter().map(|s| s.to_string()).collect(),
                delay: Duration::from_millis(10),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProtocolClient for StubProtocol {
        async fn resume(&self, session_id: &str) -> Result<ResumedSession, ProtocolError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if self.fail_ids.iter().any(|id| id == session_id) {
                return Err(ProtocolError::MissingMaterial {
                    session_id: session_id.to_string(),
                });
            }
            Ok(ResumedSession {
                session_id: session_id.to_string(),
                status: SessionStatus::Connected,
                external_identity: Some("+100".to_string()),
            })
        }

        async fn close(&self, _session_id: &str) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    fn agent(
        registrar: Arc<StubRegistrar>,
        protocol: Arc<StubProtocol>,
        config: RecoveryConfig,
    ) -> (RecoveryAgent, Arc<SessionTable>) {
        let table = Arc::new(SessionTable::new());
        (
            RecoveryAgent::new("w1", registrar, protocol, table.clone(), config),
            table,
        )
    }

    #[tokio::test]
    async fn recovers_and_reports_mixed_batch() {
        let registrar = Arc::new(StubRegistrar::with_assigned(vec![
            summary_for("s1"),
            summary_for("s2"),
            summary_for("s3"),
        ]));
        let protocol = Arc::new(StubProtocol::new(&["s2"]));
        let (agent, table) = agent(registrar.clone(), protocol, RecoveryConfig::default());

        let summary = agent.run().await.unwrap();
        assert_eq!(summary.recovered.len(), 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].session_id, "s2");
        assert!(summary.failed[0].reason.contains("No local session material"));

        // Recovered sessions are live in the local table; failed are not.
        assert!(table.contains("s1").await);
        assert!(table.contains("s3").await);
        assert!(!table.contains("s2").await);

        // One batched report.
        let reports = registrar.reports.lock().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].recovered.len(), 2);
        assert_eq!(reports[0].failed.len(), 1);

        let report = summary.report.unwrap();
        assert_eq!(report.reclaimed, 2);
        assert_eq!(report.released, 1);
    }

    #[tokio::test]
    async fn empty_assignment_skips_report() {
        let registrar = Arc::new(StubRegistrar::with_assigned(vec![]));
        let protocol = Arc::new(StubProtocol::new(&[]));
        let (agent, _) = agent(registrar.clone(), protocol, RecoveryConfig::default());

        let summary = agent.run().await.unwrap();
        assert_eq!(summary.attempted(), 0);
        assert!(registrar.reports.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_registrar_degrades_gracefully() {
        let registrar = Arc::new(StubRegistrar::unreachable());
        let protocol = Arc::new(StubProtocol::new(&[]));
        let (agent, _) = agent(registrar, protocol, RecoveryConfig::default());

        let summary = agent.run().await.unwrap();
        assert_eq!(summary.attempted(), 0);
        assert!(summary.report.is_none());
    }

    #[tokio::test]
    async fn unreachable_registrar_aborts_when_configured() {
        let registrar = Arc::new(StubRegistrar::unreachable());
        let protocol = Arc::new(StubProtocol::new(&[]));
        let config = RecoveryConfig {
            abort_on_unreachable: true,
            ..Default::default()
        };
        let (agent, _) = agent(registrar, protocol, config);

        assert!(agent.run().await.is_err());
    }

    #[tokio::test]
    async fn resume_timeout_counts_as_failure() {
        let registrar = Arc::new(StubRegistrar::with_assigned(vec![summary_for("s1")]));
        let mut protocol = StubProtocol::new(&[]);
        protocol.delay = Duration::from_millis(200);
        let config = RecoveryConfig {
            call_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (agent, table) = agent(registrar, Arc::new(protocol), config);

        let summary = agent.run().await.unwrap();
        assert_eq!(summary.recovered.len(), 0);
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].reason.contains("timed out"));
        assert!(!table.contains("s1").await);
    }

    #[tokio::test]
    async fn attempts_respect_concurrency_bound() {
        let assigned: Vec<SessionSummary> =
            (0..12).map(|i| summary_for(&format!("s{i}"))).collect();
        let registrar = Arc::new(StubRegistrar::with_assigned(assigned));
        let protocol = Arc::new(StubProtocol::new(&[]));
        let config = RecoveryConfig {
            concurrency: 3,
            ..Default::default()
        };
        let (agent, _) = agent(registrar, protocol.clone(), config);

        let summary = agent.run().await.unwrap();
        assert_eq!(summary.recovered.len(), 12);
        assert!(protocol.peak.load(Ordering::SeqCst) <= 3);
    }
}
