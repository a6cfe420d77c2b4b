//! Worker-side heartbeat loop.
//!
//! Pushes a liveness self-report on a fixed interval: worker status,
//! resource metrics, and a snapshot of every live session. Heartbeats are
//! serialized — one in flight at a time, with superseded ticks coalesced
//! rather than queued — and a failed push never touches the worker's own
//! in-memory session state.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::MissedTickBehavior;

use crate::config::HeartbeatConfig;
use crate::protocol::ProtocolClient;
use crate::registry::{WorkerCommand, WorkerMetrics, WorkerStatus};
use crate::worker::api::HeartbeatPayload;
use crate::worker::client::RegistrarClient;
use crate::worker::sessions::SessionTable;

/// Periodic heartbeat pusher for one worker process.
pub struct HeartbeatLoop {
    worker_id: String,
    client: Arc<dyn RegistrarClient>,
    protocol: Arc<dyn ProtocolClient>,
    table: Arc<SessionTable>,
    config: HeartbeatConfig,
    started_at: Instant,
    consecutive_failures: u32,
}

impl HeartbeatLoop {
    pub fn new(
        worker_id: impl Into<String>,
        client: Arc<dyn RegistrarClient>,
        protocol: Arc<dyn ProtocolClient>,
        table: Arc<SessionTable>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            client,
            protocol,
            table,
            config,
            started_at: Instant::now(),
            consecutive_failures: 0,
        }
    }

    /// Run the heartbeat loop forever.
    pub async fn run(&mut self) {
        tracing::info!(
            worker_id = %self.worker_id,
            interval = ?self.config.interval,
            "Starting heartbeat loop"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        // A beat that overruns the interval coalesces the missed ticks
        // instead of bursting stale heartbeats afterwards.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Don't beat immediately on startup
        interval.tick().await;

        loop {
            interval.tick().await;
            self.beat_once().await;
        }
    }

    /// Send a single heartbeat and apply any commands from the ack.
    pub async fn beat_once(&mut self) {
        let payload = self.build_payload().await;

        match self.client.push_heartbeat(&self.worker_id, &payload).await {
            Ok(ack) => {
                self.consecutive_failures = 0;
                for command in ack.commands {
                    self.apply_command(command).await;
                }
            }
            Err(e) => {
                // The registry will re-learn our state from the next
                // successful beat; local sessions stay untouched.
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_warn_threshold {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        failures = self.consecutive_failures,
                        "Heartbeat push keeps failing: {}",
                        e
                    );
                } else {
                    tracing::debug!(worker_id = %self.worker_id, "Heartbeat push failed: {}", e);
                }
            }
        }
    }

    async fn build_payload(&self) -> HeartbeatPayload {
        let sessions = self.table.snapshot().await;
        HeartbeatPayload {
            status: Some(WorkerStatus::Online),
            metrics: Some(WorkerMetrics {
                session_count: sessions.len() as u32,
                cpu_usage: None,
                memory_usage_bytes: process_rss_bytes(),
                uptime_secs: self.started_at.elapsed().as_secs(),
            }),
            sessions,
            capabilities: None,
            observed_at: Some(chrono::Utc::now()),
        }
    }

    async fn apply_command(&self, command: WorkerCommand) {
        match command {
            WorkerCommand::DropSession { session_id } => {
                tracing::info!(
                    worker_id = %self.worker_id,
                    session_id = %session_id,
                    "Dropping session on registry command"
                );
                if self.table.remove(&session_id).await.is_some() {
                    if let Err(e) = self.protocol.close(&session_id).await {
                        tracing::warn!(
                            session_id = %session_id,
                            "Failed to close dropped session: {}",
                            e
                        );
                    }
                }
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Spawn the heartbeat loop as a background task.
pub fn spawn_heartbeat(
    worker_id: impl Into<String>,
    client: Arc<dyn RegistrarClient>,
    protocol: Arc<dyn ProtocolClient>,
    table: Arc<SessionTable>,
    config: HeartbeatConfig,
) -> tokio::task::JoinHandle<()> {
    let mut heartbeat = HeartbeatLoop::new(worker_id, client, protocol, table, config);
    tokio::spawn(async move {
        heartbeat.run().await;
    })
}

/// Resident set size of this process, when the platform exposes it.
#[cfg(target_os = "linux")]
fn process_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn process_rss_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, ProtocolError};
    use crate::protocol::ResumedSession;
    use crate::registry::registrar::{RecoveryReport, RegisterOutcome};
    use crate::registry::{HeartbeatAck, SessionStatus, SessionSummary};
    use crate::worker::api::{RecoveryReportRequest, RegisterRequest};
    use crate::worker::sessions::LiveSession;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Registrar stub recording pushed heartbeats.
    struct StubRegistrar {
        pushed: Mutex<Vec<HeartbeatPayload>>,
        fail: bool,
        commands: Mutex<Vec<WorkerCommand>>,
    }

    impl StubRegistrar {
        fn new() -> Self {
            Self {
                pushed: Mutex::new(Vec::new()),
                fail: false,
                commands: Mutex::new(Vec::new()),
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
            Ok(Vec::new())
        }

        async fn report_recovery(
            &self,
            _worker_id: &str,
            _request: &RecoveryReportRequest,
        ) -> Result<RecoveryReport, ClientError> {
            Ok(RecoveryReport::default())
        }

        async fn push_heartbeat(
            &self,
            _worker_id: &str,
            heartbeat: &HeartbeatPayload,
        ) -> Result<HeartbeatAck, ClientError> {
            if self.fail {
                return Err(ClientError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.pushed.lock().await.push(heartbeat.clone());
            Ok(HeartbeatAck {
                commands: self.commands.lock().await.drain(..).collect(),
            })
        }

        async fn announce_shutdown(&self, _worker_id: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct NoopProtocol;

    #[async_trait]
    impl ProtocolClient for NoopProtocol {
        async fn resume(&self, session_id: &str) -> Result<ResumedSession, ProtocolError> {
            Err(ProtocolError::MissingMaterial {
                session_id: session_id.to_string(),
            })
        }

        async fn close(&self, _session_id: &str) -> Result<(), ProtocolError> {
            Ok(())
        }
    }

    fn heartbeat_loop(registrar: Arc<StubRegistrar>) -> (HeartbeatLoop, Arc<SessionTable>) {
        let table = Arc::new(SessionTable::new());
        (
            HeartbeatLoop::new(
                "w1",
                registrar,
                Arc::new(NoopProtocol),
                table.clone(),
                HeartbeatConfig::default(),
            ),
            table,
        )
    }

    #[tokio::test]
    async fn beat_reports_live_sessions() {
        let registrar = Arc::new(StubRegistrar::new());
        let (mut heartbeat, table) = heartbeat_loop(registrar.clone());

        table
            .insert(LiveSession {
                session_id: "s1".to_string(),
                status: SessionStatus::Connected,
                external_identity: Some("+100".to_string()),
                opened_at: chrono::Utc::now(),
            })
            .await;

        heartbeat.beat_once().await;

        let pushed = registrar.pushed.lock().await;
        assert_eq!(pushed.len(), 1);
        let payload = &pushed[0];
        assert_eq!(payload.status, Some(WorkerStatus::Online));
        assert_eq!(payload.metrics.as_ref().unwrap().session_count, 1);
        assert_eq!(payload.sessions.len(), 1);
        assert_eq!(payload.sessions[0].session_id, "s1");
        assert!(payload.observed_at.is_some());
    }

    #[tokio::test]
    async fn drop_command_retires_local_session() {
        let registrar = Arc::new(StubRegistrar::new());
        registrar
            .commands
            .lock()
            .await
            .push(WorkerCommand::DropSession {
                session_id: "s1".to_string(),
            });
        let (mut heartbeat, table) = heartbeat_loop(registrar);

        table
            .insert(LiveSession {
                session_id: "s1".to_string(),
                status: SessionStatus::Connected,
                external_identity: None,
                opened_at: chrono::Utc::now(),
            })
            .await;

        heartbeat.beat_once().await;
        assert!(!table.contains("s1").await);
    }

    #[tokio::test]
    async fn failures_never_clear_local_state() {
        let registrar = Arc::new(StubRegistrar {
            fail: true,
            ..StubRegistrar::new()
        });
        let (mut heartbeat, table) = heartbeat_loop(registrar);

        table
            .insert(LiveSession {
                session_id: "s1".to_string(),
                status: SessionStatus::Connected,
                external_identity: None,
                opened_at: chrono::Utc::now(),
            })
            .await;

        for _ in 0..5 {
            heartbeat.beat_once().await;
        }

        assert_eq!(heartbeat.consecutive_failures(), 5);
        assert!(table.contains("s1").await);
    }
}
