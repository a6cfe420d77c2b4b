//! Worker-side runtime: registration, startup recovery, heartbeats, and
//! the local session table.
//!
//! The binary embedding this runtime supplies the real protocol client;
//! everything else (registrar client, session table, loops) is wired here.

pub mod api;
pub mod client;
pub mod heartbeat;
pub mod recovery;
pub mod sessions;

use std::sync::Arc;

use crate::config::{HeartbeatConfig, RecoveryConfig};
use crate::error::ClientError;
use crate::protocol::ProtocolClient;
use crate::registry::Capabilities;
use crate::worker::api::RegisterRequest;
use crate::worker::client::RegistrarClient;
use crate::worker::heartbeat::HeartbeatLoop;
use crate::worker::recovery::{RecoveryAgent, RecoverySummary};
use crate::worker::sessions::SessionTable;

pub use client::HttpRegistrarClient;
pub use sessions::LiveSession;

/// One worker process's connection to the registry.
pub struct WorkerRuntime {
    worker_id: String,
    endpoint: String,
    capacity: u32,
    capabilities: Capabilities,
    client: Arc<dyn RegistrarClient>,
    protocol: Arc<dyn ProtocolClient>,
    table: Arc<SessionTable>,
    heartbeat_config: HeartbeatConfig,
    recovery_config: RecoveryConfig,
}

impl WorkerRuntime {
    pub fn new(
        worker_id: impl Into<String>,
        endpoint: impl Into<String>,
        client: Arc<dyn RegistrarClient>,
        protocol: Arc<dyn ProtocolClient>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            endpoint: endpoint.into(),
            capacity: 32,
            capabilities: Capabilities::default(),
            client,
            protocol,
            table: Arc::new(SessionTable::new()),
            heartbeat_config: HeartbeatConfig::default(),
            recovery_config: RecoveryConfig::default(),
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_heartbeat_config(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat_config = config;
        self
    }

    pub fn with_recovery_config(mut self, config: RecoveryConfig) -> Self {
        self.recovery_config = config;
        self
    }

    /// The worker's live session table, shared with the embedding binary.
    pub fn sessions(&self) -> Arc<SessionTable> {
        Arc::clone(&self.table)
    }

    /// Bring the worker online: register, recover previously owned
    /// sessions, then start heartbeating.
    ///
    /// Recovery runs to completion (or the startup budget) before this
    /// returns, so the caller only starts accepting new session-create
    /// load once recovery is settled.
    pub async fn start(&self) -> Result<tokio::task::JoinHandle<()>, ClientError> {
        let outcome = self
            .client
            .register(
                &self.worker_id,
                &RegisterRequest {
                    endpoint: self.endpoint.clone(),
                    capacity: self.capacity,
                    capabilities: self.capabilities.clone(),
                },
            )
            .await?;

        if outcome.is_recovery {
            tracing::info!(
                worker_id = %self.worker_id,
                sessions = outcome.previous_sessions.len(),
                "Resuming previous worker identity"
            );
        }

        match self.recover().await {
            Ok(summary) if summary.attempted() > 0 => {
                tracing::info!(
                    worker_id = %self.worker_id,
                    recovered = summary.recovered.len(),
                    failed = summary.failed.len(),
                    "Startup recovery finished"
                );
            }
            Ok(_) => {}
            Err(e) => return Err(e),
        }

        Ok(heartbeat::spawn_heartbeat(
            self.worker_id.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.protocol),
            Arc::clone(&self.table),
            self.heartbeat_config.clone(),
        ))
    }

    async fn recover(&self) -> Result<RecoverySummary, ClientError> {
        let agent = RecoveryAgent::new(
            self.worker_id.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.protocol),
            Arc::clone(&self.table),
            self.recovery_config.clone(),
        );

        match tokio::time::timeout(self.recovery_config.startup_timeout, agent.run()).await {
            Ok(result) => result,
            Err(_) => {
                // Unattempted sessions stay owned in the registry until
                // the stale sweep reclaims them.
                tracing::warn!(
                    worker_id = %self.worker_id,
                    budget = ?self.recovery_config.startup_timeout,
                    "Startup recovery exceeded its budget, continuing"
                );
                Ok(RecoverySummary::default())
            }
        }
    }

    /// Graceful shutdown: stop heartbeating and tell the registry to keep
    /// our sessions so a restart reclaims them without waiting out the
    /// stale timeout.
    pub async fn shutdown(&self, heartbeat: tokio::task::JoinHandle<()>) {
        heartbeat.abort();
        if let Err(e) = self.client.announce_shutdown(&self.worker_id).await {
            tracing::warn!(
                worker_id = %self.worker_id,
                "Shutdown announcement failed, sessions will be reclaimed by the stale sweep: {}",
                e
            );
        }
    }

    /// Build a heartbeat loop without spawning it. Lets embedders drive
    /// the beats themselves.
    pub fn heartbeat_loop(&self) -> HeartbeatLoop {
        HeartbeatLoop::new(
            self.worker_id.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.protocol),
            Arc::clone(&self.table),
            self.heartbeat_config.clone(),
        )
    }
}
