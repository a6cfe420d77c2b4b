//! Registry core: domain records, the registrar, the heartbeat reconciler,
//! and the stale-worker monitor.
//!
//! The registry is the authoritative record of which messaging session is
//! owned by which worker. Ownership changes only ever flow through the
//! registrar (claim, release) or the monitor (forced release on staleness);
//! the reconciler syncs per-session state for sessions a worker already
//! owns.

pub mod lock;
pub mod monitor;
pub mod reconciler;
pub mod registrar;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use monitor::{StaleWorkerMonitor, SweepOutcome, spawn_monitor};
pub use reconciler::{HeartbeatAck, HeartbeatReconciler, WorkerCommand};
pub use registrar::{RecoveryReport, RegisterOutcome, SessionRegistrar};

/// Worker lifecycle status.
///
/// A worker becomes `Online` only through an explicit registration or a
/// heartbeat carrying a fresh timestamp. Workers are never hard-deleted;
/// they are demoted to `Offline` (stale sweep) or parked in `Maintenance`
/// (graceful shutdown, sessions preserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
    Maintenance,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Online => "online",
            WorkerStatus::Offline => "offline",
            WorkerStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(WorkerStatus::Online),
            "offline" => Some(WorkerStatus::Offline),
            "maintenance" => Some(WorkerStatus::Maintenance),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Init,
    QrRequired,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
}

impl SessionStatus {
    /// Whether this status requires a live owning worker.
    ///
    /// An active session must have a non-null owner that is itself Online;
    /// `Disconnected` and `Error` sessions must have no owner.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Init
                | SessionStatus::QrRequired
                | SessionStatus::Connected
                | SessionStatus::Reconnecting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Init => "init",
            SessionStatus::QrRequired => "qr_required",
            SessionStatus::Connected => "connected",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(SessionStatus::Init),
            "qr_required" => Some(SessionStatus::QrRequired),
            "connected" => Some(SessionStatus::Connected),
            "reconnecting" => Some(SessionStatus::Reconnecting),
            "disconnected" => Some(SessionStatus::Disconnected),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature set and version a worker reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Resource metrics a worker self-reports with each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub session_count: u32,
    #[serde(default)]
    pub cpu_usage: Option<f64>,
    #[serde(default)]
    pub memory_usage_bytes: Option<u64>,
    #[serde(default)]
    pub uptime_secs: u64,
}

/// Durable record of a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub endpoint: String,
    pub status: WorkerStatus,
    pub capacity: u32,
    pub session_count: u32,
    pub capabilities: Capabilities,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable record of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: Option<String>,
    pub name: Option<String>,
    /// Owning worker; `None` means unassigned.
    pub owner_worker: Option<String>,
    pub status: SessionStatus,
    /// External identity (e.g. phone number), set once the session connects.
    pub external_identity: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            status: self.status,
            external_identity: self.external_identity.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What a worker gets back when asking which sessions it should own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub status: SessionStatus,
    pub external_identity: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-session state a worker reports in a heartbeat or recovery report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub external_identity: Option<String>,
}
