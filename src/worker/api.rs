//! Wire payloads exchanged between workers and the registry backend.
//!
//! Required fields are `Option` at the wire layer and checked by
//! `validate()`; everything optional defaults, so an old worker and a new
//! backend can disagree about extras without breaking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::registry::registrar::FailedSession;
use crate::registry::{Capabilities, SessionSnapshot, WorkerMetrics, WorkerStatus};

/// Worker registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub endpoint: String,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Periodic worker self-report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Worker lifecycle status. Required.
    pub status: Option<WorkerStatus>,
    /// Resource metrics. Required.
    pub metrics: Option<WorkerMetrics>,
    /// Live sessions the worker currently holds.
    #[serde(default)]
    pub sessions: Vec<SessionSnapshot>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    /// Caller clock at send time. Recorded with the metrics sample only;
    /// liveness always uses server-observed time.
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl HeartbeatPayload {
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.status.is_none() {
            return Err(RegistryError::Validation {
                field: "status",
                reason: "required".to_string(),
            });
        }
        if self.metrics.is_none() {
            return Err(RegistryError::Validation {
                field: "metrics",
                reason: "required".to_string(),
            });
        }
        Ok(())
    }
}

/// Recovery outcomes a worker reports after startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReportRequest {
    #[serde(default)]
    pub recovered: Vec<SessionSnapshot>,
    #[serde(default)]
    pub failed: Vec<FailedSession>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionStatus;

    #[test]
    fn heartbeat_requires_status_and_metrics() {
        let payload = HeartbeatPayload::default();
        assert!(matches!(
            payload.validate(),
            Err(RegistryError::Validation { field: "status", .. })
        ));

        let payload = HeartbeatPayload {
            status: Some(WorkerStatus::Online),
            ..Default::default()
        };
        assert!(matches!(
            payload.validate(),
            Err(RegistryError::Validation { field: "metrics", .. })
        ));

        let payload = HeartbeatPayload {
            status: Some(WorkerStatus::Online),
            metrics: Some(WorkerMetrics::default()),
            ..Default::default()
        };
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn heartbeat_deserializes_with_missing_optionals() {
        let payload: HeartbeatPayload =
            serde_json::from_str(r#"{"status": "online", "metrics": {"session_count": 2}}"#)
                .unwrap();
        assert_eq!(payload.status, Some(WorkerStatus::Online));
        assert!(payload.sessions.is_empty());
        assert!(payload.observed_at.is_none());
    }

    #[test]
    fn session_snapshot_round_trips() {
        let snapshot = SessionSnapshot {
            session_id: "s1".to_string(),
            status: SessionStatus::QrRequired,
            external_identity: None,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("qr_required"));
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
