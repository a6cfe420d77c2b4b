//! Seam to the external messaging-protocol client.
//!
//! The real client performs device pairing and session I/O; this crate
//! only needs resume/close semantics, so that is the whole trait. Worker
//! binaries inject their client implementation into the runtime.

use async_trait::async_trait;

use crate::error::ProtocolError;
use crate::registry::SessionStatus;

/// A session the protocol client brought back to life.
#[derive(Debug, Clone)]
pub struct ResumedSession {
    pub session_id: String,
    /// Status observed after the resume (usually Connected, sometimes
    /// QrRequired when the pairing expired).
    pub status: SessionStatus,
    /// External identity bound to the session, when known.
    pub external_identity: Option<String>,
}

/// Client for the underlying messaging protocol.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Resume a session from persisted local material.
    ///
    /// Missing material, protocol-level rejection, and connection failures
    /// are all expected outcomes; callers treat them as a failed recovery,
    /// not a fatal error.
    async fn resume(&self, session_id: &str) -> Result<ResumedSession, ProtocolError>;

    /// Close a live session without releasing its registry ownership.
    async fn close(&self, session_id: &str) -> Result<(), ProtocolError>;
}
