//! Worker-side client for the registry backend.
//!
//! The trait keeps the worker runtime testable with stubs; the HTTP
//! implementation talks to the backend's worker routes.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::registry::registrar::{RecoveryReport, RegisterOutcome};
use crate::registry::{HeartbeatAck, SessionSummary};
use crate::worker::api::{HeartbeatPayload, RecoveryReportRequest, RegisterRequest};

/// Calls a worker can make against the registrar and reconciler.
#[async_trait]
pub trait RegistrarClient: Send + Sync {
    async fn register(
        &self,
        worker_id: &str,
        request: &RegisterRequest,
    ) -> Result<RegisterOutcome, ClientError>;

    async fn get_assigned_sessions(
        &self,
        worker_id: &str,
    ) -> Result<Vec<SessionSummary>, ClientError>;

    async fn report_recovery(
        &self,
        worker_id: &str,
        request: &RecoveryReportRequest,
    ) -> Result<RecoveryReport, ClientError>;

    async fn push_heartbeat(
        &self,
        worker_id: &str,
        heartbeat: &HeartbeatPayload,
    ) -> Result<HeartbeatAck, ClientError>;

    /// Best-effort graceful-shutdown signal: preserve sessions, do not
    /// release ownership.
    async fn announce_shutdown(&self, worker_id: &str) -> Result<(), ClientError>;
}

/// HTTP client for the backend's worker routes.
pub struct HttpRegistrarClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpRegistrarClient {
    pub fn new(base_url: impl Into<String>, call_timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, worker_id: &str, path: &str) -> String {
        format!("{}/worker/{}/{}", self.base_url, worker_id, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RegistrarClient for HttpRegistrarClient {
    async fn register(
        &self,
        worker_id: &str,
        request: &RegisterRequest,
    ) -> Result<RegisterOutcome, ClientError> {
        let response = self
            .http
            .post(self.url(worker_id, "register"))
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_assigned_sessions(
        &self,
        worker_id: &str,
    ) -> Result<Vec<SessionSummary>, ClientError> {
        let response = self
            .http
            .get(self.url(worker_id, "sessions"))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn report_recovery(
        &self,
        worker_id: &str,
        request: &RecoveryReportRequest,
    ) -> Result<RecoveryReport, ClientError> {
        let response = self
            .http
            .post(self.url(worker_id, "recovery"))
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn push_heartbeat(
        &self,
        worker_id: &str,
        heartbeat: &HeartbeatPayload,
    ) -> Result<HeartbeatAck, ClientError> {
        let response = self
            .http
            .post(self.url(worker_id, "heartbeat"))
            .json(heartbeat)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn announce_shutdown(&self, worker_id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(worker_id, "shutdown"))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_building_strips_trailing_slash() {
        let client =
            HttpRegistrarClient::new("http://localhost:7070/", Duration::from_secs(10)).unwrap();
        assert_eq!(
            client.url("w1", "heartbeat"),
            "http://localhost:7070/worker/w1/heartbeat"
        );
    }
}
