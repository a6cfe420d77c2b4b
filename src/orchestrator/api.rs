//! Worker-facing HTTP API for the registry backend.
//!
//! Thin transport layer over the registrar and the reconciler: handlers
//! translate payloads and map the registry error taxonomy onto status
//! codes. Auth and framing concerns live outside this crate.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::error::RegistryError;
use crate::registry::registrar::CreateSession;
use crate::registry::{HeartbeatReconciler, SessionRegistrar};
use crate::worker::api::{HeartbeatPayload, RecoveryReportRequest, RegisterRequest};

/// Shared state for the registry API.
#[derive(Clone)]
pub struct ApiState {
    pub registrar: Arc<SessionRegistrar>,
    pub reconciler: Arc<HeartbeatReconciler>,
}

/// The registry's worker-facing API server.
pub struct RegistryApi;

impl RegistryApi {
    /// Build the axum router.
    pub fn router(state: ApiState) -> Router {
        Router::new()
            .route("/worker/{worker_id}/register", post(register_worker))
            .route("/worker/{worker_id}/sessions", get(get_assigned_sessions))
            .route("/worker/{worker_id}/recovery", post(report_recovery))
            .route("/worker/{worker_id}/heartbeat", post(push_heartbeat))
            .route("/worker/{worker_id}/shutdown", post(announce_shutdown))
            .route("/sessions", post(create_session))
            .route("/sessions/{session_id}", axum::routing::delete(delete_session))
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the API server on the given address.
    pub async fn start(
        state: ApiState,
        host: &str,
        port: u16,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let router = Self::router(state);
        let addr = format!("{}:{}", host, port);

        tracing::info!("Registry API listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed: Option<Vec<String>>,
}

/// Map the error taxonomy onto transport status codes.
fn error_response(err: RegistryError) -> Response {
    let status = match &err {
        RegistryError::Validation { .. } => StatusCode::BAD_REQUEST,
        RegistryError::UnknownWorker { .. } | RegistryError::UnknownSession { .. } => {
            StatusCode::NOT_FOUND
        }
        RegistryError::StaleOwnership { .. } => StatusCode::CONFLICT,
        RegistryError::PartialWrite { .. } => StatusCode::MULTI_STATUS,
        RegistryError::Store(_) | RegistryError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    let failed = match &err {
        RegistryError::PartialWrite { failed, .. } => Some(failed.clone()),
        _ => None,
    };

    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
            failed,
        }),
    )
        .into_response()
}

// -- Handlers --

async fn health_check() -> &'static str {
    "ok"
}

async fn register_worker(
    State(state): State<ApiState>,
    Path(worker_id): Path<String>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    match state
        .registrar
        .register_worker(
            &worker_id,
            &request.endpoint,
            request.capacity,
            &request.capabilities,
        )
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_assigned_sessions(
    State(state): State<ApiState>,
    Path(worker_id): Path<String>,
) -> Response {
    match state.registrar.get_assigned_sessions(&worker_id).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => error_response(e),
    }
}

async fn report_recovery(
    State(state): State<ApiState>,
    Path(worker_id): Path<String>,
    Json(request): Json<RecoveryReportRequest>,
) -> Response {
    match state
        .registrar
        .report_recovery_outcome(&worker_id, &request.recovered, &request.failed)
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

async fn push_heartbeat(
    State(state): State<ApiState>,
    Path(worker_id): Path<String>,
    Json(heartbeat): Json<HeartbeatPayload>,
) -> Response {
    match state
        .reconciler
        .ingest_heartbeat(&worker_id, &heartbeat)
        .await
    {
        Ok(ack) => Json(ack).into_response(),
        Err(e) => error_response(e),
    }
}

async fn announce_shutdown(
    State(state): State<ApiState>,
    Path(worker_id): Path<String>,
) -> Response {
    match state.registrar.suspend_worker(&worker_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_session(
    State(state): State<ApiState>,
    Json(request): Json<CreateSession>,
) -> Response {
    match state.registrar.create_session(request).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.registrar.delete_session(&session_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}
