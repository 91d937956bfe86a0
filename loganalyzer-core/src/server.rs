//! HTTP surface of the coordinator
//!
//! Worker protocol (`/register`, `/health`, `/work`, `/complete`, `/failed`)
//! and operator views (`/status`, `/workers`, `/chunks/failed`, `/metrics`)
//! served by axum over the shared [`Coordinator`].

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::error::{AnalyzerError, Result};
use crate::metrics;
use crate::protocol::{
    Ack, CompleteRequest, ErrorBody, FailedRequest, HealthReport, RegisterRequest, WorkQuery,
};
use crate::runtime::ShutdownSignal;

impl IntoResponse for AnalyzerError {
    fn into_response(self) -> Response {
        let status = match &self {
            AnalyzerError::InvalidInput { .. } | AnalyzerError::InvalidMessage { .. } => {
                StatusCode::BAD_REQUEST
            }
            AnalyzerError::UnknownWorker { .. } | AnalyzerError::ChunkNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            AnalyzerError::StaleAssignment { .. } | AnalyzerError::DuplicateChunk { .. } => {
                StatusCode::CONFLICT
            }
            AnalyzerError::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            warn!("Request failed: {}", self);
        } else {
            debug!("Request rejected ({}): {}", status, self);
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Router over a shared coordinator
pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/health", post(health))
        .route("/work", get(work))
        .route("/complete", post(complete))
        .route("/failed", post(failed))
        .route("/status", get(status))
        .route("/workers", get(workers))
        .route("/chunks/failed", get(failed_chunks))
        .route("/metrics", get(prometheus))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

/// Bind a listener, accepting `host:port` strings such as `0.0.0.0:8080`
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    Ok(listener)
}

/// Serve `router` on `listener` until `shutdown` fires
pub async fn serve(listener: TcpListener, router: Router, shutdown: ShutdownSignal) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP server listening on http://{}", addr);
    }

    let mut stop = shutdown.subscribe();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await?;
    Ok(())
}

// ─── Handlers ────────────────────────────────────────────────────

async fn register(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Ack>> {
    coordinator.register_worker(req).await?;
    Ok(Json(Ack::ok()))
}

async fn health(
    State(coordinator): State<Arc<Coordinator>>,
    Json(report): Json<HealthReport>,
) -> Result<Json<Ack>> {
    coordinator.report_health(report).await?;
    Ok(Json(Ack::ok()))
}

async fn work(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<WorkQuery>,
) -> Result<Response> {
    match coordinator.request_work(&query.worker_id).await? {
        Some(assignment) => Ok(Json(assignment).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn complete(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<Ack>> {
    coordinator.complete_chunk(req).await?;
    Ok(Json(Ack::ok()))
}

async fn failed(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<FailedRequest>,
) -> Result<Json<Ack>> {
    coordinator.fail_chunk(req).await?;
    Ok(Json(Ack::ok()))
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(coordinator.status().await)
}

async fn workers(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(coordinator.workers().await)
}

async fn failed_chunks(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(coordinator.failed_chunks().await)
}

async fn prometheus() -> impl IntoResponse {
    metrics::gather_system_metrics()
}
