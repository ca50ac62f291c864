//! HTTP API for health checks, Prometheus metrics and watcher control

use autorange_core::{
    health::{ComponentStatus, HealthRegistry},
    observability::AutoRangeMetrics,
    AugmentedSample, Supervisor, WatcherReport,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AutoRangeMetrics,
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AutoRangeMetrics,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            supervisor,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatcherList {
    pub watchers: Vec<WatcherReport>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatcherDetail {
    #[serde(flatten)]
    pub report: WatcherReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<AugmentedSample>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub workload_id: String,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn not_found(workload_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("no active watcher for workload {}", workload_id),
        }),
    )
        .into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_watchers(State(state): State<Arc<AppState>>) -> Json<WatcherList> {
    Json(WatcherList {
        watchers: state.supervisor.summaries(),
    })
}

async fn get_watcher(
    State(state): State<Arc<AppState>>,
    Path(workload_id): Path<String>,
) -> Response {
    match state.supervisor.report(&workload_id) {
        Some(report) => Json(WatcherDetail {
            report,
            latest: state.supervisor.latest(&workload_id),
        })
        .into_response(),
        None => not_found(&workload_id),
    }
}

async fn pause_watcher(
    State(state): State<Arc<AppState>>,
    Path(workload_id): Path<String>,
) -> Response {
    if !state.supervisor.pause(&workload_id) {
        return not_found(&workload_id);
    }
    info!(workload_id = %workload_id, "Watcher paused via API");
    Json(ControlResponse {
        workload_id,
        state: "paused".to_string(),
    })
    .into_response()
}

async fn resume_watcher(
    State(state): State<Arc<AppState>>,
    Path(workload_id): Path<String>,
) -> Response {
    if !state.supervisor.resume(&workload_id) {
        return not_found(&workload_id);
    }
    info!(workload_id = %workload_id, "Watcher resumed via API");
    Json(ControlResponse {
        workload_id,
        state: "running".to_string(),
    })
    .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/watchers", get(list_watchers))
        .route("/api/v1/watchers/:id", get(get_watcher))
        .route("/api/v1/watchers/:id/pause", post(pause_watcher))
        .route("/api/v1/watchers/:id/resume", post(resume_watcher))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
