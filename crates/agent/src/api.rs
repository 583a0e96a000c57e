//! HTTP API: intent intake, pod process view, health and metrics

use crate::inbox::IntentInbox;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use sched_lib::{
    health::{components, ComponentStatus, HealthRegistry},
    models::IntentBatch,
    observability::{render_metrics, SchedMetrics, StructuredLogger},
    resolver::{ProcessResolver, ScanResult},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: SchedMetrics,
    pub logger: StructuredLogger,
    pub inbox: Arc<IntentInbox>,
    pub resolver: Arc<ProcessResolver>,
    pub latest_scan: watch::Receiver<Arc<ScanResult>>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        logger: StructuredLogger,
        resolver: Arc<ProcessResolver>,
        latest_scan: watch::Receiver<Arc<ScanResult>>,
    ) -> Self {
        Self {
            health_registry,
            metrics: SchedMetrics::new(),
            logger,
            inbox: Arc::new(IntentInbox::new()),
            resolver,
            latest_scan,
        }
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: error.into(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub timestamp: String,
}

impl<T> SuccessResponse<T> {
    fn with(data: Option<T>) -> Self {
        Self {
            success: true,
            data,
            timestamp: timestamp(),
        }
    }
}

/// Accept an intent batch as a whole
async fn receive_intents(
    State(state): State<Arc<AppState>>,
    body: Result<Json<IntentBatch>, JsonRejection>,
) -> Response {
    let Json(batch) = match body {
        Ok(batch) => batch,
        Err(rejection) => {
            let reason = rejection.body_text();
            warn!(error = %reason, "Rejecting malformed intent batch");
            state
                .health_registry
                .set_degraded(
                    components::INTAKE,
                    format!("Last intent batch rejected: {}", reason),
                )
                .await;
            return error_response(StatusCode::BAD_REQUEST, reason);
        }
    };

    let stored = state.inbox.store_batch(&batch);
    state.health_registry.set_healthy(components::INTAKE).await;
    state.metrics.add_intents_received(stored as u64);

    let with_processes = match state.resolver.scan().await {
        Ok(pods) => {
            state.health_registry.set_healthy(components::RESOLVER).await;
            let live: HashSet<&str> = pods.iter().map(|p| p.pod_uid.as_str()).collect();
            batch
                .intents
                .iter()
                .filter(|i| live.contains(i.pod_id.as_str()))
                .count()
        }
        Err(e) => {
            warn!(error = %e, "Process scan failed during intake");
            state
                .health_registry
                .set_degraded(components::RESOLVER, e.to_string())
                .await;
            0
        }
    };

    state
        .logger
        .log_intents_received(batch.intents.len(), with_processes);
    (StatusCode::OK, Json(SuccessResponse::<()>::with(None))).into_response()
}

async fn list_intents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(SuccessResponse::with(Some(state.inbox.list())))
}

#[derive(Debug, Default, Deserialize)]
pub struct PodsQuery {
    #[serde(default)]
    pub refresh: bool,
}

/// Latest process scan; `?refresh=true` scans now
async fn list_pods(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PodsQuery>,
) -> Response {
    if !query.refresh {
        let latest = ScanResult::clone(&state.latest_scan.borrow());
        return Json(SuccessResponse::with(Some(latest))).into_response();
    }

    match state.resolver.scan().await {
        Ok(pods) => {
            let scan = ScanResult {
                scanned_at: Some(Utc::now()),
                pods,
            };
            Json(SuccessResponse::with(Some(scan))).into_response()
        }
        Err(e) => {
            warn!(error = %e, "On-demand process scan failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
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
    match render_metrics() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            buffer,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub message: String,
    pub version: String,
    pub endpoints: String,
}

async fn version() -> impl IntoResponse {
    Json(VersionResponse {
        message: "sched-agent".to_string(),
        version: AGENT_VERSION.to_string(),
        endpoints: "/api/v1/intents, /api/v1/pods, /healthz, /readyz, /metrics".to_string(),
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            sched_lib::distribution::INTENTS_PATH,
            post(receive_intents).get(list_intents),
        )
        .route("/api/v1/pods", get(list_pods))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/version", get(version))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
