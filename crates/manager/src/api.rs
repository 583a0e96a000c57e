//! HTTP API: strategy creation and listing, health and metrics

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use sched_lib::{
    distribution::{DistributionError, ErrorKind, IntentDistributor, IntentFilter},
    health::{ComponentStatus, HealthRegistry},
    models::{Intent, IntentState, NewStrategy, Operator, Strategy},
    observability::render_metrics,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Header carrying the caller identity set by the upstream auth layer
pub const OPERATOR_HEADER: &str = "x-operator-id";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub distributor: Arc<IntentDistributor>,
    pub health_registry: HealthRegistry,
}

impl AppState {
    pub fn new(distributor: Arc<IntentDistributor>, health_registry: HealthRegistry) -> Self {
        Self {
            distributor,
            health_registry,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    pub data: T,
    pub timestamp: String,
}

impl<T: Serialize> SuccessResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data,
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            }),
        )
            .into_response()
    }
}

/// Failure rendered as `{success: false, error}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<DistributionError> for ApiError {
    fn from(err: DistributionError) -> Self {
        let status = match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Dependency => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), error = %self.message, "Request failed");
        } else {
            warn!(status = self.status.as_u16(), error = %self.message, "Request rejected");
        }
        (
            self.status,
            Json(ErrorResponse {
                success: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Authenticated caller taken from [`OPERATOR_HEADER`]
pub struct CallerOperator(pub Operator);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CallerOperator {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(OPERATOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized"))?;
        Ok(Self(Operator::new(id)))
    }
}

async fn create_strategy(
    State(state): State<Arc<AppState>>,
    CallerOperator(operator): CallerOperator,
    body: Result<Json<NewStrategy>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|rejection| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Invalid request body: {}", rejection.body_text()),
        )
    })?;

    let report = state.distributor.create_strategy(&operator, request).await?;
    info!(
        strategy_id = %report.strategy.id,
        intents = report.intents_created,
        "Strategy created"
    );
    Ok(SuccessResponse::ok(report))
}

#[derive(Debug, Serialize)]
pub struct StrategiesResponse {
    pub strategies: Vec<Strategy>,
}

async fn list_self_strategies(
    State(state): State<Arc<AppState>>,
    CallerOperator(operator): CallerOperator,
) -> Result<Response, ApiError> {
    let strategies = state.distributor.list_strategies(&operator).await?;
    Ok(SuccessResponse::ok(StrategiesResponse { strategies }))
}

#[derive(Debug, Default, Deserialize)]
pub struct IntentsQuery {
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IntentsResponse {
    pub intents: Vec<Intent>,
}

async fn list_self_intents(
    State(state): State<Arc<AppState>>,
    CallerOperator(operator): CallerOperator,
    Query(query): Query<IntentsQuery>,
) -> Result<Response, ApiError> {
    let states = match query.state.as_deref() {
        None | Some("") => Vec::new(),
        Some(raw) => vec![raw
            .parse::<IntentState>()
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?],
    };

    let intents = state
        .distributor
        .list_intents(
            &operator,
            IntentFilter {
                states,
                ..Default::default()
            },
        )
        .await?;
    Ok(SuccessResponse::ok(IntentsResponse { intents }))
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

/// Readiness check response - returns 200 once the pod cache has synced
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
async fn metrics() -> Result<Response, ApiError> {
    let buffer = render_metrics()
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/strategies", post(create_strategy))
        .route("/api/v1/strategies/self", get(list_self_strategies))
        .route("/api/v1/intents/self", get(list_self_intents))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
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
