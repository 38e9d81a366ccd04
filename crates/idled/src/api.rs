//! HTTP API: health, Prometheus metrics and the idle manager control surface

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use idle_lib::{
    ActionOutcome, ComponentStatus, HistoryFilter, IdleAction, IdleError, IdlePolicy,
    InstanceOverride, Manager,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

/// Error body: `{"error": "..."}`
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<IdleError> for ApiError {
    fn from(err: IdleError) -> Self {
        let status = match err {
            IdleError::UnknownInstance { .. } | IdleError::PolicyNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            IdleError::InvalidPolicy { .. } | IdleError::ProtectedPolicy { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "API request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// 200 while operational, 503 once a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.manager.health().health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.manager.health().readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let encoder = TextEncoder::new();
    let metric_families = state.manager.metrics().registry().gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_profiles(State(state): State<Arc<AppState>>) -> Json<Vec<IdlePolicy>> {
    Json(state.manager.list_profiles().await)
}

async fn upsert_profile(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(policy): Json<IdlePolicy>,
) -> ApiResult<IdlePolicy> {
    if policy.name != name {
        return Err(ApiError::bad_request(format!(
            "policy name '{}' does not match path '{}'",
            policy.name, name
        )));
    }
    state.manager.upsert_profile(policy.clone()).await?;
    info!(policy = %name, "Policy saved");
    Ok(Json(policy))
}

async fn delete_profile(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<IdlePolicy> {
    Ok(Json(state.manager.remove_profile(&name).await?))
}

async fn list_states(State(state): State<Arc<AppState>>) -> Json<Vec<idle_lib::IdleState>> {
    Json(state.manager.list_states().await)
}

async fn instance_state(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<idle_lib::IdleState> {
    Ok(Json(state.manager.get_instance_state(&instance_id).await?))
}

/// Assign a policy (and optional field overrides) to an instance.
/// Responds with the policy now in effect.
async fn set_instance_policy(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(over): Json<InstanceOverride>,
) -> ApiResult<IdlePolicy> {
    let name_only = over.idle_minutes.is_none()
        && over.action.is_none()
        && over.notify.is_none()
        && over.thresholds == Default::default();

    match over.policy.clone() {
        Some(policy) if name_only => {
            state
                .manager
                .set_instance_policy(&instance_id, &policy)
                .await?
        }
        _ => state.manager.set_instance_override(&instance_id, over).await?,
    }

    info!(instance_id = %instance_id, "Instance policy updated");
    Ok(Json(state.manager.effective_policy(&instance_id).await))
}

async fn clear_instance_policy(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<IdlePolicy> {
    state.manager.clear_instance_policy(&instance_id).await?;
    Ok(Json(state.manager.effective_policy(&instance_id).await))
}

async fn start_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.start_instance(&instance_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn pending(State(state): State<Arc<AppState>>) -> Json<Vec<idle_lib::PendingAction>> {
    Json(state.manager.pending_actions().await)
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    instance_id: Option<String>,
    action: Option<String>,
    outcome: Option<String>,
    limit: Option<usize>,
}

impl HistoryParams {
    fn into_filter(self) -> Result<HistoryFilter, ApiError> {
        let action = self
            .action
            .map(|a| a.parse::<IdleAction>())
            .transpose()
            .map_err(ApiError::bad_request)?;
        let outcome = self
            .outcome
            .map(|o| o.parse::<ActionOutcome>())
            .transpose()
            .map_err(ApiError::bad_request)?;

        Ok(HistoryFilter {
            instance_id: self.instance_id,
            action,
            outcome,
            since: None,
            limit: self.limit,
        })
    }
}

async fn history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<idle_lib::HistoryEntry>> {
    let filter = params.into_filter()?;
    Ok(Json(state.manager.history(&filter)))
}

async fn sweep(State(state): State<Arc<AppState>>) -> Json<idle_lib::SweepReport> {
    Json(state.manager.execute_ready_actions().await)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/profiles", get(list_profiles))
        .route(
            "/api/v1/profiles/:name",
            put(upsert_profile).delete(delete_profile),
        )
        .route("/api/v1/instances", get(list_states))
        .route("/api/v1/instances/:id/state", get(instance_state))
        .route(
            "/api/v1/instances/:id/policy",
            put(set_instance_policy).delete(clear_instance_policy),
        )
        .route("/api/v1/instances/:id/start", post(start_instance))
        .route("/api/v1/pending", get(pending))
        .route("/api/v1/history", get(history))
        .route("/api/v1/sweep", post(sweep))
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
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
