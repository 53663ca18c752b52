//! API handlers for Deploy Service

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bothost_common::{DeployError, DeploymentId};
use deployer::{Orchestrator, StartOutcome, StopOutcome};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::{
    ActionResponse, DeployRequest, DeployResponse, DeploymentResponse, LogsQuery, LogsResponse,
};

/// Shared application state
pub struct AppState {
    pub orchestrator: Orchestrator,

    /// Serializes quota check and deploy, so concurrent requests cannot overshoot a plan
    pub deploy_gate: Mutex<()>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            deploy_gate: Mutex::new(()),
        }
    }
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        let status = match &err {
            DeployError::Validation(_) => StatusCode::BAD_REQUEST,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            DeployError::InvalidTransition { .. } => StatusCode::CONFLICT,
            DeployError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
        }
    }
}

fn parse_id(raw: &str) -> Result<DeploymentId, ApiError> {
    Ok(DeploymentId::parse(raw)?)
}

/// Health check
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = match state.orchestrator.engine_health().await {
        Ok(()) => "reachable".to_string(),
        Err(e) => {
            warn!("Health check: {}", e);
            format!("unreachable: {}", e)
        }
    };
    let status = if engine == "reachable" { "healthy" } else { "degraded" };

    Json(serde_json::json!({
        "status": status,
        "service": "deploy-service",
        "engine": engine
    }))
}

/// Queue a new deployment
pub async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<Json<DeployResponse>, ApiError> {
    let Json(payload) = payload.map_err(ApiError::from)?;
    let plan = payload.plan.unwrap_or_default();
    info!(
        "Deploy requested by owner: {} ({:?} plan)",
        payload.owner_id, plan
    );

    let _gate = state.deploy_gate.lock().await;

    let current = state
        .orchestrator
        .list_for_owner(&payload.owner_id)
        .await
        .len();
    if current >= plan.max_deployments() {
        return Err(ApiError {
            status: StatusCode::FORBIDDEN,
            message: format!(
                "Plan limit reached! You have {}/{} deployments. Please upgrade your plan.",
                current,
                plan.max_deployments()
            ),
        });
    }

    let id = state
        .orchestrator
        .deploy(&payload.owner_id, &payload.repo_url, plan.resources())
        .await?;

    Ok(Json(DeployResponse {
        success: true,
        deployment_id: id.to_string(),
        message: "Deployment queued.".to_string(),
    }))
}

/// Get a deployment
pub async fn get_deployment_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let id = parse_id(&id)?;
    let deployment = state.orchestrator.get(&id).await?;

    Ok(Json(DeploymentResponse { deployment }))
}

/// Start a deployment's container
pub async fn start_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let id = parse_id(&id)?;

    let message = match state.orchestrator.start(&id).await? {
        StartOutcome::Started => "Deployment started",
        StartOutcome::AlreadyRunning => "Deployment is already running",
    };

    Ok(Json(ActionResponse {
        success: true,
        message: message.to_string(),
    }))
}

/// Stop a deployment's container
pub async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let id = parse_id(&id)?;

    let message = match state.orchestrator.stop(&id).await? {
        StopOutcome::Stopped => "Deployment stopped",
        StopOutcome::AlreadyStopped => "Deployment was already stopped",
    };

    Ok(Json(ActionResponse {
        success: true,
        message: message.to_string(),
    }))
}

/// Delete a deployment and everything it owns
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let id = parse_id(&id)?;
    info!("Deleting deployment: {}", id);

    state.orchestrator.delete(&id).await?;

    Ok(Json(ActionResponse {
        success: true,
        message: "Deployment deleted".to_string(),
    }))
}

/// Get recent container output
pub async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let id = parse_id(&id)?;
    let logs = state.orchestrator.get_logs(&id, query.tail).await?;

    Ok(Json(LogsResponse { logs }))
}

/// Get all deployments of an owner
pub async fn get_owner_deployments_handler(
    State(state): State<Arc<AppState>>,
    Path(owner_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployments = state.orchestrator.list_for_owner(&owner_id).await;

    Ok(Json(serde_json::json!({
        "owner_id": owner_id,
        "total": deployments.len(),
        "deployments": deployments
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (DeployError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (DeployError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (DeployError::ContainerNotFound("x".into()), StatusCode::NOT_FOUND),
            (
                DeployError::RuntimeUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (DeployError::Build("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                DeployError::Persistence("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[test]
    fn test_invalid_transition_is_conflict() {
        let err = DeployError::InvalidTransition {
            from: bothost_common::DeploymentStatus::Failed,
            to: bothost_common::DeploymentStatus::Running,
        };
        assert_eq!(ApiError::from(err).status, StatusCode::CONFLICT);
    }
}
