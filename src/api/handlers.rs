use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tunnel::{TunnelConfig, TunnelResult};

use super::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardList {
    pub success: bool,
    pub forwards: Vec<TunnelConfig>,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct MetadataRequest {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub tunnels: usize,
    pub active: usize,
    pub errored: usize,
    pub model_bridge: bool,
}

fn result_status(result: &TunnelResult) -> StatusCode {
    if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

/// List every registered forward
pub async fn list_forwards(State(state): State<Arc<AppState>>) -> Json<ForwardList> {
    debug!("Listing forwards");
    Json(ForwardList {
        success: true,
        forwards: state.manager.list().await,
    })
}

/// Create (or replace) a forward
pub async fn create_forward(
    State(state): State<Arc<AppState>>,
    Json(config): Json<TunnelConfig>,
) -> (StatusCode, Json<TunnelResult>) {
    let result = state.manager.create(config).await;
    (result_status(&result), Json(result))
}

/// Stop a forward and delete its record
pub async fn stop_forward(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StopRequest>,
) -> (StatusCode, Json<TunnelResult>) {
    let result = state.manager.stop(&request.id).await;
    (result_status(&result), Json(result))
}

/// Get a single forward
pub async fn get_forward(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TunnelConfig>, (StatusCode, Json<ErrorResponse>)> {
    state.manager.get(&id).await.map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                success: false,
                message: format!("Tunnel not found: {}", id),
            }),
        )
    })
}

/// Edit author/tags on the saved record
pub async fn update_metadata(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<MetadataRequest>,
) -> (StatusCode, Json<TunnelResult>) {
    let result = state
        .manager
        .update_metadata(&id, request.author, request.tags)
        .await;
    (result_status(&result), Json(result))
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let summary = state.manager.summary();
    let model_bridge = match state.manager.bridge() {
        Some(bridge) => bridge.healthcheck().await,
        None => false,
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        tunnels: summary.total,
        active: summary.active,
        errored: summary.error,
        model_bridge,
    })
}
