//! Control-plane API: tunnel create/list/status/delete and service info

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ApiError, ErrorBody};
use crate::models::*;
use crate::AppState;
use burrow_control::{RegistryError, TunnelSnapshot, TunnelSpec};

/// First path segments that are never tunnel ids
pub const RESERVED_PREFIXES: &[&str] = &["api", "health"];

/// Operator authentication middleware.
///
/// The credential travels in a configurable header (default `x-api-key`).
/// A missing header is 401; a wrong one is 403.
pub async fn require_operator(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header_name = state.config.auth_header.as_str();

    let provided = request
        .headers()
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let valid = provided == state.config.api_key
        || state
            .config
            .admin_key
            .as_deref()
            .is_some_and(|admin| provided == admin);

    if !valid {
        return Err(ApiError::Forbidden);
    }

    Ok(next.run(request).await)
}

/// Create a new tunnel; returns the attach token exactly once
pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTunnelRequest>,
) -> Result<Json<CreateTunnelResponse>, ApiError> {
    let created = state
        .registry
        .create(TunnelSpec {
            name: request.name,
            local_port: request.local_port,
            metadata: request.metadata,
        })
        .await
        .map_err(|e| match e {
            RegistryError::CapacityExceeded(_) => ApiError::CapacityExceeded,
            RegistryError::MetadataTooLarge(max) => {
                ApiError::InvalidRequest(format!("metadata exceeds {max} entries"))
            }
            _ => ApiError::Internal,
        })?;

    info!(tunnel_id = %created.tunnel_id, "created tunnel via api");

    Ok(Json(CreateTunnelResponse {
        url: state.config.tunnel_url(&created.tunnel_id),
        tunnel_id: created.tunnel_id,
        auth_token: created.auth_token,
        created_at: created.created_at,
    }))
}

/// List all tunnels
pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TunnelListResponse>, ApiError> {
    debug!("listing tunnels");
    let tunnels = state.registry.list().await;
    let total = tunnels.len();
    Ok(Json(TunnelListResponse { tunnels, total }))
}

/// Snapshot of a single tunnel
pub async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(tunnel_id): Path<String>,
) -> Result<Json<TunnelSnapshot>, ApiError> {
    state
        .registry
        .snapshot(&tunnel_id)
        .await
        .map(Json)
        .ok_or(ApiError::TunnelNotFound)
}

/// Delete a tunnel; severs any attached session
pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Path(tunnel_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.registry.delete(&tunnel_id).await {
        info!(tunnel_id = %tunnel_id, "deleted tunnel via api");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::TunnelNotFound)
    }
}

/// Health check
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: "burrow".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.config.environment.clone(),
        active_tunnels: state.registry.count().await,
    })
}

/// Control-plane route listing
pub async fn api_info() -> Json<serde_json::Value> {
    Json(json!({
        "name": "burrow",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": {
            "create": "POST /api/tunnels/create",
            "list": "GET /api/tunnels/list",
            "status": "GET /api/tunnels/{id}/status",
            "delete": "DELETE /api/tunnels/{id}",
            "connect": "GET /api/tunnel/connect/{id}",
            "proxy": "ANY /{id}/{path}",
        },
    }))
}

/// Root returns a JSON 404 to discourage scanning
pub async fn root() -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "NOT_FOUND".to_string(),
            message: "not found".to_string(),
        }),
    )
}
