//! Request/response models for the control plane

use burrow_control::TunnelSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request body for creating a tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    /// Friendly name for the tunnel
    #[serde(default)]
    pub name: Option<String>,
    /// Local port the agent intends to forward to (informational)
    #[serde(default)]
    pub local_port: Option<u16>,
    /// Additional metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Response for tunnel creation. The auth token appears here and nowhere
/// else; it is not retrievable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelResponse {
    pub tunnel_id: String,
    pub auth_token: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Response for listing tunnels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelListResponse {
    pub tunnels: Vec<TunnelSnapshot>,
    pub total: usize,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
    pub environment: String,
    pub active_tunnels: usize,
}
