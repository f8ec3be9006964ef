//! Tunnel registry and lifecycle management

use crate::clock::Clock;
use crate::ids;
use crate::session::Session;
use burrow_proto::CloseKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("maximum tunnel capacity reached ({0})")]
    CapacityExceeded(usize),

    #[error("tunnel not found")]
    NotFound,

    #[error("invalid attach token")]
    BadToken,

    #[error("a session is already attached to this tunnel")]
    AlreadyAttached,

    #[error("metadata exceeds {0} entries")]
    MetadataTooLarge(usize),
}

/// Tunnel connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Created, waiting for the first attach
    Connecting,
    /// A transport session is attached
    Active,
    /// Previously attached, currently without a session
    Disconnected,
}

/// Parameters for creating a tunnel
#[derive(Debug, Clone, Default)]
pub struct TunnelSpec {
    pub name: Option<String>,
    pub local_port: Option<u16>,
    pub metadata: HashMap<String, String>,
}

/// Result of a successful create; the token is handed out exactly once
#[derive(Debug, Clone)]
pub struct CreatedTunnel {
    pub tunnel_id: String,
    pub auth_token: String,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time copy of a descriptor, safe to hand to the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSnapshot {
    pub tunnel_id: String,
    pub name: Option<String>,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub local_port: Option<u16>,
    pub metadata: HashMap<String, String>,
    pub connected: bool,
}

/// Mutable part of a descriptor, guarded per tunnel
struct TunnelState {
    status: TunnelStatus,
    last_active: Instant,
    last_active_wall: DateTime<Utc>,
    session: Option<Arc<Session>>,
}

/// One tunnel descriptor
pub struct TunnelEntry {
    tunnel_id: String,
    auth_token: String,
    name: Option<String>,
    local_port: Option<u16>,
    metadata: HashMap<String, String>,
    created_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    state: Mutex<TunnelState>,
}

impl TunnelEntry {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// The attached session, if any
    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.lock().unwrap().session.clone()
    }

    /// Record activity now; `last_active` never moves backwards
    pub fn touch(&self) {
        let now = self.clock.now();
        let wall = self.clock.utc_now();
        let mut state = self.state.lock().unwrap();
        if now > state.last_active {
            state.last_active = now;
        }
        if wall > state.last_active_wall {
            state.last_active_wall = wall;
        }
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        let state = self.state.lock().unwrap();
        TunnelSnapshot {
            tunnel_id: self.tunnel_id.clone(),
            name: self.name.clone(),
            status: state.status,
            created_at: self.created_at,
            last_active: state.last_active_wall,
            local_port: self.local_port,
            metadata: self.metadata.clone(),
            connected: state.session.is_some(),
        }
    }
}

/// Registry tuning knobs
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub max_tunnels: usize,
    pub idle_timeout: Duration,
    pub max_metadata_entries: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_tunnels: 100,
            idle_timeout: Duration::from_secs(120),
            max_metadata_entries: 32,
        }
    }
}

/// Process-wide keyed store of tunnel descriptors.
///
/// All operations are safe under concurrent callers. Mutation takes the
/// map write lock briefly; per-descriptor state has its own short-lived
/// lock so activity updates never contend with unrelated tunnels.
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<TunnelEntry>>>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl TunnelRegistry {
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Allocate a fresh id and attach token and insert an unattached
    /// descriptor. Fails when the configured capacity is reached.
    pub async fn create(&self, spec: TunnelSpec) -> Result<CreatedTunnel, RegistryError> {
        if spec.metadata.len() > self.config.max_metadata_entries {
            return Err(RegistryError::MetadataTooLarge(
                self.config.max_metadata_entries,
            ));
        }

        let mut tunnels = self.tunnels.write().await;

        if tunnels.len() >= self.config.max_tunnels {
            warn!(
                capacity = self.config.max_tunnels,
                "tunnel create rejected: capacity reached"
            );
            return Err(RegistryError::CapacityExceeded(self.config.max_tunnels));
        }

        let mut tunnel_id = ids::tunnel_id();
        while tunnels.contains_key(&tunnel_id) {
            tunnel_id = ids::tunnel_id();
        }
        let auth_token = ids::attach_token();

        let created_at = self.clock.utc_now();
        let entry = Arc::new(TunnelEntry {
            tunnel_id: tunnel_id.clone(),
            auth_token: auth_token.clone(),
            name: spec.name.clone(),
            local_port: spec.local_port,
            metadata: spec.metadata,
            created_at,
            clock: self.clock.clone(),
            state: Mutex::new(TunnelState {
                status: TunnelStatus::Connecting,
                last_active: self.clock.now(),
                last_active_wall: created_at,
                session: None,
            }),
        });

        tunnels.insert(tunnel_id.clone(), entry);
        info!(tunnel_id = %tunnel_id, name = ?spec.name, "created tunnel");

        Ok(CreatedTunnel {
            tunnel_id,
            auth_token,
            created_at,
        })
    }

    /// Validate the token and install a session, atomically per tunnel.
    /// A tunnel with a live session rejects further attaches; there is no
    /// silent takeover.
    pub async fn attach(
        &self,
        tunnel_id: &str,
        auth_token: &str,
        session: Arc<Session>,
    ) -> Result<(), RegistryError> {
        let tunnels = self.tunnels.read().await;

        let entry = match tunnels.get(tunnel_id) {
            Some(entry) => entry,
            None => {
                warn!(tunnel_id = %tunnel_id, "attach rejected: tunnel not found");
                return Err(RegistryError::NotFound);
            }
        };

        let mut state = entry.state.lock().unwrap();

        if entry.auth_token != auth_token {
            warn!(tunnel_id = %tunnel_id, "attach rejected: invalid token");
            return Err(RegistryError::BadToken);
        }

        if state.session.is_some() {
            warn!(tunnel_id = %tunnel_id, "attach rejected: session already attached");
            return Err(RegistryError::AlreadyAttached);
        }

        state.session = Some(session);
        state.status = TunnelStatus::Active;
        state.last_active = self.clock.now();
        state.last_active_wall = self.clock.utc_now();

        info!(tunnel_id = %tunnel_id, "attached session");
        Ok(())
    }

    /// Remove the attached session, but only if it is still the one the
    /// caller owns. Idempotent; safe to race with reconnects.
    pub async fn detach(&self, tunnel_id: &str, session_id: Uuid) {
        let tunnels = self.tunnels.read().await;

        if let Some(entry) = tunnels.get(tunnel_id) {
            let mut state = entry.state.lock().unwrap();
            let matches = state
                .session
                .as_ref()
                .is_some_and(|s| s.session_id() == session_id);
            if matches {
                state.session = None;
                state.status = TunnelStatus::Disconnected;
                info!(tunnel_id = %tunnel_id, "detached session");
            }
        }
    }

    /// Remove the descriptor. An attached session is told to terminate.
    /// Returns false when the id was already gone.
    pub async fn delete(&self, tunnel_id: &str) -> bool {
        let removed = self.tunnels.write().await.remove(tunnel_id);

        match removed {
            Some(entry) => {
                let session = entry.state.lock().unwrap().session.take();
                if let Some(session) = session {
                    session.close(CloseKind::AdminDelete);
                }
                info!(tunnel_id = %tunnel_id, "deleted tunnel");
                true
            }
            None => false,
        }
    }

    /// Non-blocking descriptor lookup
    pub async fn lookup(&self, tunnel_id: &str) -> Option<Arc<TunnelEntry>> {
        self.tunnels.read().await.get(tunnel_id).cloned()
    }

    pub async fn snapshot(&self, tunnel_id: &str) -> Option<TunnelSnapshot> {
        self.lookup(tunnel_id).await.map(|entry| entry.snapshot())
    }

    /// Point-in-time copy of every descriptor
    pub async fn list(&self) -> Vec<TunnelSnapshot> {
        self.tunnels
            .read()
            .await
            .values()
            .map(|entry| entry.snapshot())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.tunnels.read().await.len()
    }

    /// Evict descriptors that have no attached session and have been idle
    /// longer than the configured timeout. Attached descriptors are left
    /// alone; heartbeats own their liveness. Returns the eviction count.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut tunnels = self.tunnels.write().await;

        let expired: Vec<String> = tunnels
            .iter()
            .filter(|(_, entry)| {
                let state = entry.state.lock().unwrap();
                state.session.is_none()
                    && now.saturating_duration_since(state.last_active) > self.config.idle_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();

        for tunnel_id in &expired {
            tunnels.remove(tunnel_id);
            info!(tunnel_id = %tunnel_id, "evicted idle tunnel");
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "sweep evicted idle tunnels");
        }
        expired.len()
    }
}
