//! Control plane for tunnel orchestration: registry, sessions, clock hooks

pub mod clock;
pub mod ids;
pub mod pending;
pub mod registry;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use pending::PendingRequests;
pub use registry::{
    CreatedTunnel, RegistryConfig, RegistryError, TunnelEntry, TunnelRegistry, TunnelSnapshot,
    TunnelSpec, TunnelStatus,
};
pub use session::{ProxiedRequest, ProxiedResponse, Session, SessionConfig, SessionError};
