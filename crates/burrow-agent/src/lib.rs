//! burrow agent library
//!
//! Dials outward to a burrow server, attaches to a tunnel, and serves
//! proxied requests against a local HTTP origin.

pub mod agent;
pub mod dispatch;

pub use agent::{Agent, AgentConfig, AgentError};
pub use dispatch::LocalOrigin;
