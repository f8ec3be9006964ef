//! Environment-based server configuration

use burrow_control::{RegistryConfig, SessionConfig};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set to a non-empty value")]
    MissingKey(&'static str),

    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: &'static str, value: String },
}

/// Server configuration, read from the environment at startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub api_port: u16,
    pub bind_addr: IpAddr,
    /// External base URL used to build public tunnel URLs
    pub public_url: String,
    /// Operator credential; required
    pub api_key: String,
    /// Optional second accepted credential
    pub admin_key: Option<String>,
    /// Header carrying the operator credential
    pub auth_header: String,
    pub environment: String,
    pub request_timeout: Duration,
    pub max_tunnels: usize,
    pub max_body_bytes: usize,
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
    pub max_in_flight: usize,
    pub log_level: String,
}

fn parse_env<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name, value })
        }
        _ => Ok(default),
    }
}

fn string_env(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_port: u16 = parse_env("BURROW_API_PORT", 8989)?;
        let bind_addr: IpAddr = parse_env("BURROW_BIND_ADDR", IpAddr::from([0, 0, 0, 0]))?;

        let api_key = std::env::var("BURROW_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            return Err(ConfigError::MissingKey("BURROW_API_KEY"));
        }
        let admin_key = std::env::var("BURROW_ADMIN_KEY")
            .ok()
            .filter(|v| !v.is_empty());

        let public_url = string_env(
            "BURROW_PUBLIC_URL",
            &format!("http://localhost:{api_port}"),
        );

        Ok(Self {
            api_port,
            bind_addr,
            public_url,
            api_key,
            admin_key,
            auth_header: string_env("BURROW_AUTH_HEADER", "x-api-key"),
            environment: string_env("BURROW_ENVIRONMENT", "local"),
            request_timeout: Duration::from_secs(parse_env("BURROW_REQUEST_TIMEOUT_SECS", 30u64)?),
            max_tunnels: parse_env("BURROW_MAX_TUNNELS", 100usize)?,
            max_body_bytes: parse_env("BURROW_MAX_BODY_BYTES", 10 * 1024 * 1024usize)?,
            max_frame_bytes: parse_env("BURROW_MAX_FRAME_BYTES", 16 * 1024 * 1024usize)?,
            heartbeat_interval: Duration::from_secs(parse_env(
                "BURROW_HEARTBEAT_INTERVAL_SECS",
                10u64,
            )?),
            heartbeat_miss_threshold: parse_env("BURROW_HEARTBEAT_MISS_THRESHOLD", 3u32)?,
            sweep_interval: Duration::from_secs(parse_env("BURROW_SWEEP_INTERVAL_SECS", 60u64)?),
            idle_timeout: Duration::from_secs(parse_env("BURROW_IDLE_TIMEOUT_SECS", 120u64)?),
            max_in_flight: parse_env("BURROW_MAX_IN_FLIGHT", 64usize)?,
            log_level: string_env("BURROW_LOG_LEVEL", "info"),
        })
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_tunnels: self.max_tunnels,
            idle_timeout: self.idle_timeout,
            ..Default::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_in_flight: self.max_in_flight,
            ..Default::default()
        }
    }

    /// Public URL for a tunnel id
    pub fn tunnel_url(&self, tunnel_id: &str) -> String {
        format!("{}/{}", self.public_url.trim_end_matches('/'), tunnel_id)
    }
}

impl Default for ServerConfig {
    /// Defaults matching the documented environment options, with an empty
    /// operator key. `from_env` is the production entry point; this exists
    /// so tests can override just the fields they exercise.
    fn default() -> Self {
        Self {
            api_port: 8989,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            public_url: "http://localhost:8989".to_string(),
            api_key: String::new(),
            admin_key: None,
            auth_header: "x-api-key".to_string(),
            environment: "local".to_string(),
            request_timeout: Duration::from_secs(30),
            max_tunnels: 100,
            max_body_bytes: 10 * 1024 * 1024,
            max_frame_bytes: 16 * 1024 * 1024,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_miss_threshold: 3,
            sweep_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            max_in_flight: 64,
            log_level: "info".to_string(),
        }
    }
}
