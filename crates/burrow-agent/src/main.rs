//! burrow agent CLI
//!
//! Exposes a local HTTP service through a burrow tunnel server.

use anyhow::{Context, Result};
use burrow_agent::{agent::attach_hint, Agent, AgentConfig, AgentError, LocalOrigin};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// burrow agent - expose a local HTTP service through a tunnel server
#[derive(Parser, Debug)]
#[command(name = "burrow-agent")]
#[command(about = "burrow agent - expose a local HTTP service through a tunnel server")]
#[command(version)]
#[command(long_about = r#"
The agent dials outward to a burrow server, attaches to a tunnel, and
forwards proxied requests to a local HTTP service.

EXAMPLES:
  # Create a tunnel and forward it to localhost:3000
  burrow-agent --server tunnel.example.com:8989 --api-key $KEY --port 3000

  # Reattach to a previously created tunnel
  burrow-agent --server tunnel.example.com:8989 \
    --tunnel-id ab12cd34ef56g --token $TUNNEL_TOKEN --port 3000

ENVIRONMENT VARIABLES:
  BURROW_SERVER       Tunnel server address (host:port)
  BURROW_API_KEY      Operator credential for creating tunnels
  BURROW_TUNNEL_ID    Pre-issued tunnel id
  BURROW_AUTH_TOKEN   Pre-issued attach token
  BURROW_LOCAL_PORT   Local port to forward to
"#)]
struct Args {
    /// Tunnel server address (host:port)
    #[arg(long, env = "BURROW_SERVER")]
    server: String,

    /// Operator credential used to create the tunnel
    #[arg(long, env = "BURROW_API_KEY")]
    api_key: Option<String>,

    /// Header carrying the operator credential
    #[arg(long, default_value = "x-api-key")]
    auth_header: String,

    /// Pre-issued tunnel id (skips the create call; requires --token)
    #[arg(long, env = "BURROW_TUNNEL_ID", requires = "token")]
    tunnel_id: Option<String>,

    /// Pre-issued attach token (requires --tunnel-id)
    #[arg(long, env = "BURROW_AUTH_TOKEN", requires = "tunnel_id")]
    token: Option<String>,

    /// Local port to forward to
    #[arg(long, short = 'p', env = "BURROW_LOCAL_PORT")]
    port: u16,

    /// Local host to forward to
    #[arg(long, default_value = "localhost", env = "BURROW_LOCAL_HOST")]
    host: String,

    /// Scheme for the local origin (http or https)
    #[arg(long, default_value = "http")]
    scheme: String,

    /// Friendly name for the tunnel
    #[arg(long)]
    name: Option<String>,

    /// Metadata entries (key=value), repeatable
    #[arg(long = "metadata", value_parser = parse_key_value)]
    metadata: Vec<(String, String)>,

    /// Use https/wss toward the server
    #[arg(long)]
    tls: bool,

    /// Per-request timeout against the local origin, in seconds
    #[arg(long, default_value = "28")]
    local_timeout_secs: u64,

    /// Grace window for in-flight requests on shutdown, in seconds
    #[arg(long, default_value = "5")]
    drain_grace_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid metadata entry '{raw}', expected key=value"))
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {log_level}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn build_agent_config(args: Args) -> AgentConfig {
    AgentConfig {
        server: args.server,
        api_key: args.api_key,
        auth_header: args.auth_header,
        tunnel_id: args.tunnel_id,
        auth_token: args.token,
        origin: LocalOrigin {
            scheme: args.scheme,
            host: args.host,
            port: args.port,
        },
        name: args.name,
        metadata: args.metadata.into_iter().collect::<HashMap<_, _>>(),
        tls: args.tls,
        local_timeout: Duration::from_secs(args.local_timeout_secs),
        drain_grace: Duration::from_secs(args.drain_grace_secs),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    let config = build_agent_config(args);

    info!(server = %config.server, origin = %config.origin, "burrow agent starting");

    let agent = Arc::new(Agent::new(config).context("failed to create agent")?);

    let mut runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("interrupt received, shutting down");
            agent.trigger_shutdown();
            match runner.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "agent exited with error during shutdown"),
                Err(e) => error!(error = %e, "agent task panicked"),
            }
        }
        result = &mut runner => {
            match result {
                Ok(Ok(())) => info!("agent stopped"),
                Ok(Err(AgentError::AttachRejected { kind, message })) => {
                    error!(kind, message = %message, hint = attach_hint(kind), "attach rejected");
                    anyhow::bail!("attach rejected: {kind}");
                }
                Ok(Err(e)) => {
                    error!(error = %e, "agent error");
                    return Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, "agent task panicked");
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("env=staging").unwrap(),
            ("env".to_string(), "staging".to_string())
        );
        assert_eq!(
            parse_key_value("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("no-equals").is_err());
    }

    #[test]
    fn test_args_require_server_and_port() {
        let result = Args::try_parse_from(["burrow-agent"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_args_minimal_invocation() {
        let args = Args::try_parse_from([
            "burrow-agent",
            "--server",
            "localhost:8989",
            "--api-key",
            "key",
            "--port",
            "3000",
        ])
        .unwrap();
        assert_eq!(args.server, "localhost:8989");
        assert_eq!(args.port, 3000);
        assert_eq!(args.host, "localhost");
        assert_eq!(args.scheme, "http");
    }

    #[test]
    fn test_args_token_requires_tunnel_id() {
        let result = Args::try_parse_from([
            "burrow-agent",
            "--server",
            "localhost:8989",
            "--port",
            "3000",
            "--token",
            "tok",
        ]);
        assert!(result.is_err());
    }
}
