//! Agent loop: create/attach, dual pumps, graceful shutdown

use crate::dispatch::{dispatch, LocalOrigin};
use burrow_proto::{CloseKind, CodecError, ErrorKind, Frame, FrameCodec};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("control plane request failed: {0}")]
    ControlPlane(#[from] reqwest::Error),

    #[error("control plane returned {status}: {body}")]
    CreateRejected { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("attach rejected ({kind}): {message}")]
    AttachRejected { kind: &'static str, message: String },

    #[error("transport closed during handshake")]
    HandshakeClosed,
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server address (host:port)
    pub server: String,
    /// Operator credential for the create call
    pub api_key: Option<String>,
    /// Header carrying the operator credential
    pub auth_header: String,
    /// Pre-issued tunnel id; skips the create call when set with the token
    pub tunnel_id: Option<String>,
    /// Pre-issued attach token
    pub auth_token: Option<String>,
    /// Local origin the tunnel forwards to
    pub origin: LocalOrigin,
    /// Friendly tunnel name
    pub name: Option<String>,
    /// Free-form metadata sent at create time
    pub metadata: HashMap<String, String>,
    /// Use https/wss toward the server
    pub tls: bool,
    /// Per-request timeout against the local origin
    pub local_timeout: Duration,
    /// Heartbeat ping cadence
    pub heartbeat_interval: Duration,
    /// Unanswered intervals before giving up on the server
    pub heartbeat_miss_threshold: u32,
    /// How long to let in-flight local calls finish on shutdown
    pub drain_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: "localhost:8989".to_string(),
            api_key: None,
            auth_header: "x-api-key".to_string(),
            tunnel_id: None,
            auth_token: None,
            origin: LocalOrigin {
                scheme: "http".to_string(),
                host: "localhost".to_string(),
                port: 8080,
            },
            name: None,
            metadata: HashMap::new(),
            tls: false,
            local_timeout: Duration::from_secs(28),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_miss_threshold: 3,
            drain_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    tunnel_id: String,
    auth_token: String,
    url: String,
}

/// The tunnel agent: attaches to the server and serves proxied requests
/// against the configured local origin.
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    codec: FrameCodec,
    http: reqwest::Client,
    shutdown_tx: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.server.is_empty() {
            return Err(AgentError::Config("server address is required".to_string()));
        }
        if config.tunnel_id.is_some() != config.auth_token.is_some() {
            return Err(AgentError::Config(
                "a pre-issued tunnel needs both --tunnel-id and --token".to_string(),
            ));
        }
        if config.tunnel_id.is_none() && config.api_key.is_none() {
            return Err(AgentError::Config(
                "an api key is required unless a pre-issued tunnel id and token are given"
                    .to_string(),
            ));
        }
        if !matches!(config.origin.scheme.as_str(), "http" | "https") {
            return Err(AgentError::Config(format!(
                "unsupported local scheme: {}",
                config.origin.scheme
            )));
        }

        let http = reqwest::Client::new();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            codec: FrameCodec::default(),
            http,
            shutdown_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Ask the agent to drain and exit; `run` returns shortly after
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until the server closes the session or shutdown is triggered
    pub async fn run(&self) -> Result<(), AgentError> {
        let (tunnel_id, auth_token) = self.obtain_tunnel().await?;

        let scheme = if self.config.tls { "wss" } else { "ws" };
        let ws_url = format!(
            "{scheme}://{}/api/tunnel/connect/{tunnel_id}",
            self.config.server
        );

        info!(tunnel_id = %tunnel_id, server = %self.config.server, "dialing transport");
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await?;

        let attach = self.codec.encode(&Frame::Attach { auth_token })?;
        ws.send(Message::Text(attach.into())).await?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match self.codec.decode(text.as_str())? {
                    Frame::Ack => break,
                    Frame::Error { kind, message } => {
                        return Err(AgentError::AttachRejected {
                            kind: kind.as_str(),
                            message,
                        });
                    }
                    Frame::Close { kind, message } => {
                        return Err(AgentError::AttachRejected {
                            kind: kind.as_str(),
                            message,
                        });
                    }
                    other => {
                        warn!(frame = other.type_tag(), "unexpected frame during handshake");
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Err(AgentError::HandshakeClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(AgentError::Transport(e)),
            }
        }

        info!(
            tunnel_id = %tunnel_id,
            origin = %self.config.origin,
            "tunnel attached, forwarding traffic"
        );

        self.pump(ws).await;

        info!(tunnel_id = %tunnel_id, "agent stopped");
        Ok(())
    }

    /// Create a tunnel via the control plane, or reuse pre-issued credentials
    async fn obtain_tunnel(&self) -> Result<(String, String), AgentError> {
        if let (Some(id), Some(token)) = (&self.config.tunnel_id, &self.config.auth_token) {
            debug!(tunnel_id = %id, "using pre-issued tunnel credentials");
            return Ok((id.clone(), token.clone()));
        }

        let scheme = if self.config.tls { "https" } else { "http" };
        let url = format!("{scheme}://{}/api/tunnels/create", self.config.server);

        let response = self
            .http
            .post(&url)
            .header(
                self.config.auth_header.as_str(),
                self.config.api_key.as_deref().unwrap_or_default(),
            )
            .json(&serde_json::json!({
                "name": self.config.name,
                "local_port": self.config.origin.port,
                "metadata": self.config.metadata,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::CreateRejected { status, body });
        }

        let created: CreateResponse = response.json().await?;
        info!(
            tunnel_id = %created.tunnel_id,
            url = %created.url,
            "tunnel created"
        );

        Ok((created.tunnel_id, created.auth_token))
    }

    /// Dual-pump loop, roles inverted from the server side: inbound request
    /// frames trigger local dispatch, pings are answered, and the writer
    /// runs the agent's own heartbeat.
    async fn pump(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (ws_tx, mut ws_rx) = ws.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(64);

        let pong_seen = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(Self::writer_pump(
            ws_tx,
            frame_rx,
            self.codec,
            self.config.heartbeat_interval,
            self.config.heartbeat_miss_threshold,
            pong_seen.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            let message = tokio::select! {
                message = ws_rx.next() => message,
                _ = shutdown.changed() => {
                    info!("shutdown requested, draining in-flight requests");
                    self.drain().await;
                    let _ = frame_tx
                        .send(Frame::Close {
                            kind: CloseKind::Shutdown,
                            message: "agent shutting down".to_string(),
                        })
                        .await;
                    break;
                }
            };

            let Some(Ok(message)) = message else {
                info!("transport closed by server");
                break;
            };

            match message {
                Message::Text(text) => match self.codec.decode(text.as_str()) {
                    Ok(Frame::Request {
                        id,
                        method,
                        path,
                        query,
                        headers,
                        body,
                    }) => {
                        debug!(id, %method, %path, "request received");
                        let client = self.http.clone();
                        let origin = self.config.origin.clone();
                        let local_timeout = self.config.local_timeout;
                        let frame_tx = frame_tx.clone();
                        let in_flight = self.in_flight.clone();

                        in_flight.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            let response = dispatch(
                                &client,
                                &origin,
                                local_timeout,
                                id,
                                method,
                                path,
                                query,
                                headers,
                                body,
                            )
                            .await;
                            let _ = frame_tx.send(response).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Ok(Frame::Ping { t }) => {
                        if frame_tx.send(Frame::Pong { t }).await.is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Pong { .. }) => {
                        pong_seen.store(true, Ordering::SeqCst);
                    }
                    Ok(Frame::Close { kind, message }) => {
                        info!(kind = kind.as_str(), message = %message, "server closed the session");
                        break;
                    }
                    Ok(Frame::Error { kind, message }) => {
                        warn!(kind = kind.as_str(), message = %message, "server reported error");
                    }
                    Ok(other) => {
                        error!(frame = other.type_tag(), "protocol violation from server");
                        let _ = frame_tx
                            .send(Frame::Close {
                                kind: CloseKind::Protocol,
                                message: "unexpected frame".to_string(),
                            })
                            .await;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "unreadable frame from server");
                        let _ = frame_tx
                            .send(Frame::Close {
                                kind: CloseKind::MalformedFrame,
                                message: e.to_string(),
                            })
                            .await;
                        break;
                    }
                },
                Message::Close(_) => {
                    info!("transport close received");
                    break;
                }
                _ => {}
            }
        }

        // dropping the sender lets the writer flush queued frames and exit
        drop(frame_tx);
        let _ = writer.await;
    }

    /// Wait for in-flight local dispatches to finish, up to the grace window
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.config.drain_grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.in_flight.load(Ordering::SeqCst),
                    "drain grace elapsed with requests still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Writes queued frames and emits pings for idle intervals; gives up
    /// after the configured number of unanswered pings.
    async fn writer_pump(
        mut ws_tx: futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
        mut frame_rx: mpsc::Receiver<Frame>,
        codec: FrameCodec,
        heartbeat_interval: Duration,
        miss_threshold: u32,
        pong_seen: Arc<AtomicBool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut misses = 0u32;
        let mut ping_outstanding = false;
        let mut sent_in_interval = false;
        let mut ping_tag = 0u64;
        let mut closing = false;

        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let is_close = matches!(frame, Frame::Close { .. });
                    match codec.encode(&frame) {
                        Ok(text) => {
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                            sent_in_interval = true;
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to encode outbound frame");
                        }
                    }
                    if is_close {
                        closing = true;
                    }
                }
                _ = ticker.tick(), if !closing => {
                    if pong_seen.swap(false, Ordering::SeqCst) {
                        misses = 0;
                        ping_outstanding = false;
                    } else if ping_outstanding {
                        misses += 1;
                        if misses >= miss_threshold {
                            warn!(misses, "server stopped answering heartbeats");
                            break;
                        }
                    }
                    if !sent_in_interval {
                        ping_tag += 1;
                        match codec.encode(&Frame::Ping { t: ping_tag }) {
                            Ok(text) => {
                                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                                ping_outstanding = true;
                            }
                            Err(e) => warn!(error = %e, "failed to encode ping"),
                        }
                    }
                    sent_in_interval = false;
                }
                _ = shutdown.changed(), if !closing => {
                    // reader sends the close frame; just stop pinging
                    closing = true;
                }
            }
        }

        let _ = ws_tx.send(Message::Close(None)).await;
        let _ = ws_tx.flush().await;
    }
}

/// Map an attach-rejection kind to advice for the operator
pub fn attach_hint(kind: &str) -> &'static str {
    match kind {
        k if k == ErrorKind::UnknownId.as_str() => {
            "the tunnel no longer exists; create a new one"
        }
        k if k == ErrorKind::BadToken.as_str() => "the attach token does not match",
        k if k == ErrorKind::AlreadyAttached.as_str() => {
            "another agent is already serving this tunnel"
        }
        k if k == ErrorKind::Capacity.as_str() => "the server is at tunnel capacity",
        _ => "the server rejected the attach",
    }
}
