//! WebSocket transport endpoint for agent connections
//!
//! The agent dials `/api/tunnel/connect/{tunnel_id}`, sends an attach frame
//! carrying its token, and on ack enters the dual-pump loop: the reader
//! routes response frames to their waiters and answers pings; the writer
//! drains the session's outbound queue and runs the heartbeat.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::AppState;
use burrow_control::{ProxiedResponse, RegistryError, Session, TunnelEntry};
use burrow_proto::{CloseKind, CodecError, ErrorKind, Frame, FrameCodec};

/// How long the agent has to send its attach frame
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn tunnel_connect(
    State(state): State<Arc<AppState>>,
    Path(tunnel_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, tunnel_id, state))
}

async fn handle_agent_socket(mut socket: WebSocket, tunnel_id: String, state: Arc<AppState>) {
    let codec = state.codec;
    debug!(tunnel_id = %tunnel_id, "agent transport connected, awaiting attach");

    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            debug!(tunnel_id = %tunnel_id, "transport closed before attach");
            return;
        }
        Err(_) => {
            warn!(tunnel_id = %tunnel_id, "attach handshake timed out");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "attach timeout".into(),
                })))
                .await;
            return;
        }
    };

    let auth_token = match codec.decode(first.as_str()) {
        Ok(Frame::Attach { auth_token }) => auth_token,
        Ok(frame) => {
            warn!(tunnel_id = %tunnel_id, frame = frame.type_tag(), "first frame was not attach");
            let _ = send_frame(
                &mut socket,
                &codec,
                &Frame::Close {
                    kind: CloseKind::Protocol,
                    message: "first frame must be attach".to_string(),
                },
            )
            .await;
            let _ = close_socket(&mut socket, close_code::POLICY).await;
            return;
        }
        Err(e) => {
            warn!(tunnel_id = %tunnel_id, error = %e, "unreadable attach frame");
            let _ = send_frame(
                &mut socket,
                &codec,
                &Frame::Close {
                    kind: CloseKind::MalformedFrame,
                    message: e.to_string(),
                },
            )
            .await;
            let _ = close_socket(&mut socket, close_code::POLICY).await;
            return;
        }
    };

    let (session, outbound_rx) = Session::new(tunnel_id.clone(), state.config.session_config());

    if let Err(e) = state
        .registry
        .attach(&tunnel_id, &auth_token, session.clone())
        .await
    {
        let kind = match e {
            RegistryError::NotFound => ErrorKind::UnknownId,
            RegistryError::BadToken => ErrorKind::BadToken,
            RegistryError::AlreadyAttached => ErrorKind::AlreadyAttached,
            RegistryError::CapacityExceeded(_) | RegistryError::MetadataTooLarge(_) => {
                ErrorKind::Capacity
            }
        };
        let _ = send_frame(
            &mut socket,
            &codec,
            &Frame::Error {
                kind,
                message: e.to_string(),
            },
        )
        .await;
        let _ = close_socket(&mut socket, close_code::POLICY).await;
        return;
    }

    // deleted in the attach window; nothing to serve
    let Some(entry) = state.registry.lookup(&tunnel_id).await else {
        session.close(CloseKind::AdminDelete);
        let _ = close_socket(&mut socket, close_code::NORMAL).await;
        return;
    };

    if send_frame(&mut socket, &codec, &Frame::Ack).await.is_err() {
        session.close(CloseKind::PeerClose);
        state.registry.detach(&tunnel_id, session.session_id()).await;
        return;
    }

    info!(
        tunnel_id = %tunnel_id,
        session_id = %session.session_id(),
        "agent attached"
    );

    let (ws_tx, ws_rx) = socket.split();

    let writer = tokio::spawn(writer_pump(
        ws_tx,
        outbound_rx,
        session.clone(),
        entry.clone(),
        codec,
        state.config.heartbeat_interval,
        state.config.heartbeat_miss_threshold,
    ));

    let cause = reader_pump(ws_rx, &session, &entry, &codec).await;
    session.close(cause);

    state.registry.detach(&tunnel_id, session.session_id()).await;
    let _ = writer.await;

    info!(
        tunnel_id = %tunnel_id,
        cause = session.cause().unwrap_or(CloseKind::PeerClose).as_str(),
        late_responses = session.late_responses(),
        "session closed"
    );
}

/// Reads agent frames until the session ends; returns the observed cause
async fn reader_pump(
    mut ws_rx: SplitStream<WebSocket>,
    session: &Arc<Session>,
    entry: &Arc<TunnelEntry>,
    codec: &FrameCodec,
) -> CloseKind {
    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(_) => return CloseKind::PeerClose,
        };

        match message {
            Message::Text(text) => match codec.decode(text.as_str()) {
                Ok(frame) => {
                    entry.touch();
                    match frame {
                        Frame::Response {
                            id,
                            status,
                            headers,
                            body,
                        } => {
                            session.complete_response(
                                id,
                                ProxiedResponse {
                                    status,
                                    headers,
                                    body,
                                },
                            );
                        }
                        Frame::Pong { .. } => session.note_pong(),
                        Frame::Ping { t } => {
                            if session.enqueue(Frame::Pong { t }).await.is_err() {
                                return CloseKind::Shutdown;
                            }
                        }
                        Frame::Error { kind, message } => {
                            // agents may report local failures out of band
                            warn!(
                                tunnel_id = %session.tunnel_id(),
                                kind = kind.as_str(),
                                message = %message,
                                "agent reported error"
                            );
                        }
                        Frame::Close { kind, .. } => {
                            debug!(
                                tunnel_id = %session.tunnel_id(),
                                kind = kind.as_str(),
                                "agent closed the session"
                            );
                            return CloseKind::PeerClose;
                        }
                        other @ (Frame::Attach { .. } | Frame::Ack | Frame::Request { .. }) => {
                            warn!(
                                tunnel_id = %session.tunnel_id(),
                                frame = other.type_tag(),
                                "protocol violation from agent"
                            );
                            return CloseKind::Protocol;
                        }
                    }
                }
                Err(CodecError::FrameTooLarge { size, max }) => {
                    warn!(tunnel_id = %session.tunnel_id(), size, max, "inbound frame too large");
                    return CloseKind::FrameTooLarge;
                }
                Err(CodecError::MalformedFrame(e)) => {
                    warn!(tunnel_id = %session.tunnel_id(), error = %e, "malformed inbound frame");
                    return CloseKind::MalformedFrame;
                }
                Err(e) => {
                    warn!(tunnel_id = %session.tunnel_id(), error = %e, "unusable inbound frame");
                    return CloseKind::Protocol;
                }
            },
            Message::Binary(_) => {
                warn!(tunnel_id = %session.tunnel_id(), "binary message on text transport");
                return CloseKind::Protocol;
            }
            // transport-level ping/pong is handled below the frame protocol
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return CloseKind::PeerClose,
        }
    }
    CloseKind::PeerClose
}

/// Drains the outbound queue onto the socket and runs the heartbeat.
///
/// A ping is emitted for every interval in which no other frame was
/// written; `miss_threshold` intervals with an unanswered ping end the
/// session with `heartbeat_timeout`.
async fn writer_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    session: Arc<Session>,
    entry: Arc<TunnelEntry>,
    codec: FrameCodec,
    heartbeat_interval: Duration,
    miss_threshold: u32,
) {
    let mut shutdown = session.shutdown_signal();
    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut misses = 0u32;
    let mut ping_outstanding = false;
    let mut sent_in_interval = false;
    let mut ping_tag = 0u64;

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                match codec.encode(&frame) {
                    Ok(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            session.close(CloseKind::PeerClose);
                            break;
                        }
                        entry.touch();
                        sent_in_interval = true;
                    }
                    Err(CodecError::FrameTooLarge { size, max }) => {
                        warn!(
                            tunnel_id = %session.tunnel_id(),
                            size,
                            max,
                            "outbound frame exceeds cap, closing session"
                        );
                        session.close(CloseKind::FrameTooLarge);
                        finish(&mut ws_tx, &codec, CloseKind::FrameTooLarge).await;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound frame");
                    }
                }
            }
            _ = ticker.tick() => {
                if session.take_pong() {
                    misses = 0;
                    ping_outstanding = false;
                } else if ping_outstanding {
                    misses += 1;
                    if misses >= miss_threshold {
                        info!(
                            tunnel_id = %session.tunnel_id(),
                            misses,
                            "heartbeat timed out"
                        );
                        session.close(CloseKind::HeartbeatTimeout);
                        finish(&mut ws_tx, &codec, CloseKind::HeartbeatTimeout).await;
                        break;
                    }
                }
                if !sent_in_interval {
                    ping_tag += 1;
                    match codec.encode(&Frame::Ping { t: ping_tag }) {
                        Ok(text) => {
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                session.close(CloseKind::PeerClose);
                                break;
                            }
                            entry.touch();
                            ping_outstanding = true;
                        }
                        Err(e) => warn!(error = %e, "failed to encode ping"),
                    }
                }
                sent_in_interval = false;
            }
            _ = shutdown.changed() => {
                let cause = session.cause().unwrap_or(CloseKind::Shutdown);
                finish(&mut ws_tx, &codec, cause).await;
                break;
            }
        }
    }
}

/// Send the protocol close frame, then close the websocket
async fn finish(ws_tx: &mut SplitSink<WebSocket, Message>, codec: &FrameCodec, cause: CloseKind) {
    let frame = Frame::Close {
        kind: cause,
        message: cause.as_str().to_string(),
    };
    if let Ok(text) = codec.encode(&frame) {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }

    let code = match cause {
        CloseKind::Protocol | CloseKind::MalformedFrame | CloseKind::FrameTooLarge => {
            close_code::PROTOCOL
        }
        CloseKind::HeartbeatTimeout => close_code::AWAY,
        _ => close_code::NORMAL,
    };
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: cause.as_str().into(),
        })))
        .await;
}

async fn send_frame(
    socket: &mut WebSocket,
    codec: &FrameCodec,
    frame: &Frame,
) -> Result<(), axum::Error> {
    let text = codec
        .encode(frame)
        .map_err(|e| axum::Error::new(std::io::Error::other(e.to_string())))?;
    socket.send(Message::Text(text.into())).await
}

async fn close_socket(socket: &mut WebSocket, code: u16) -> Result<(), axum::Error> {
    socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })))
        .await
}
