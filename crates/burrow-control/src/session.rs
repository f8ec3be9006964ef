//! Transport session core
//!
//! A [`Session`] is the server-side handle for one attached agent
//! connection. It owns the pending-request table and the bounded outbound
//! frame queue; the transport pumps (reading and writing the actual
//! socket) live with the transport endpoint and drive the session from
//! outside.

use crate::pending::PendingRequests;
use burrow_proto::{CloseKind, Frame};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

/// Errors surfaced by [`Session::send_request`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("request timed out waiting for the agent")]
    Timeout,

    #[error("session closed")]
    Closed,

    #[error("too many requests in flight on this session")]
    Busy,
}

/// An HTTP request serialized for transport to the agent
#[derive(Debug, Clone, PartialEq)]
pub struct ProxiedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// An HTTP response returned by the agent
#[derive(Debug, Clone, PartialEq)]
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Session tuning knobs
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Depth of the outbound frame queue. A full queue blocks senders,
    /// which bounds the memory a slow agent can pin.
    pub outbound_queue_depth: usize,
    /// Maximum concurrently pending requests before callers get `Busy`
    pub max_in_flight: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_depth: 64,
            max_in_flight: 64,
        }
    }
}

/// One live transport bound to one tunnel
pub struct Session {
    session_id: Uuid,
    tunnel_id: String,
    outbound_tx: mpsc::Sender<Frame>,
    pending: PendingRequests,
    next_correlation: AtomicU64,
    max_in_flight: usize,
    late_responses: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    cause: OnceLock<CloseKind>,
    pong_seen: AtomicBool,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    /// The caller feeds the receiver into the transport writer pump.
    pub fn new(
        tunnel_id: impl Into<String>,
        config: SessionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_depth);
        let (shutdown_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            session_id: Uuid::new_v4(),
            tunnel_id: tunnel_id.into(),
            outbound_tx,
            pending: PendingRequests::new(),
            next_correlation: AtomicU64::new(1),
            max_in_flight: config.max_in_flight,
            late_responses: AtomicU64::new(0),
            shutdown_tx,
            cause: OnceLock::new(),
            pong_seen: AtomicBool::new(false),
        });

        (session, outbound_rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Send a request frame and await its correlated response.
    ///
    /// The whole call observes a single deadline: enqueueing on a full
    /// outbound queue eats into it, and expiry removes the waiter so a
    /// later response for this id is dropped.
    pub async fn send_request(
        &self,
        request: ProxiedRequest,
        timeout: Duration,
    ) -> Result<ProxiedResponse, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.pending.count() >= self.max_in_flight {
            return Err(SessionError::Busy);
        }

        let id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(id);

        let frame = Frame::Request {
            id,
            method: request.method,
            path: request.path,
            query: request.query,
            headers: request.headers,
            body: request.body,
        };

        let deadline = tokio::time::Instant::now() + timeout;

        match tokio::time::timeout_at(deadline, self.outbound_tx.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.pending.cancel(id);
                return Err(SessionError::Closed);
            }
            Err(_) => {
                self.pending.cancel(id);
                return Err(SessionError::Timeout);
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.pending.cancel(id);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Enqueue a frame for the transport writer (pongs, control frames)
    pub async fn enqueue(&self, frame: Frame) -> Result<(), SessionError> {
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Route an inbound response frame to its waiter.
    /// A response with no live waiter is dropped and counted.
    pub fn complete_response(&self, correlation_id: u64, response: ProxiedResponse) -> bool {
        let delivered = self.pending.respond(correlation_id, response);
        if !delivered {
            self.late_responses.fetch_add(1, Ordering::Relaxed);
            debug!(
                tunnel_id = %self.tunnel_id,
                correlation_id,
                "dropped response with no pending waiter"
            );
        }
        delivered
    }

    /// Responses that arrived after their waiter was gone
    pub fn late_responses(&self) -> u64 {
        self.late_responses.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.count()
    }

    /// Record an observed pong
    pub fn note_pong(&self) {
        self.pong_seen.store(true, Ordering::SeqCst);
    }

    /// Consume the pong-seen flag (heartbeat bookkeeping)
    pub fn take_pong(&self) -> bool {
        self.pong_seen.swap(false, Ordering::SeqCst)
    }

    /// Terminate the session with a cause. The first call wins; all
    /// outstanding waiters resolve as closed and the shutdown signal fires.
    /// Returns true when this call performed the close.
    pub fn close(&self, cause: CloseKind) -> bool {
        if self.cause.set(cause).is_err() {
            return false;
        }

        let drained = self.pending.cancel_all();
        if drained > 0 {
            debug!(
                tunnel_id = %self.tunnel_id,
                drained,
                cause = cause.as_str(),
                "failed outstanding waiters on session close"
            );
        }

        let _ = self.shutdown_tx.send(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.cause.get().is_some()
    }

    /// Why the session terminated, once it has
    pub fn cause(&self) -> Option<CloseKind> {
        self.cause.get().copied()
    }

    /// A receiver that resolves once the session begins closing
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("tunnel_id", &self.tunnel_id)
            .field("in_flight", &self.pending.count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
