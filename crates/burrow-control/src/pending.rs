//! Pending requests tracker
//!
//! Tracks proxied requests awaiting a correlated response frame and routes
//! each response back to the single waiter that sent it.

use crate::session::ProxiedResponse;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Tracks in-flight requests awaiting responses, keyed by correlation id
#[derive(Clone)]
pub struct PendingRequests {
    requests: Arc<DashMap<u64, oneshot::Sender<ProxiedResponse>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a new pending request.
    /// Returns a receiver that resolves with the correlated response.
    pub fn register(&self, correlation_id: u64) -> oneshot::Receiver<ProxiedResponse> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(correlation_id, tx);
        debug!("registered pending request {}", correlation_id);
        rx
    }

    /// Complete a pending request with its response.
    /// Returns true if a waiter consumed it, false if none was registered
    /// (late arrival) or the waiter had already gone away.
    pub fn respond(&self, correlation_id: u64, response: ProxiedResponse) -> bool {
        if let Some((_, tx)) = self.requests.remove(&correlation_id) {
            if tx.send(response).is_err() {
                warn!(
                    "waiter for request {} dropped before the response arrived",
                    correlation_id
                );
                return false;
            }
            return true;
        }
        false
    }

    /// Remove a pending request without completing it (timeout, send failure)
    pub fn cancel(&self, correlation_id: u64) {
        if self.requests.remove(&correlation_id).is_some() {
            debug!("cancelled pending request {}", correlation_id);
        }
    }

    /// Drop every waiter; their receivers resolve with an error.
    /// Used on session teardown so outstanding calls fail promptly.
    pub fn cancel_all(&self) -> usize {
        let drained = self.requests.len();
        self.requests.clear();
        drained
    }

    /// Number of requests currently awaiting a response
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16) -> ProxiedResponse {
        ProxiedResponse {
            status,
            headers: vec![],
            body: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_respond() {
        let tracker = PendingRequests::new();

        let rx = tracker.register(123);
        assert_eq!(tracker.count(), 1);

        assert!(tracker.respond(123, response(200)));
        assert_eq!(tracker.count(), 0);

        let received = rx.await.unwrap();
        assert_eq!(received.status, 200);
    }

    #[tokio::test]
    async fn test_cancel() {
        let tracker = PendingRequests::new();

        let rx = tracker.register(456);
        assert_eq!(tracker.count(), 1);

        tracker.cancel(456);
        assert_eq!(tracker.count(), 0);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_respond_not_found() {
        let tracker = PendingRequests::new();
        assert!(!tracker.respond(999, response(200)));
    }

    #[tokio::test]
    async fn test_respond_with_dropped_receiver() {
        let tracker = PendingRequests::new();

        let rx = tracker.register(789);
        drop(rx);

        assert!(!tracker.respond(789, response(200)));
    }

    #[tokio::test]
    async fn test_double_respond_same_id() {
        let tracker = PendingRequests::new();

        let rx = tracker.register(100);

        assert!(tracker.respond(100, response(200)));
        assert_eq!(rx.await.unwrap().status, 200);

        // the entry is gone; a duplicate response is not delivered
        assert!(!tracker.respond(100, response(500)));
    }

    #[tokio::test]
    async fn test_cancel_all_fails_every_waiter() {
        let tracker = PendingRequests::new();

        let receivers: Vec<_> = (1..=5).map(|i| tracker.register(i)).collect();
        assert_eq!(tracker.count(), 5);

        assert_eq!(tracker.cancel_all(), 5);
        assert_eq!(tracker.count(), 0);

        for rx in receivers {
            assert!(rx.await.is_err());
        }
    }

    #[tokio::test]
    async fn test_register_after_cancel_reuses_id() {
        let tracker = PendingRequests::new();

        let rx1 = tracker.register(42);
        tracker.cancel(42);
        assert!(rx1.await.is_err());

        let rx2 = tracker.register(42);
        tracker.respond(42, response(204));
        assert_eq!(rx2.await.unwrap().status, 204);
    }

    #[tokio::test]
    async fn test_concurrent_register_and_respond() {
        let tracker = Arc::new(PendingRequests::new());

        let mut handles = vec![];
        for i in 1..=20 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let rx = tracker.register(i);
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                tracker.respond(i, response(200));
                rx.await.unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().status, 200);
        }
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_responses_route_to_their_own_waiter() {
        let tracker = PendingRequests::new();

        let rx_a = tracker.register(1);
        let rx_b = tracker.register(2);

        tracker.respond(2, response(404));
        tracker.respond(1, response(200));

        assert_eq!(rx_a.await.unwrap().status, 200);
        assert_eq!(rx_b.await.unwrap().status, 404);
    }
}
