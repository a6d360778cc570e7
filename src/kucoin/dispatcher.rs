//! Inbound frame decoding, routing and request/ack correlation

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::registry::SubscriptionRegistry;
use super::transport::PingCorrelator;
use super::types::{InboundMessage, RequestKind, StreamError, StreamMessage};

type Waiter = oneshot::Sender<Result<(), StreamError>>;

/// A request waiting for its response frame
#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    created_at: Instant,
    waiter: Waiter,
}

/// What `route` did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the consumer
    Delivered,
    /// Message for a topic that is not subscribed (late frame after unsubscribe)
    Unmatched,
    /// Completed a pending request
    Resolved,
    /// Response frame whose request is no longer pending
    Orphaned,
    /// Welcome frames need no routing once connected
    Ignored,
}

/// Decode a raw text frame
pub fn decode(raw: &str) -> Result<InboundMessage, StreamError> {
    serde_json::from_str(raw)
        .map_err(|e| StreamError::Protocol(format!("Failed to decode frame: {}", e)))
}

/// Frame router and owner of the correlation table
#[derive(Debug)]
pub struct Dispatcher {
    pending: Mutex<HashMap<String, PendingRequest>>,
    next_id: AtomicU64,
    id_prefix: String,
}

impl Dispatcher {
    pub fn new() -> Self {
        let seed = uuid::Uuid::new_v4().simple().to_string();
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            id_prefix: seed[..8].to_string(),
        }
    }

    fn next_request_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.id_prefix, n)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request; the guard removes the entry if dropped unresolved
    pub fn register(&self, kind: RequestKind) -> PendingGuard<'_> {
        let (id, rx) = self.insert(kind);
        PendingGuard {
            dispatcher: self,
            id,
            rx: Some(rx),
        }
    }

    fn insert(&self, kind: RequestKind) -> (String, oneshot::Receiver<Result<(), StreamError>>) {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.table().insert(
            id.clone(),
            PendingRequest {
                kind,
                created_at: Instant::now(),
                waiter: tx,
            },
        );
        (id, rx)
    }

    /// Drop a pending request without resolving it
    pub fn forget(&self, id: &str) {
        self.table().remove(id);
    }

    fn resolve(&self, id: &str, result: Result<(), StreamError>) -> RouteOutcome {
        let Some(request) = self.table().remove(id) else {
            debug!("No pending request for response id {}", id);
            return RouteOutcome::Orphaned;
        };

        trace!(
            "Resolved {} request {} after {:?}",
            request.kind,
            id,
            request.created_at.elapsed()
        );
        // The waiter may have timed out already
        let _ = request.waiter.send(result);
        RouteOutcome::Resolved
    }

    /// Resolve every pending request with `error`
    pub fn fail_pending(&self, error: StreamError) -> usize {
        let drained: Vec<PendingRequest> = self.table().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for request in drained {
            let _ = request.waiter.send(Err(error.clone()));
        }
        if count > 0 {
            debug!("Failed {} pending requests: {}", count, error);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    /// Route a decoded message: deliver data, complete acks, errors and pongs
    pub fn route<F>(
        &self,
        message: InboundMessage,
        registry: &SubscriptionRegistry,
        handler: F,
    ) -> RouteOutcome
    where
        F: FnOnce(StreamMessage),
    {
        match message {
            InboundMessage::Message {
                topic,
                subject,
                data,
            } => {
                if !registry.matches(&topic) {
                    debug!("Dropping message for unsubscribed topic {}", topic);
                    return RouteOutcome::Unmatched;
                }
                handler(StreamMessage {
                    topic,
                    subject,
                    payload: data,
                });
                RouteOutcome::Delivered
            }
            InboundMessage::Ack { id } => self.resolve(&id, Ok(())),
            InboundMessage::Pong { id } => self.resolve(&id, Ok(())),
            InboundMessage::Error { id, code, data } => {
                let code = code.map(|c| c.to_string()).unwrap_or_default();
                let reason = match &data {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                match id {
                    Some(id) => self.resolve(
                        &id,
                        Err(StreamError::Protocol(format!(
                            "Server rejected request (code {}): {}",
                            code, reason
                        ))),
                    ),
                    None => {
                        warn!("Server error frame (code {}): {}", code, reason);
                        RouteOutcome::Orphaned
                    }
                }
            }
            InboundMessage::Welcome { .. } => RouteOutcome::Ignored,
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PingCorrelator for Dispatcher {
    fn register_ping(&self) -> (String, oneshot::Receiver<Result<(), StreamError>>) {
        self.insert(RequestKind::Ping)
    }

    fn forget_ping(&self, id: &str) {
        self.forget(id);
    }
}

/// Handle on a pending request; removes its table entry when dropped
pub struct PendingGuard<'a> {
    dispatcher: &'a Dispatcher,
    id: String,
    rx: Option<oneshot::Receiver<Result<(), StreamError>>>,
}

impl PendingGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the matching response frame
    pub async fn wait(&mut self) -> Result<(), StreamError> {
        match self.rx.take() {
            Some(rx) => rx.await.unwrap_or(Err(StreamError::Closed)),
            None => Err(StreamError::Closed),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.forget(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(topic: &str) -> SubscriptionRegistry {
        let mut registry = SubscriptionRegistry::new();
        registry.add(topic, false);
        registry
    }

    #[test]
    fn test_decode_message_frame() {
        let raw = r#"{"type":"message","topic":"/market/ticker:BTC-USDT","subject":"trade.ticker","data":{"price":"67000"}}"#;
        let message = decode(raw).unwrap();
        assert_eq!(
            message,
            InboundMessage::Message {
                topic: "/market/ticker:BTC-USDT".to_string(),
                subject: "trade.ticker".to_string(),
                data: serde_json::json!({ "price": "67000" }),
            }
        );
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(matches!(decode("not json"), Err(StreamError::Protocol(_))));
        // ack without id
        assert!(matches!(
            decode(r#"{"type":"ack"}"#),
            Err(StreamError::Protocol(_))
        ));
        // message without topic
        assert!(matches!(
            decode(r#"{"type":"message","data":{}}"#),
            Err(StreamError::Protocol(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"bogus","id":"1"}"#),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_welcome_and_pong() {
        assert_eq!(
            decode(r#"{"id":"hQvf8jkno","type":"welcome"}"#).unwrap(),
            InboundMessage::Welcome {
                id: Some("hQvf8jkno".to_string())
            }
        );
        assert_eq!(
            decode(r#"{"id":"9","type":"pong","timestamp":1}"#).unwrap(),
            InboundMessage::Pong {
                id: "9".to_string()
            }
        );
    }

    #[test]
    fn test_route_delivers_subscribed_topic() {
        let dispatcher = Dispatcher::new();
        let registry = registry_with("/market/ticker:BTC-USDT");
        let mut delivered = None;

        let outcome = dispatcher.route(
            decode(r#"{"type":"message","topic":"/market/ticker:BTC-USDT","subject":"trade.ticker","data":{}}"#).unwrap(),
            &registry,
            |msg| delivered = Some(msg),
        );

        assert_eq!(outcome, RouteOutcome::Delivered);
        assert_eq!(delivered.unwrap().subject, "trade.ticker");
    }

    #[test]
    fn test_route_drops_unsubscribed_topic() {
        let dispatcher = Dispatcher::new();
        let registry = SubscriptionRegistry::new();
        let outcome = dispatcher.route(
            decode(r#"{"type":"message","topic":"/market/ticker:BTC-USDT","data":{}}"#).unwrap(),
            &registry,
            |_| panic!("handler must not run"),
        );
        assert_eq!(outcome, RouteOutcome::Unmatched);
    }

    #[tokio::test]
    async fn test_ack_resolves_pending_request() {
        let dispatcher = Dispatcher::new();
        let registry = SubscriptionRegistry::new();
        let mut guard = dispatcher.register(RequestKind::Subscribe);
        let id = guard.id().to_string();

        let outcome = dispatcher.route(
            InboundMessage::Ack { id },
            &registry,
            |_| {},
        );
        assert_eq!(outcome, RouteOutcome::Resolved);
        assert_eq!(guard.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_error_frame_rejects_pending_request() {
        let dispatcher = Dispatcher::new();
        let registry = SubscriptionRegistry::new();
        let mut guard = dispatcher.register(RequestKind::Subscribe);

        dispatcher.route(
            InboundMessage::Error {
                id: Some(guard.id().to_string()),
                code: Some(serde_json::json!(404)),
                data: serde_json::json!("topic /x is not found"),
            },
            &registry,
            |_| {},
        );

        let result = guard.wait().await;
        assert!(matches!(result, Err(StreamError::Protocol(msg)) if msg.contains("not found")));
    }

    #[test]
    fn test_orphan_ack_is_dropped() {
        let dispatcher = Dispatcher::new();
        let outcome = dispatcher.route(
            InboundMessage::Ack {
                id: "unknown".to_string(),
            },
            &SubscriptionRegistry::new(),
            |_| {},
        );
        assert_eq!(outcome, RouteOutcome::Orphaned);
    }

    #[test]
    fn test_guard_drop_removes_entry() {
        let dispatcher = Dispatcher::new();
        {
            let _guard = dispatcher.register(RequestKind::Unsubscribe);
            assert_eq!(dispatcher.pending_count(), 1);
        }
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_pending_wakes_all_waiters() {
        let dispatcher = Dispatcher::new();
        let mut first = dispatcher.register(RequestKind::Subscribe);
        let mut second = dispatcher.register(RequestKind::Unsubscribe);

        assert_eq!(dispatcher.fail_pending(StreamError::Closed), 2);
        assert_eq!(first.wait().await, Err(StreamError::Closed));
        assert_eq!(second.wait().await, Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn test_pong_resolves_ping() {
        let dispatcher = Dispatcher::new();
        let (id, rx) = dispatcher.register_ping();
        dispatcher.route(
            InboundMessage::Pong { id },
            &SubscriptionRegistry::new(),
            |_| {},
        );
        assert_eq!(rx.await.unwrap(), Ok(()));
    }
}
