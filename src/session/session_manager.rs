//! Session Manager driving the streaming connection lifecycle
//!
//! One `StreamClient` owns the bootstrap → connect → welcome → replay cycle
//! for a single logical subscriber. A supervisor task runs the receive loop
//! and, when the transport fails, reconnects with exponential backoff and
//! replays every registered subscription in insertion order. Messages that
//! arrive while disconnected are lost; the feed is at-most-once across
//! reconnects.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use backoff::backoff::Backoff;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::kucoin::bootstrap::BootstrapResolver;
use crate::kucoin::credentials::Credential;
use crate::kucoin::dispatcher::{self, Dispatcher, RouteOutcome};
use crate::kucoin::registry::{Subscription, SubscriptionRegistry};
use crate::kucoin::transport::{FrameSender, KeepAlive, TransportSession};
use crate::kucoin::types::{OutboundFrame, RequestKind, SessionState, StreamError, StreamEvent};
use crate::metrics::{SessionStats, StatsSnapshot};

/// Timeouts and reconnect policy for a streaming session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Budget for TCP/TLS/WebSocket setup plus the welcome frame
    pub connect_timeout: Duration,
    /// How long subscribe/unsubscribe wait for their ack
    pub request_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Randomization factor applied to each backoff delay (0.0 - 1.0)
    pub reconnect_jitter: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            reconnect_jitter: 0.3,
        }
    }
}

impl SessionConfig {
    /// Unbounded exponential backoff: doubling, capped, jittered
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.reconnect_initial)
            .with_max_interval(self.reconnect_max)
            .with_multiplier(2.0)
            .with_randomization_factor(self.reconnect_jitter.clamp(0.0, 1.0))
            .with_max_elapsed_time(None)
            .build()
    }
}

/// State shared between the caller-facing client and its supervisor task
struct Shared<R: BootstrapResolver> {
    config: SessionConfig,
    credential: Credential,
    resolver: R,
    registry: Mutex<SubscriptionRegistry>,
    /// Subscribe calls waiting for their first ack, keyed by subscription id
    inflight: Mutex<HashMap<String, watch::Receiver<Outcome>>>,
    dispatcher: Arc<Dispatcher>,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    sender: Mutex<Option<FrameSender>>,
    events: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    stats: SessionStats,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Result of the subscribe call that owns a pending subscription
type Outcome = Option<Result<(), StreamError>>;

/// How a subscribe call relates to the registry entry it resolved to
enum Registration<'a> {
    /// Newly added; this call sends the request
    Owner(InflightGuard<'a>),
    /// Already registered but not yet acked; wait for the owner if there is one
    Joined(Option<watch::Receiver<Outcome>>),
    Confirmed,
}

/// Publishes the owner's outcome to joined callers and unregisters on drop
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashMap<String, watch::Receiver<Outcome>>>,
    id: String,
    done: watch::Sender<Outcome>,
}

impl InflightGuard<'_> {
    fn finish(&self, result: &Result<(), StreamError>) {
        self.done.send_replace(Some(result.clone()));
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        lock(self.inflight).remove(&self.id);
    }
}

impl<R: BootstrapResolver> Shared<R> {
    fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        lock(&self.registry)
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Add the pair to the registry and work out who sends its subscribe frame
    fn register(&self, topic: &str, private: bool) -> (Subscription, Registration<'_>) {
        let mut registry = self.registry();
        let (subscription, created) = registry.add(topic, private);
        let mut inflight = lock(&self.inflight);

        let registration = if created {
            let (done, done_rx) = watch::channel(None);
            inflight.insert(subscription.id.clone(), done_rx);
            Registration::Owner(InflightGuard {
                inflight: &self.inflight,
                id: subscription.id.clone(),
                done,
            })
        } else if subscription.confirmed {
            Registration::Confirmed
        } else {
            Registration::Joined(inflight.get(&subscription.id).cloned())
        };

        (subscription, registration)
    }

    /// Wait for the owning call's outcome, or confirm directly when it is gone
    async fn join(
        &self,
        subscription: &Subscription,
        done: Option<watch::Receiver<Outcome>>,
    ) -> Result<(), StreamError> {
        if let Some(mut done) = done {
            let outcome = done
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|outcome| outcome.clone());
            if let Some(result) = outcome {
                return result;
            }
        }
        self.confirm(subscription).await
    }

    /// The only place session state changes; Closed is never left
    fn transition(&self, to: SessionState) -> Result<(), StreamError> {
        let mut refused = false;
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                refused = true;
                return false;
            }
            if *state == to {
                return false;
            }
            debug!("Session state {} -> {}", state, to);
            *state = to;
            true
        });
        if refused {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }

    /// Transition only if the current state is `from`
    fn transition_from(&self, from: SessionState, to: SessionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            debug!("Session state {} -> {}", state, to);
            *state = to;
            true
        })
    }

    fn current_sender(&self) -> Option<FrameSender> {
        lock(&self.sender).clone()
    }

    fn set_sender(&self, sender: Option<FrameSender>) {
        *lock(&self.sender) = sender;
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            if tx.send(event).is_err() {
                debug!("Event receiver dropped, discarding event");
            }
        }
    }

    async fn shutdown_requested(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
    }

    /// Move to Closed and release every waiter; used by stop() and fatal errors
    fn terminate(&self) {
        self.shutdown_tx.send_replace(true);
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            debug!("Session state {} -> {}", state, SessionState::Closed);
            *state = SessionState::Closed;
            true
        });
        self.dispatcher.fail_pending(StreamError::Closed);
        self.set_sender(None);
    }

    /// Bootstrap, then try each candidate endpoint once in priority order
    async fn establish(&self) -> Result<TransportSession, StreamError> {
        self.transition(SessionState::Bootstrapping)?;
        let info = self.resolver.resolve(&self.credential).await?;

        self.transition(SessionState::Connecting)?;
        let mut last_error = None;

        for endpoint in &info.endpoints {
            let url = endpoint.connect_url(&info.token, &Uuid::new_v4().to_string());
            let keepalive = KeepAlive::from_millis(endpoint.ping_interval_ms, endpoint.ping_timeout_ms);

            match TransportSession::open(
                &url,
                keepalive,
                self.config.connect_timeout,
                self.dispatcher.clone(),
            )
            .await
            {
                Ok(session) => {
                    if let Err(e) = self.transition(SessionState::Welcomed) {
                        session.close().await;
                        return Err(e);
                    }
                    return Ok(session);
                }
                Err(e) => {
                    warn!("Failed to open stream on {}: {}", endpoint.url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| StreamError::Protocol("No candidate endpoints".to_string())))
    }

    fn on_frame(&self, raw: &str) {
        let message = match dispatcher::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.stats.record_decode_error();
                self.emit(StreamEvent::DeliveryError(e.to_string()));
                return;
            }
        };

        let registry = self.registry();
        let outcome = self
            .dispatcher
            .route(message, &registry, |msg| self.emit(StreamEvent::Message(msg)));

        match outcome {
            RouteOutcome::Delivered => self.stats.record_delivered(),
            RouteOutcome::Unmatched => self.stats.record_dropped(),
            _ => {}
        }
    }

    /// Send a correlated request on the current connection and wait for its response
    async fn request(&self, kind: RequestKind, topic: &str, private: bool) -> Result<(), StreamError> {
        let sender = self
            .current_sender()
            .ok_or_else(|| StreamError::Network("No active connection".to_string()))?;

        let mut pending = self.dispatcher.register(kind);
        // stop() fails pending requests after entering Closed; re-check so none slip through
        if self.state().is_terminal() {
            return Err(StreamError::Closed);
        }

        let frame = match kind {
            RequestKind::Subscribe => OutboundFrame::subscribe(pending.id(), topic, private),
            RequestKind::Unsubscribe => OutboundFrame::unsubscribe(pending.id(), topic, private),
            RequestKind::Ping => OutboundFrame::ping(pending.id()),
        };
        sender.send(&frame)?;
        pending.wait().await
    }

    /// Replay the registry snapshot in insertion order, then go Active
    async fn activate(&self) {
        let snapshot = self.registry().snapshot();
        if !snapshot.is_empty() {
            info!("Replaying {} subscriptions", snapshot.len());
        }

        for subscription in snapshot {
            if self.registry().get(&subscription.id).is_none() {
                continue;
            }

            let result = timeout(
                self.config.request_timeout,
                self.request(RequestKind::Subscribe, &subscription.topic, subscription.private),
            )
            .await;

            match result {
                Ok(Ok(())) => {
                    self.registry().confirm(&subscription.id);
                    debug!("Resubscribed to {}", subscription.topic);
                }
                Ok(Err(StreamError::Protocol(reason))) => {
                    warn!("Server rejected replay of {}: {}", subscription.topic, reason);
                    self.registry().remove_id(&subscription.id);
                    self.emit(StreamEvent::DeliveryError(format!(
                        "Subscription to {} dropped after reconnect: {}",
                        subscription.topic, reason
                    )));
                }
                Ok(Err(e)) => warn!("Replay of {} failed: {}", subscription.topic, e),
                Err(_) => warn!("Replay of {} timed out", subscription.topic),
            }
        }

        if self.transition_from(SessionState::Welcomed, SessionState::Active) {
            info!("Session active with {} subscriptions", self.registry().len());
        }
    }

    /// Ensure the subscription is acked on some connection, waiting out reconnects
    async fn confirm(&self, subscription: &Subscription) -> Result<(), StreamError> {
        let mut state_rx = self.state_tx.subscribe();

        loop {
            let state = *state_rx
                .wait_for(|s| *s == SessionState::Active || s.is_terminal())
                .await
                .map_err(|_| StreamError::Closed)?;
            if state.is_terminal() {
                return Err(StreamError::Closed);
            }

            {
                let registry = self.registry();
                if registry.get(&subscription.id).is_none() {
                    return Err(StreamError::Protocol(format!(
                        "Subscription to {} was removed before it was acknowledged",
                        subscription.topic
                    )));
                }
                if registry.is_confirmed(&subscription.id) {
                    return Ok(());
                }
            }

            match self
                .request(RequestKind::Subscribe, &subscription.topic, subscription.private)
                .await
            {
                Ok(()) => {
                    self.registry().confirm(&subscription.id);
                    return Ok(());
                }
                Err(StreamError::Protocol(reason)) => return Err(StreamError::Protocol(reason)),
                Err(_) if self.state().is_terminal() => return Err(StreamError::Closed),
                Err(e) => {
                    debug!(
                        "Subscribe to {} interrupted ({}), waiting for reconnection",
                        subscription.topic, e
                    );
                    let _ = state_rx.wait_for(|s| *s != SessionState::Active).await;
                }
            }
        }
    }

    /// Back off and re-establish until a session is open; None on shutdown or fatal error
    async fn reconnect(&self) -> Option<TransportSession> {
        let mut backoff = self.config.backoff();

        loop {
            let delay = backoff.next_backoff().unwrap_or(self.config.reconnect_max);
            info!("Reconnecting in {:?}", delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_requested() => return None,
            }

            let attempt = tokio::select! {
                result = self.establish() => result,
                _ = self.shutdown_requested() => return None,
            };

            match attempt {
                Ok(session) => return Some(session),
                Err(e) if e.is_retryable() => {
                    warn!("Reconnect attempt failed: {}", e);
                    let _ = self.transition(SessionState::Reconnecting);
                }
                Err(StreamError::Closed) => return None,
                Err(e) => {
                    error!("Reconnect failed permanently, closing session: {}", e);
                    self.terminate();
                    lock(&self.events).take();
                    return None;
                }
            }
        }
    }

    /// Own the live transport: receive, replay, and recover from failures
    async fn supervise(self: Arc<Self>, mut session: TransportSession) {
        loop {
            self.set_sender(Some(session.sender()));

            let failure = {
                let mut receive = pin!(session.receive_loop(|raw| self.on_frame(raw)));
                let mut activation = pin!(self.activate());
                let mut activated = false;

                loop {
                    tokio::select! {
                        error = &mut receive => break Some(error),
                        _ = &mut activation, if !activated => activated = true,
                        _ = self.shutdown_requested() => break None,
                    }
                }
            };

            self.set_sender(None);
            session.close().await;

            let Some(error) = failure else {
                break;
            };
            if self.state().is_terminal() {
                break;
            }

            warn!("Connection lost: {}", error);
            self.stats.record_reconnect();
            if self.transition(SessionState::Reconnecting).is_err() {
                break;
            }
            self.dispatcher
                .fail_pending(StreamError::Network(format!("Connection lost: {}", error)));
            self.registry().reset_confirmations();

            match self.reconnect().await {
                Some(next) => session = next,
                None => break,
            }
        }

        debug!("Session supervisor finished");
    }
}

/// Caller-facing streaming client
pub struct StreamClient<R: BootstrapResolver> {
    shared: Arc<Shared<R>>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<R: BootstrapResolver> StreamClient<R> {
    /// Create a client and the receiver its delivery events are emitted on
    pub fn new(
        config: SessionConfig,
        credential: Credential,
        resolver: R,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            credential,
            resolver,
            registry: Mutex::new(SubscriptionRegistry::new()),
            inflight: Mutex::new(HashMap::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            state_tx,
            shutdown_tx,
            sender: Mutex::new(None),
            events: Mutex::new(Some(event_tx)),
            stats: SessionStats::new(),
        });

        let client = Self {
            shared,
            supervisor: tokio::sync::Mutex::new(None),
        };

        (client, event_rx)
    }

    /// Get current session state
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Subscribe to session state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Registered subscriptions in insertion order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.registry().snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.state().is_terminal() {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }

    /// Connect and bring the session to Active.
    ///
    /// Fails with the last bootstrap/transport error when no candidate endpoint
    /// could be opened. Calling it on a running client is a no-op.
    pub async fn start(&self) -> Result<(), StreamError> {
        let mut supervisor = self.supervisor.lock().await;
        self.ensure_open()?;
        if supervisor.is_some() {
            debug!("Stream client already started");
            return Ok(());
        }

        info!("Starting stream client");
        let established = tokio::select! {
            result = self.shared.establish() => result,
            _ = self.shared.shutdown_requested() => Err(StreamError::Closed),
        };

        let session = match established {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to start stream: {}", e);
                let _ = self.shared.transition(SessionState::Disconnected);
                return Err(e);
            }
        };

        *supervisor = Some(tokio::spawn(self.shared.clone().supervise(session)));
        drop(supervisor);

        let mut state_rx = self.watch_state();
        let state = *state_rx
            .wait_for(|s| {
                matches!(s, SessionState::Active | SessionState::Reconnecting) || s.is_terminal()
            })
            .await
            .map_err(|_| StreamError::Closed)?;

        match state {
            SessionState::Closed => Err(StreamError::Closed),
            _ => Ok(()),
        }
    }

    /// Subscribe to a topic and wait for the server's ack.
    ///
    /// Re-subscribing to a confirmed (topic, private) pair returns the
    /// existing subscription without sending anything; a pair still waiting
    /// for its ack shares the outcome of the pending request. While
    /// reconnecting the request is deferred and goes out with the replay.
    pub async fn subscribe(&self, topic: &str, private: bool) -> Result<Subscription, StreamError> {
        self.ensure_open()?;

        let (subscription, registration) = self.shared.register(topic, private);
        let request_timeout = self.shared.config.request_timeout;

        match registration {
            Registration::Confirmed => Ok(subscription),
            Registration::Joined(done) => {
                debug!("Subscribe to {} already pending, waiting for its ack", topic);
                let outcome = timeout(request_timeout, self.shared.join(&subscription, done))
                    .await
                    .unwrap_or_else(|_| Err(self.ack_timeout("subscribe to", topic)));
                outcome.map(|()| self.current(subscription))
            }
            Registration::Owner(guard) => {
                info!("Subscribing to {} (private={})", topic, private);
                let outcome = timeout(request_timeout, self.shared.confirm(&subscription))
                    .await
                    .unwrap_or_else(|_| Err(self.ack_timeout("subscribe to", topic)));

                if let Err(e) = &outcome {
                    warn!("Subscribe to {} failed: {}", topic, e);
                    self.shared.registry().remove_id(&subscription.id);
                }
                guard.finish(&outcome);
                outcome.map(|()| self.current(subscription))
            }
        }
    }

    /// Latest registry copy of a subscription
    fn current(&self, subscription: Subscription) -> Subscription {
        self.shared
            .registry()
            .get(&subscription.id)
            .cloned()
            .unwrap_or(subscription)
    }

    fn ack_timeout(&self, action: &str, topic: &str) -> StreamError {
        StreamError::Timeout(format!(
            "No ack for {} {} within {}ms",
            action,
            topic,
            self.shared.config.request_timeout.as_millis()
        ))
    }

    /// Unsubscribe from a topic.
    ///
    /// The registry entry is always removed, even if the request cannot be
    /// delivered; only an ack timeout or a closed client is reported.
    pub async fn unsubscribe(&self, topic: &str, private: bool) -> Result<(), StreamError> {
        self.ensure_open()?;

        if self.shared.registry().remove(topic, private).is_none() {
            debug!("Topic {} (private={}) was not subscribed", topic, private);
            return Ok(());
        }

        info!("Unsubscribing from {} (private={})", topic, private);
        // replay may already have re-sent the subscribe on a welcomed connection
        if !matches!(self.state(), SessionState::Active | SessionState::Welcomed) {
            return Ok(());
        }

        let result = timeout(
            self.shared.config.request_timeout,
            self.shared.request(RequestKind::Unsubscribe, topic, private),
        )
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) if self.state().is_terminal() => Err(StreamError::Closed),
            Ok(Err(e)) => {
                warn!("Unsubscribe from {} not confirmed: {}", topic, e);
                Ok(())
            }
            Err(_) => Err(self.ack_timeout("unsubscribe from", topic)),
        }
    }

    /// Unsubscribe using the handle returned by `subscribe`
    pub async fn unsubscribe_handle(&self, subscription: &Subscription) -> Result<(), StreamError> {
        self.unsubscribe(&subscription.topic, subscription.private)
            .await
    }

    /// Close the session from any state.
    ///
    /// Pending subscribe/unsubscribe calls fail with `Closed`; the supervisor
    /// and transport tasks have finished and the registry is empty when this
    /// returns.
    pub async fn stop(&self) {
        info!("Stopping stream client");
        self.shared.terminate();

        if let Some(handle) = self.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Session supervisor terminated with error: {}", e);
            }
        }

        lock(&self.shared.events).take();
        self.shared.registry().clear();
        info!("Stream client stopped");
    }
}

impl<R: BootstrapResolver> Drop for StreamClient<R> {
    fn drop(&mut self) {
        self.shared.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kucoin::mock::MockBootstrap;
    use tokio_test::block_on;

    fn client() -> (
        StreamClient<Arc<MockBootstrap>>,
        mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        StreamClient::new(
            SessionConfig::default(),
            Credential::public(),
            Arc::new(MockBootstrap::new(vec![])),
        )
    }

    #[test]
    fn test_backoff_is_unbounded_and_capped() {
        let config = SessionConfig {
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_millis(400),
            reconnect_jitter: 0.0,
            ..SessionConfig::default()
        };
        let mut backoff = config.backoff();
        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_backoff().unwrap()).collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[5], Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let (client, _rx) = client();
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_endpoints_fails() {
        let (client, _rx) = client();
        let result = client.start().await;
        assert!(matches!(result, Err(StreamError::Protocol(_))));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_operations_after_stop_are_closed() {
        let (client, mut rx) = client();
        client.stop().await;

        assert_eq!(client.state(), SessionState::Closed);
        assert_eq!(client.start().await, Err(StreamError::Closed));
        assert_eq!(
            client.subscribe("/market/ticker:BTC-USDT", false).await,
            Err(StreamError::Closed)
        );
        assert_eq!(
            client.unsubscribe("/market/ticker:BTC-USDT", false).await,
            Err(StreamError::Closed)
        );
        // event stream ends once the client is closed
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_state_watch_channel() {
        let (client, _rx) = client();
        let mut state_rx = client.watch_state();

        block_on(async {
            assert_eq!(*state_rx.borrow_and_update(), SessionState::Disconnected);

            client.shared.transition(SessionState::Bootstrapping).unwrap();
            state_rx.changed().await.unwrap();
            assert_eq!(*state_rx.borrow_and_update(), SessionState::Bootstrapping);

            // only a Welcomed session may be activated
            assert!(!client
                .shared
                .transition_from(SessionState::Welcomed, SessionState::Active));
            assert_eq!(client.state(), SessionState::Bootstrapping);
        });
    }

    #[test]
    fn test_closed_is_terminal() {
        let (client, _rx) = client();
        client.shared.terminate();
        assert_eq!(
            client.shared.transition(SessionState::Active),
            Err(StreamError::Closed)
        );
        assert_eq!(client.state(), SessionState::Closed);
    }
}
