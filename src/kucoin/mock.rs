//! Mock exchange server and bootstrap resolver
//! Used for testing without reaching the real exchange

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tracing::debug;

use super::bootstrap::{BootstrapInfo, BootstrapResolver, Endpoint};
use super::credentials::Credential;
use super::types::StreamError;

#[derive(Debug)]
enum Control {
    Send(String),
    Drop,
}

#[derive(Debug)]
struct MockState {
    send_welcome: AtomicBool,
    answer_pings: AtomicBool,
    ack_requests: AtomicBool,
    rejected_topics: Mutex<HashSet<String>>,
    received: Mutex<Vec<serde_json::Value>>,
    connections: Mutex<Vec<mpsc::UnboundedSender<Control>>>,
    accepted: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process WebSocket server speaking the KuCoin streaming protocol
pub struct MockExchange {
    addr: SocketAddr,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockExchange {
    /// Bind on an ephemeral local port and start accepting connections
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock exchange");
        let addr = listener.local_addr().expect("Mock exchange has no address");

        let state = Arc::new(MockState {
            send_welcome: AtomicBool::new(true),
            answer_pings: AtomicBool::new(true),
            ack_requests: AtomicBool::new(true),
            rejected_topics: Mutex::new(HashSet::new()),
            received: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(Self::serve(stream, accept_state.clone()));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Endpoint entry as a bullet response would list it
    pub fn endpoint(&self, ping_interval_ms: u64, ping_timeout_ms: u64) -> Endpoint {
        Endpoint {
            url: self.url(),
            ping_interval_ms,
            ping_timeout_ms,
        }
    }

    async fn serve(stream: TcpStream, state: Arc<MockState>) {
        let Ok(ws) = accept_async(stream).await else {
            return;
        };
        let (mut write, mut read) = ws.split();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let connection_id = state.accepted.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&state.connections).push(control_tx);

        if state.send_welcome.load(Ordering::SeqCst) {
            let welcome = serde_json::json!({ "id": connection_id.to_string(), "type": "welcome" });
            if write.send(Message::Text(welcome.to_string())).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                control = control_rx.recv() => match control {
                    Some(Control::Send(text)) => {
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Control::Drop) | None => break,
                },
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = Self::reply_to(&state, &text) {
                            if write.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
            }
        }
        debug!("Mock connection {} finished", connection_id);
    }

    fn reply_to(state: &MockState, text: &str) -> Option<String> {
        let frame: serde_json::Value = serde_json::from_str(text).ok()?;
        lock(&state.received).push(frame.clone());

        let id = frame.get("id")?.as_str()?.to_string();
        match frame.get("type")?.as_str()? {
            "ping" if state.answer_pings.load(Ordering::SeqCst) => Some(
                serde_json::json!({ "id": id, "type": "pong", "timestamp": Utc::now().timestamp_millis() })
                    .to_string(),
            ),
            "subscribe" | "unsubscribe" if state.ack_requests.load(Ordering::SeqCst) => {
                let topic = frame.get("topic").and_then(|t| t.as_str()).unwrap_or_default();
                if lock(&state.rejected_topics).contains(topic) {
                    Some(
                        serde_json::json!({
                            "id": id,
                            "type": "error",
                            "code": 404,
                            "data": format!("topic {} is not found", topic)
                        })
                        .to_string(),
                    )
                } else {
                    Some(serde_json::json!({ "id": id, "type": "ack" }).to_string())
                }
            }
            _ => None,
        }
    }

    fn broadcast(&self, control: impl Fn() -> Control) {
        let mut connections = lock(&self.state.connections);
        connections.retain(|tx| tx.send(control()).is_ok());
    }

    /// Push a data message to every live connection
    pub fn push_message(&self, topic: &str, subject: &str, data: serde_json::Value) {
        let frame = serde_json::json!({
            "type": "message",
            "topic": topic,
            "subject": subject,
            "data": data
        })
        .to_string();
        self.push_raw(&frame);
    }

    /// Push an arbitrary text frame to every live connection
    pub fn push_raw(&self, text: &str) {
        self.broadcast(|| Control::Send(text.to_string()));
    }

    /// Drop every live connection without a close handshake
    pub fn drop_connections(&self) {
        self.broadcast(|| Control::Drop);
        lock(&self.state.connections).clear();
    }

    pub fn set_send_welcome(&self, enabled: bool) {
        self.state.send_welcome.store(enabled, Ordering::SeqCst);
    }

    pub fn set_answer_pings(&self, enabled: bool) {
        self.state.answer_pings.store(enabled, Ordering::SeqCst);
    }

    pub fn set_ack_requests(&self, enabled: bool) {
        self.state.ack_requests.store(enabled, Ordering::SeqCst);
    }

    /// Answer subscribe requests for `topic` with an error frame
    pub fn reject_topic(&self, topic: &str) {
        lock(&self.state.rejected_topics).insert(topic.to_string());
    }

    /// Number of WebSocket connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Every JSON frame received from clients, in order
    pub fn received_frames(&self) -> Vec<serde_json::Value> {
        lock(&self.state.received).clone()
    }

    /// Topics of received frames of the given type, in order
    pub fn received_topics(&self, frame_type: &str) -> Vec<String> {
        self.received_frames()
            .into_iter()
            .filter(|f| f.get("type").and_then(|t| t.as_str()) == Some(frame_type))
            .filter_map(|f| f.get("topic").and_then(|t| t.as_str()).map(str::to_string))
            .collect()
    }

    pub fn clear_received(&self) {
        lock(&self.state.received).clear();
    }
}

impl Drop for MockExchange {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

/// Accepts TCP connections but never completes the WebSocket handshake
pub struct BlackholeServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl BlackholeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind blackhole server");
        let addr = listener.local_addr().expect("Blackhole server has no address");

        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        Self { addr, task }
    }

    pub fn endpoint(&self, ping_interval_ms: u64, ping_timeout_ms: u64) -> Endpoint {
        Endpoint {
            url: format!("ws://{}/", self.addr),
            ping_interval_ms,
            ping_timeout_ms,
        }
    }
}

impl Drop for BlackholeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bootstrap resolver returning a fixed endpoint list
#[derive(Debug)]
pub struct MockBootstrap {
    endpoints: Mutex<Vec<Endpoint>>,
    failure: Mutex<Option<StreamError>>,
    calls: AtomicUsize,
}

impl MockBootstrap {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: Mutex::new(endpoints),
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        *lock(&self.endpoints) = endpoints;
    }

    /// Make every following resolve fail with `error` (None to recover)
    pub fn set_failure(&self, error: Option<StreamError>) {
        *lock(&self.failure) = error;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BootstrapResolver for MockBootstrap {
    async fn resolve(&self, _credential: &Credential) -> Result<BootstrapInfo, StreamError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }

        Ok(BootstrapInfo {
            token: format!("mock-token-{}", call),
            endpoints: lock(&self.endpoints).clone(),
            issued_at: Utc::now(),
        })
    }
}
