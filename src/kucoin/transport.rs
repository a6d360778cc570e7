//! One physical WebSocket connection: send queue, receive loop and keep-alive

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::sink::SinkExt;
use futures_util::stream::{SplitStream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, timeout, timeout_at};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, info, trace, warn};

use super::dispatcher;
use super::types::{InboundMessage, OutboundFrame, StreamError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Issues ping correlation ids and reports matching pongs
pub trait PingCorrelator: Send + Sync + 'static {
    fn register_ping(&self) -> (String, oneshot::Receiver<Result<(), StreamError>>);
    fn forget_ping(&self, id: &str);
}

/// Server-declared keep-alive parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub interval: Duration,
    pub timeout: Duration,
}

impl KeepAlive {
    pub fn from_millis(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
            timeout: Duration::from_millis(timeout_ms.max(1)),
        }
    }
}

/// Cloneable handle that enqueues frames on a session's writer
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
}

impl FrameSender {
    /// Enqueue a frame; fails once the session has failed or closed
    pub fn send(&self, frame: &OutboundFrame) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let text = serde_json::to_string(frame)?;
        self.tx
            .send(Message::Text(text))
            .map_err(|_| StreamError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A connected, welcomed WebSocket session
pub struct TransportSession {
    url: String,
    sender: FrameSender,
    reader: SplitStream<WsStream>,
    failure_rx: mpsc::UnboundedReceiver<StreamError>,
    writer_task: JoinHandle<()>,
    keepalive_task: JoinHandle<()>,
}

impl TransportSession {
    /// Connect, wait for the welcome frame, then start the writer and keep-alive tasks
    pub async fn open(
        url: &str,
        keepalive: KeepAlive,
        connect_timeout: Duration,
        correlator: Arc<dyn PingCorrelator>,
    ) -> Result<Self, StreamError> {
        let deadline = Instant::now() + connect_timeout;

        let (mut ws, _) = timeout_at(deadline, connect_async(url))
            .await
            .map_err(|_| StreamError::Network(format!("Connect to {} timed out", redact(url))))?
            .map_err(|e| StreamError::Network(format!("Failed to connect: {}", e)))?;

        Self::await_welcome(&mut ws, deadline).await?;
        info!("Connected to KuCoin WebSocket at {}", redact(url));

        let (write, reader) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let sender = FrameSender {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };

        let writer_task = tokio::spawn(Self::run_writer(write, rx, failure_tx.clone()));
        let keepalive_task = tokio::spawn(Self::run_keepalive(
            sender.clone(),
            keepalive,
            correlator,
            failure_tx,
        ));

        Ok(Self {
            url: url.to_string(),
            sender,
            reader,
            failure_rx,
            writer_task,
            keepalive_task,
        })
    }

    async fn await_welcome(ws: &mut WsStream, deadline: Instant) -> Result<(), StreamError> {
        loop {
            let frame = timeout_at(deadline, ws.next())
                .await
                .map_err(|_| StreamError::Protocol("No welcome frame before timeout".to_string()))?;

            match frame {
                Some(Ok(Message::Text(text))) => {
                    return match dispatcher::decode(&text)? {
                        InboundMessage::Welcome { id } => {
                            debug!("Received welcome frame (connection id {:?})", id);
                            Ok(())
                        }
                        other => Err(StreamError::Protocol(format!(
                            "Expected welcome frame, got {:?}",
                            other
                        ))),
                    };
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(StreamError::Network(
                        "Connection closed before welcome".to_string(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn run_writer(
        mut write: futures_util::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        failure_tx: mpsc::UnboundedSender<StreamError>,
    ) {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = write.send(message).await {
                let _ = failure_tx.send(StreamError::Network(format!("Send failed: {}", e)));
                break;
            }
            if closing {
                break;
            }
        }
        trace!("Writer task finished");
    }

    async fn run_keepalive(
        sender: FrameSender,
        keepalive: KeepAlive,
        correlator: Arc<dyn PingCorrelator>,
        failure_tx: mpsc::UnboundedSender<StreamError>,
    ) {
        let mut ticker = tokio::time::interval(keepalive.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let (id, pong_rx) = correlator.register_ping();
            if let Err(e) = sender.send(&OutboundFrame::ping(&id)) {
                correlator.forget_ping(&id);
                let _ = failure_tx.send(e);
                break;
            }
            trace!("Sent ping {}", id);

            match timeout(keepalive.timeout, pong_rx).await {
                Ok(Ok(Ok(()))) => trace!("Received pong {}", id),
                Ok(Ok(Err(e))) => {
                    let _ = failure_tx.send(e);
                    break;
                }
                Ok(Err(_)) => {
                    let _ = failure_tx.send(StreamError::Closed);
                    break;
                }
                Err(_) => {
                    correlator.forget_ping(&id);
                    warn!("No pong for ping {} within {:?}", id, keepalive.timeout);
                    let _ = failure_tx.send(StreamError::Timeout(format!(
                        "No pong within {}ms",
                        keepalive.timeout.as_millis()
                    )));
                    break;
                }
            }
        }
    }

    /// Handle for enqueueing frames concurrently with the receive loop
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn send(&self, frame: &OutboundFrame) -> Result<(), StreamError> {
        self.sender.send(frame)
    }

    /// Deliver every text frame to `on_frame` in receipt order until the
    /// connection fails; returns the failure
    pub async fn receive_loop<F>(&mut self, mut on_frame: F) -> StreamError
    where
        F: FnMut(&str),
    {
        let error = loop {
            tokio::select! {
                biased;
                Some(error) = self.failure_rx.recv() => break error,
                frame = self.reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => on_frame(&text),
                    Some(Ok(Message::Close(frame))) => {
                        break StreamError::Network(format!("Connection closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.into(),
                    None => break StreamError::Network("Connection stream ended".to_string()),
                },
            }
        };

        self.sender.mark_closed();
        debug!("Receive loop for {} ended: {}", redact(&self.url), error);
        error
    }

    /// Stop the writer and keep-alive tasks and close the socket
    pub async fn close(mut self) {
        self.sender.mark_closed();
        self.keepalive_task.abort();

        // Best effort close frame, then make sure the writer is gone
        let _ = self.sender.tx.send(Message::Close(None));
        if timeout(Duration::from_secs(1), &mut self.writer_task)
            .await
            .is_err()
        {
            self.writer_task.abort();
        }
        let _ = (&mut self.keepalive_task).await;

        debug!("Transport session for {} closed", redact(&self.url));
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.keepalive_task.abort();
        self.writer_task.abort();
    }
}

/// Strip the query string, which carries the connection token
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
