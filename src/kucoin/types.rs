//! KuCoin streaming data types, frames and errors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Bootstrapping,
    Connecting,
    Welcomed,
    Active,
    Reconnecting,
    Closed,
}

impl SessionState {
    /// Closed is terminal, nothing may leave it
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Bootstrapping => "BOOTSTRAPPING",
            SessionState::Connecting => "CONNECTING",
            SessionState::Welcomed => "WELCOMED",
            SessionState::Active => "ACTIVE",
            SessionState::Reconnecting => "RECONNECTING",
            SessionState::Closed => "CLOSED",
        };
        write!(f, "{}", name)
    }
}

/// Kind of a correlated request sent to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    Ping,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Subscribe => write!(f, "subscribe"),
            RequestKind::Unsubscribe => write!(f, "unsubscribe"),
            RequestKind::Ping => write!(f, "ping"),
        }
    }
}

/// Outbound frame for subscribe/unsubscribe/ping requests
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_channel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<bool>,
}

impl OutboundFrame {
    /// Create a subscribe frame that asks the server for an ack
    pub fn subscribe(id: impl Into<String>, topic: &str, private: bool) -> Self {
        Self {
            id: id.into(),
            kind: RequestKind::Subscribe,
            topic: Some(topic.to_string()),
            private_channel: Some(private),
            response: Some(true),
        }
    }

    /// Create an unsubscribe frame that asks the server for an ack
    pub fn unsubscribe(id: impl Into<String>, topic: &str, private: bool) -> Self {
        Self {
            id: id.into(),
            kind: RequestKind::Unsubscribe,
            topic: Some(topic.to_string()),
            private_channel: Some(private),
            response: Some(true),
        }
    }

    pub fn ping(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: RequestKind::Ping,
            topic: None,
            private_channel: None,
            response: None,
        }
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Welcome {
        #[serde(default)]
        id: Option<String>,
    },
    Ack {
        id: String,
    },
    Message {
        topic: String,
        #[serde(default)]
        subject: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        code: Option<serde_json::Value>,
        #[serde(default)]
        data: serde_json::Value,
    },
    Pong {
        id: String,
    },
}

/// Market or account event delivered to the consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    pub topic: String,
    pub subject: String,
    pub payload: serde_json::Value,
}

/// Events emitted on the client's delivery channel
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A message for an active subscription
    Message(StreamMessage),
    /// An inbound frame could not be decoded; the stream continues
    DeliveryError(String),
}

/// Error types for streaming operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Session closed")]
    Closed,
}

impl StreamError {
    /// Whether the reconnect loop should retry after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Network(_) => true,
            StreamError::Protocol(_) => true, // handshake problems are retried like network errors
            StreamError::Timeout(_) => true,
            StreamError::Auth(_) => false,
            StreamError::Closed => false,
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Protocol(format!("JSON error: {}", e))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::Network(format!("WebSocket error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame_serialization() {
        let frame = OutboundFrame::subscribe("42", "/market/ticker:BTC-USDT", false);
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "id": "42",
                "type": "subscribe",
                "topic": "/market/ticker:BTC-USDT",
                "privateChannel": false,
                "response": true
            })
        );
    }

    #[test]
    fn test_ping_frame_omits_topic_fields() {
        let value = serde_json::to_value(OutboundFrame::ping("7")).unwrap();
        assert_eq!(value, serde_json::json!({ "id": "7", "type": "ping" }));
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Reconnecting.to_string(), "RECONNECTING");
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Active.is_terminal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StreamError::Network("reset".into()).is_retryable());
        assert!(StreamError::Timeout("pong".into()).is_retryable());
        assert!(!StreamError::Auth("bad key".into()).is_retryable());
        assert!(!StreamError::Closed.is_retryable());
    }
}
