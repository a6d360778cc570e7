//! Metrics collection and monitoring module
//!
//! Counts delivery, decode and reconnect activity for a streaming session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Point-in-time copy of the session counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
    pub last_message_time: u64,
}

/// Live counters shared by the session tasks
#[derive(Debug, Default)]
pub struct SessionStats {
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    decode_errors: AtomicU64,
    reconnects: AtomicU64,
    last_message_time: AtomicU64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
        self.last_message_time.store(now_millis(), Ordering::Relaxed);
        metrics::increment_counter!("kustream_messages_delivered_total");
    }

    /// A message arrived for a topic that is no longer subscribed
    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("kustream_messages_dropped_total");
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("kustream_decode_errors_total");
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("kustream_reconnects_total");
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_message_time: self.last_message_time.load(Ordering::Relaxed),
        }
    }
}
