//! Streaming session management module
//!
//! This module provides the Session Manager: the state machine that owns
//! the connection lifecycle, reconnection and subscription replay.

pub mod session_manager;

pub use crate::kucoin::types::{SessionState, StreamError, StreamEvent, StreamMessage};
pub use crate::metrics::StatsSnapshot;
pub use session_manager::{SessionConfig, StreamClient};
