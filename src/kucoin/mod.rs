//! KuCoin streaming API integration module
//!
//! Handles bullet token negotiation, WebSocket transport, subscription
//! bookkeeping and frame routing for KuCoin.

pub mod bootstrap;
pub mod credentials;
pub mod dispatcher;
pub mod mock;
pub mod registry;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use bootstrap::{BootstrapInfo, BootstrapResolver, Endpoint, RestBootstrapResolver};
pub use credentials::{Credential, CredentialMode, CredentialProvider};
pub use dispatcher::Dispatcher;
pub use registry::{Subscription, SubscriptionRegistry};
pub use transport::{FrameSender, KeepAlive, TransportSession};
pub use types::*;
