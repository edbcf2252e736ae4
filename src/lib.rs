//! # presence-channel
//!
//! A resilient STOMP-over-WebSocket subscription client for a user presence
//! topic.
//!
//! ## Features
//!
//! - **Authenticated sessions** with a bearer token read from a pluggable store
//! - **Single topic subscription**, re-registered after every reconnect
//! - **Application heartbeat** sent on open and then on a fixed period
//! - **Bounded reconnection** with linear backoff; authentication failures are permanent
//! - **Observable state** through a `tokio::sync::watch` channel
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use presence_channel::{
//!     ClientConfig, ConnectionManager, InboundMessage, MemoryTokenStore, SubscriptionHandler,
//!     UserActivity,
//! };
//! use std::sync::Arc;
//!
//! struct Presence;
//!
//! impl SubscriptionHandler for Presence {
//!     type Message = UserActivity;
//!
//!     async fn on_message(&self, message: InboundMessage<UserActivity>) {
//!         println!("{} online={}", message.payload.user_id, message.payload.is_online);
//!     }
//! }
//!
//! let config = ClientConfig::builder()
//!     .base_url("https://api.example.com")
//!     .build()?;
//!
//! let tokens = Arc::new(MemoryTokenStore::new());
//! tokens.set("token", "...");
//!
//! let manager = ConnectionManager::with_websocket(config, tokens, Presence);
//! let mut state = manager.watch_state();
//! state.wait_for(|s| s.is_connected()).await?;
//! ```

mod activity;
mod config;
mod error;
mod frame;
mod handler;
mod heartbeat;
mod liveness;
mod manager;
mod metrics;
mod reconnect;
mod stomp;
mod subscription;
mod token;
mod transport;

#[cfg(test)]
mod test_support;

pub use activity::{UserActivity, UserId};
pub use config::{
    Backoff, ClientConfig, ClientConfigBuilder, ConfigError, EndpointConfig, HeartbeatConfig,
    ReconnectConfig, StompConfig,
};
pub use error::{Error, ErrorKind};
pub use frame::{Command, Frame, FrameDecoder, FrameError};
pub use handler::{ConnectionState, DisconnectReason, SubscriptionHandler};
pub use heartbeat::{heartbeat_payload, HeartbeatScheduler};
pub use liveness::{negotiate_heartbeats, LivenessMonitor};
pub use manager::ConnectionManager;
pub use metrics::{Metrics, MetricsSnapshot};
pub use reconnect::{FailureClass, ReconnectDecision, ReconnectPolicy, ReconnectTimer};
pub use stomp::{ConnectRequest, SessionEvent, StompSession};
pub use subscription::{Dispatch, InboundMessage, TopicSubscription};
pub use token::{AuthToken, MemoryTokenStore, TokenStore};
pub use transport::{redact_url, InboundStream, OutboundSink, Transport, TransportSession, WsTransport};

// Re-export http types for upgrade request headers
pub use http::{HeaderName, HeaderValue};

/// Result type for presence-channel operations
pub type Result<T> = std::result::Result<T, Error>;
