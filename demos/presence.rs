//! Example: following user presence on `/topic/user-activity`
//!
//! Reads the broker address from `PRESENCE_WS_BASE_URL` and the bearer token
//! from `PRESENCE_TOKEN`.
//!
//! Run with: PRESENCE_WS_BASE_URL=http://localhost:8080 PRESENCE_TOKEN=... \
//!     cargo run --example presence

use presence_channel::{
    ClientConfig, ConnectionManager, ConnectionState, DisconnectReason, InboundMessage,
    MemoryTokenStore, SubscriptionHandler, UserActivity,
};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct PresenceLogger;

impl SubscriptionHandler for PresenceLogger {
    type Message = UserActivity;

    async fn on_message(&self, message: InboundMessage<UserActivity>) {
        let user = &message.payload;
        info!(
            "{} ({}) is {} (last seen {:?})",
            user.user_name,
            user.user_id,
            if user.is_online { "online" } else { "offline" },
            user.last_seen_at()
        );
    }

    async fn on_connect(&self) {
        info!("Presence channel open");
    }

    async fn on_disconnect(&self, reason: &DisconnectReason) {
        warn!("Presence channel closed: {:?}", reason);
    }

    async fn on_state_change(&self, from: ConnectionState, to: ConnectionState) {
        info!("State {} -> {}", from, to);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let config = ClientConfig::from_env()?;

    let tokens = Arc::new(MemoryTokenStore::new());
    if let Ok(token) = std::env::var("PRESENCE_TOKEN") {
        tokens.set(config.endpoint.token_key.clone(), token);
    }

    let manager = ConnectionManager::with_websocket(config, tokens, PresenceLogger);

    // Run for a while
    info!("Running for 120s...");
    tokio::time::sleep(Duration::from_secs(120)).await;

    let snapshot = manager.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnects scheduled: {}", snapshot.reconnects_scheduled_total);
    info!("  Messages dispatched: {}", snapshot.messages_dispatched_total);
    info!("  Heartbeats sent: {}", snapshot.heartbeats_sent_total);

    manager.shutdown().await;
    Ok(())
}
