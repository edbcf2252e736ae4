use crate::subscription::InboundMessage;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;

/// Lifecycle state of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Negotiating, or waiting out a reconnect delay
    Connecting,
    /// Negotiated and subscribed
    Open,
    /// Tearing down on request
    Closing,
    /// Torn down; only an explicit `connect()` leaves this state
    Closed,
}

impl ConnectionState {
    /// `true` only while `Open`
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    Requested,
    /// The channel was disabled
    Disabled,
    /// The broker rejected our credentials. No reconnect follows.
    AuthenticationRejected(String),
    /// ERROR frame or malformed traffic from the broker
    ProtocolError(String),
    /// Transport dropped, failed to open, or went silent
    TransportClosed(String),
    /// Reconnect attempts used up
    ReconnectExhausted { attempts: u32 },
}

impl DisconnectReason {
    /// Whether a reconnect may follow this disconnect
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ProtocolError(_) | DisconnectReason::TransportClosed(_)
        )
    }
}

/// Callbacks for the presence channel.
///
/// Callbacks run on the manager's driver task, one at a time and in arrival
/// order. Panics are caught and logged; the session stays up.
///
/// # Example
///
/// ```ignore
/// use presence_channel::{InboundMessage, SubscriptionHandler, UserActivity};
///
/// struct Presence;
///
/// impl SubscriptionHandler for Presence {
///     type Message = UserActivity;
///
///     async fn on_message(&self, message: InboundMessage<UserActivity>) {
///         println!("{} online={}", message.payload.user_name, message.payload.is_online);
///     }
/// }
/// ```
pub trait SubscriptionHandler: Send + Sync + 'static {
    /// Payload type of the topic, decoded from the JSON body
    type Message: DeserializeOwned + Send + 'static;

    /// Called once per decoded MESSAGE frame.
    fn on_message(
        &self,
        message: InboundMessage<Self::Message>,
    ) -> impl Future<Output = ()> + Send;

    /// Called after negotiation and subscription; the first heartbeat follows immediately.
    fn on_connect(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called whenever a session ends, before any reconnect is scheduled.
    fn on_disconnect(&self, _reason: &DisconnectReason) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called on every state transition.
    fn on_state_change(
        &self,
        _from: ConnectionState,
        _to: ConnectionState,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}
