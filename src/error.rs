use crate::config::ConfigError;
use crate::frame::FrameError;
use std::time::Duration;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be passed around without holding on to the underlying source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Transport could not be opened or was lost
    Transport,
    /// Negotiation did not finish in time
    Timeout,
    /// The broker answered with an ERROR frame
    Protocol,
    /// A frame could not be parsed
    Frame,
    /// The broker stopped sending heart-beats
    HeartbeatTimeout,
    /// No bearer token was available
    MissingToken,
    /// A message payload could not be decoded
    Decode,
    /// Invalid configuration
    Config,
    /// Manager is shutting down
    ShuttingDown,
}

/// Errors that can occur in presence-channel
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport failed to open or closed underneath the session
    #[error("Transport error: {0}")]
    Transport(String),

    /// Transport open plus negotiation exceeded the configured timeout
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// ERROR frame received from the broker
    #[error("Broker error: {message}")]
    Protocol {
        message: String,
        details: Option<String>,
    },

    /// Malformed STOMP frame
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// No data from the broker within the negotiated heart-beat tolerance
    #[error("No heart-beat from broker within {0:?}")]
    HeartbeatTimeout(Duration),

    /// Token store had nothing under the configured key
    #[error("No auth token available under key '{key}'")]
    MissingToken { key: String },

    /// Payload decode failure
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Manager is shutting down
    #[error("Manager is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::Transport(_) => ErrorKind::Transport,
            Error::ConnectTimeout(_) => ErrorKind::Timeout,
            Error::Protocol { .. } => ErrorKind::Protocol,
            Error::Frame(_) => ErrorKind::Frame,
            Error::HeartbeatTimeout(_) => ErrorKind::HeartbeatTimeout,
            Error::MissingToken { .. } => ErrorKind::MissingToken,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Config(_) => ErrorKind::Config,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }

    pub(crate) fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }
}
