//! STOMP session over a [`TransportSession`].
//!
//! `negotiate` performs the CONNECT/CONNECTED handshake; afterwards the
//! session sends frames and yields [`SessionEvent`]s, taking care of
//! framing-layer heart-beats on the way.

use crate::error::Error;
use crate::frame::{Command, Frame, FrameDecoder};
use crate::liveness::{negotiate_heartbeats, parse_heartbeat_header, LivenessMonitor};
use crate::token::AuthToken;
use crate::transport::{InboundStream, OutboundSink, TransportSession};
use futures_util::{SinkExt, StreamExt};
use tokio::time::Duration;
use tracing::{debug, trace};

/// Versions offered in CONNECT
pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

const DISCONNECT_RECEIPT: &str = "disconnect-0";

/// Parameters of the CONNECT frame
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Virtual host (the endpoint host name)
    pub host: String,
    /// Sent as `Authorization: Bearer {token}`
    pub token: AuthToken,
    /// Framing heart-beat we can send
    pub heartbeat_outgoing: Duration,
    /// Framing heart-beat we want to receive
    pub heartbeat_incoming: Duration,
}

impl ConnectRequest {
    fn heartbeat_millis(&self) -> (u64, u64) {
        (
            self.heartbeat_outgoing.as_millis() as u64,
            self.heartbeat_incoming.as_millis() as u64,
        )
    }

    fn to_frame(&self) -> Frame {
        let (cx, cy) = self.heartbeat_millis();
        Frame::new(Command::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("host", self.host.as_str())
            .with_header("heart-beat", format!("{},{}", cx, cy))
            .with_header("Authorization", self.token.bearer())
    }
}

/// What a session reports upward
#[derive(Debug)]
pub enum SessionEvent {
    /// MESSAGE frame
    Message(Frame),
    /// RECEIPT frame (receipt id)
    Receipt(String),
    /// ERROR frame; the broker closes the transport after sending one
    Error(Error),
    /// Transport ended or became unusable
    Closed(Error),
}

/// An established STOMP session
pub struct StompSession {
    outbound: OutboundSink,
    inbound: InboundStream,
    decoder: FrameDecoder,
    liveness: LivenessMonitor,
    version: Option<String>,
    server: Option<String>,
}

impl std::fmt::Debug for StompSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompSession")
            .field("version", &self.version)
            .field("server", &self.server)
            .field("liveness", &self.liveness)
            .finish_non_exhaustive()
    }
}

/// Build a protocol error from an ERROR frame
pub fn protocol_error(frame: &Frame) -> Error {
    let body = frame.body.trim();
    let message = frame
        .header("message")
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    let details = (!body.is_empty()).then(|| body.to_string());
    Error::Protocol { message, details }
}

impl StompSession {
    /// Send CONNECT and wait for CONNECTED.
    ///
    /// An ERROR reply becomes `Error::Protocol`; the transport ending first
    /// becomes `Error::Transport`. No timeout is applied here.
    pub async fn negotiate(
        transport: TransportSession,
        request: &ConnectRequest,
        max_frame_size: usize,
    ) -> Result<StompSession, Error> {
        let TransportSession { outbound, inbound } = transport;
        let mut session = StompSession {
            outbound,
            inbound,
            decoder: FrameDecoder::new(max_frame_size),
            liveness: LivenessMonitor::new(Duration::ZERO, Duration::ZERO),
            version: None,
            server: None,
        };

        session.write_frame(request.to_frame()).await?;

        loop {
            let frame = session.read_frame().await?;
            match frame.command {
                Command::Connected => {
                    let server_hb = frame
                        .header("heart-beat")
                        .and_then(parse_heartbeat_header)
                        .unwrap_or((0, 0));
                    let (outgoing, incoming) =
                        negotiate_heartbeats(request.heartbeat_millis(), server_hb);

                    session.liveness = LivenessMonitor::new(outgoing, incoming);
                    session.version = frame.header("version").map(str::to_string);
                    session.server = frame.header("server").map(str::to_string);

                    debug!(
                        "STOMP negotiated (version={:?}, server={:?}, heart-beat out={:?} in={:?})",
                        session.version, session.server, outgoing, incoming
                    );
                    return Ok(session);
                }
                Command::Error => return Err(protocol_error(&frame)),
                other => {
                    debug!("Ignoring {} frame before CONNECTED", other);
                }
            }
        }
    }

    /// Negotiated protocol version
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Effective `(outgoing, incoming)` framing heart-beats
    pub fn heartbeats(&self) -> (Duration, Duration) {
        (self.liveness.outgoing(), self.liveness.incoming())
    }

    /// SEND a body to a destination
    pub async fn send(
        &mut self,
        destination: &str,
        content_type: &str,
        body: String,
    ) -> Result<(), Error> {
        let frame = Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", content_type)
            .with_body(body);
        self.write_frame(frame).await
    }

    /// SUBSCRIBE with automatic acknowledgement
    pub async fn subscribe(&mut self, id: &str, destination: &str) -> Result<(), Error> {
        let frame = Frame::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto");
        self.write_frame(frame).await
    }

    /// UNSUBSCRIBE
    pub async fn unsubscribe(&mut self, id: &str) -> Result<(), Error> {
        self.write_frame(Frame::new(Command::Unsubscribe).with_header("id", id))
            .await
    }

    /// Graceful shutdown: DISCONNECT, wait for its RECEIPT, close the transport.
    ///
    /// Callers bound this with a timeout; the session is consumed either way.
    pub async fn disconnect(mut self) -> Result<(), Error> {
        self.write_frame(
            Frame::new(Command::Disconnect).with_header("receipt", DISCONNECT_RECEIPT),
        )
        .await?;

        loop {
            match self.read_frame().await {
                Ok(frame)
                    if frame.command == Command::Receipt
                        && frame.header("receipt-id") == Some(DISCONNECT_RECEIPT) =>
                {
                    break
                }
                Ok(frame) => trace!("Discarding {} frame while disconnecting", frame.command),
                // Broker hung up without a receipt; nothing left to close
                Err(_) => return Ok(()),
            }
        }

        self.outbound.close().await
    }

    /// Wait for the next event.
    ///
    /// Writes outgoing heart-beats while idle and reports `Closed` once the
    /// broker has been silent past the negotiated tolerance.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => match frame.command {
                    Command::Message => return SessionEvent::Message(frame),
                    Command::Receipt => {
                        let id = frame.header("receipt-id").unwrap_or_default().to_string();
                        return SessionEvent::Receipt(id);
                    }
                    Command::Error => return SessionEvent::Error(protocol_error(&frame)),
                    other => {
                        debug!("Ignoring unexpected {} frame", other);
                        continue;
                    }
                },
                Ok(None) => {}
                Err(e) => return SessionEvent::Closed(Error::Frame(e)),
            }

            if self.liveness.is_peer_silent() {
                let tolerance = self.liveness.silence_tolerance().unwrap_or_default();
                return SessionEvent::Closed(Error::HeartbeatTimeout(tolerance));
            }

            if self.liveness.should_send_heartbeat() {
                trace!("Sending framing heart-beat");
                if let Err(e) = self.write_raw("\n".to_string()).await {
                    return SessionEvent::Closed(e);
                }
                continue;
            }

            let next_check = self.liveness.time_until_next_check();
            let received = tokio::select! {
                msg = self.inbound.next() => Some(msg),
                _ = sleep_opt(next_check) => None,
            };

            match received {
                Some(Some(Ok(text))) => {
                    self.liveness.record_received();
                    self.decoder.push(&text);
                }
                Some(Some(Err(e))) => return SessionEvent::Closed(e),
                Some(None) => {
                    return SessionEvent::Closed(Error::transport("connection closed by broker"))
                }
                // Timer fired; liveness is re-evaluated at the top of the loop
                None => {}
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, Error> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            match self.inbound.next().await {
                Some(Ok(text)) => {
                    self.liveness.record_received();
                    self.decoder.push(&text);
                }
                Some(Err(e)) => return Err(e),
                None => return Err(Error::transport("connection closed by broker")),
            }
        }
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), Error> {
        trace!("-> {}", frame.command);
        self.write_raw(frame.encode()).await
    }

    async fn write_raw(&mut self, text: String) -> Result<(), Error> {
        self.outbound.send(text).await?;
        self.liveness.record_sent();
        Ok(())
    }
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
