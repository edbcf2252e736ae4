//! In-memory transport and recording handler for tests.

use crate::error::Error;
use crate::frame::{Command, Frame, FrameDecoder};
use crate::handler::{ConnectionState, DisconnectReason, SubscriptionHandler};
use crate::subscription::InboundMessage;
use crate::transport::{Transport, TransportSession};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

/// Create a connected client/peer pair.
pub fn pipe() -> (TransportSession, MockPeer) {
    let (to_client, from_peer) = mpsc::unbounded_channel::<Result<String, Error>>();
    let (to_peer, from_client) = mpsc::unbounded_channel::<String>();

    let outbound = futures_util::sink::unfold(to_peer, |tx, text: String| async move {
        tx.send(text).map_err(|_| Error::transport("peer went away"))?;
        Ok::<_, Error>(tx)
    });
    let inbound = futures_util::stream::unfold(from_peer, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    (
        TransportSession::new(Box::pin(outbound), Box::pin(inbound)),
        MockPeer {
            tx: Some(to_client),
            rx: from_client,
            decoder: FrameDecoder::new(usize::MAX),
        },
    )
}

/// Broker side of a [`pipe`]
pub struct MockPeer {
    tx: Option<mpsc::UnboundedSender<Result<String, Error>>>,
    rx: mpsc::UnboundedReceiver<String>,
    decoder: FrameDecoder,
}

impl MockPeer {
    /// Next frame written by the client; `None` once the client side is gone.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame().expect("client wrote a bad frame") {
                return Some(frame);
            }
            let raw = self.rx.recv().await?;
            self.decoder.push(&raw);
        }
    }

    /// Next frame that is not a SEND (skips application heartbeats).
    pub async fn next_non_send(&mut self) -> Option<Frame> {
        loop {
            let frame = self.next_frame().await?;
            if frame.command != Command::Send {
                return Some(frame);
            }
        }
    }

    /// Raw transport message, without waiting
    pub fn try_next_raw(&mut self) -> Result<String, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(text.into()));
        }
    }

    pub fn send_frame(&self, frame: &Frame) {
        self.send_raw(frame.encode());
    }

    /// Surface a transport error to the client
    pub fn fail(&self, error: Error) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(error));
        }
    }

    /// End the inbound stream, as a broker hanging up would
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Expect CONNECT and answer CONNECTED without framing heart-beats.
    pub async fn accept(&mut self) -> Frame {
        let connect = self.next_frame().await.expect("CONNECT");
        assert_eq!(connect.command, Command::Connect);
        self.send_frame(
            &Frame::new(Command::Connected)
                .with_header("version", "1.2")
                .with_header("heart-beat", "0,0"),
        );
        connect
    }

    /// Expect CONNECT, answer ERROR and hang up.
    pub async fn reject(&mut self, message: &str) {
        let connect = self.next_frame().await.expect("CONNECT");
        assert_eq!(connect.command, Command::Connect);
        self.send_frame(&Frame::new(Command::Error).with_header("message", message));
        self.close();
    }

    /// MESSAGE on the given subscription
    pub fn deliver(&self, subscription: &str, destination: &str, body: &str) {
        self.send_frame(
            &Frame::new(Command::Message)
                .with_header("subscription", subscription)
                .with_header("destination", destination)
                .with_header("message-id", "m-1")
                .with_body(body),
        );
    }
}

/// How the next `open` call behaves
#[derive(Debug, Clone)]
pub enum Outcome {
    Accept,
    Refuse(String),
}

struct MockState {
    script: VecDeque<Outcome>,
    opened: Vec<(Instant, Url)>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

/// Scripted transport. Unscripted opens are accepted.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                opened: Vec::new(),
                peers,
            })),
        };
        (transport, rx)
    }

    pub fn push(&self, outcome: Outcome) {
        self.inner.lock().script.push_back(outcome);
    }

    pub fn opened(&self) -> Vec<(Instant, Url)> {
        self.inner.lock().opened.clone()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().opened.len()
    }
}

impl Transport for MockTransport {
    async fn open(&self, url: &Url) -> Result<TransportSession, Error> {
        let mut state = self.inner.lock();
        state.opened.push((Instant::now(), url.clone()));

        match state.script.pop_front().unwrap_or(Outcome::Accept) {
            Outcome::Refuse(reason) => Err(Error::transport(reason)),
            Outcome::Accept => {
                let (session, peer) = pipe();
                let _ = state.peers.send(peer);
                Ok(session)
            }
        }
    }
}

/// Payload used by the manager tests
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ping {
    pub n: u32,
}

/// Everything a [`RecordingHandler`] sees
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    State(ConnectionState, ConnectionState),
    Connected,
    Disconnected(DisconnectReason),
    Message(u32),
}

/// Forwards every callback to a channel
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Seen>,
}

impl RecordingHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SubscriptionHandler for RecordingHandler {
    type Message = Ping;

    async fn on_message(&self, message: InboundMessage<Ping>) {
        if message.payload.n == 13 {
            panic!("unlucky message");
        }
        let _ = self.tx.send(Seen::Message(message.payload.n));
    }

    async fn on_connect(&self) {
        let _ = self.tx.send(Seen::Connected);
    }

    async fn on_disconnect(&self, reason: &DisconnectReason) {
        let _ = self.tx.send(Seen::Disconnected(reason.clone()));
    }

    async fn on_state_change(&self, from: ConnectionState, to: ConnectionState) {
        let _ = self.tx.send(Seen::State(from, to));
    }
}
