//! Framing-layer heart-beats (the STOMP `heart-beat` header).
//!
//! These keep the transport alive and detect a silent broker. They are
//! unrelated to the application heartbeat payload sent to the broker.

use tokio::time::{Duration, Instant};

/// Silence tolerated from the broker, as a multiple of its heart-beat interval
const SILENCE_TOLERANCE: u32 = 2;

/// Parse a `heart-beat` header value (`"cx,cy"` in milliseconds).
pub fn parse_heartbeat_header(value: &str) -> Option<(u64, u64)> {
    let (x, y) = value.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// Negotiate effective heart-beat intervals.
///
/// `client` is what we put in CONNECT (can send, want to receive), `server`
/// is what came back in CONNECTED. Returns `(outgoing, incoming)`; zero means
/// disabled in that direction.
pub fn negotiate_heartbeats(client: (u64, u64), server: (u64, u64)) -> (Duration, Duration) {
    let (cx, cy) = client;
    let (sx, sy) = server;

    let outgoing = if cx == 0 || sy == 0 { 0 } else { cx.max(sy) };
    let incoming = if cy == 0 || sx == 0 { 0 } else { cy.max(sx) };

    (
        Duration::from_millis(outgoing),
        Duration::from_millis(incoming),
    )
}

/// Tracks framing-layer liveness for a single session
#[derive(Debug)]
pub struct LivenessMonitor {
    /// Negotiated outgoing interval (zero: we never send heart-beats)
    outgoing: Duration,

    /// Negotiated incoming interval (zero: broker silence is never fatal)
    incoming: Duration,

    /// Time of last frame or heart-beat written
    last_sent: Instant,

    /// Time of last byte received
    last_received: Instant,
}

impl LivenessMonitor {
    /// Create a new monitor; both clocks start now.
    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        let now = Instant::now();
        Self {
            outgoing,
            incoming,
            last_sent: now,
            last_received: now,
        }
    }

    /// Record that we wrote something
    pub fn record_sent(&mut self) {
        self.last_sent = Instant::now();
    }

    /// Record that we received data (frame or heart-beat)
    pub fn record_received(&mut self) {
        self.last_received = Instant::now();
    }

    /// Check if an outgoing heart-beat is due
    pub fn should_send_heartbeat(&self) -> bool {
        !self.outgoing.is_zero() && self.last_sent.elapsed() >= self.outgoing
    }

    /// Allowed silence from the broker, if monitored
    pub fn silence_tolerance(&self) -> Option<Duration> {
        (!self.incoming.is_zero()).then(|| self.incoming * SILENCE_TOLERANCE)
    }

    /// Check if the broker has been silent for too long
    pub fn is_peer_silent(&self) -> bool {
        match self.silence_tolerance() {
            None => false,
            Some(tolerance) => self.last_received.elapsed() >= tolerance,
        }
    }

    /// Time until either an outgoing heart-beat or the silence check is due.
    ///
    /// `None` when neither direction is active.
    pub fn time_until_next_check(&self) -> Option<Duration> {
        let send = (!self.outgoing.is_zero())
            .then(|| self.outgoing.saturating_sub(self.last_sent.elapsed()));
        let silent = self
            .silence_tolerance()
            .map(|t| t.saturating_sub(self.last_received.elapsed()));

        match (send, silent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn outgoing(&self) -> Duration {
        self.outgoing
    }

    pub fn incoming(&self) -> Duration {
        self.incoming
    }
}
