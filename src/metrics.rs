use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters for the channel's lifecycle. Use `snapshot()` to get a
/// point-in-time view of all metrics, or the individual getters.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
///
/// println!("Connections: {}", metrics.connections());
/// println!("Heartbeats sent: {}", metrics.heartbeats_sent());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    // Counter fields - private, exposed via getters
    connection_attempts_total: AtomicU64,
    connections_total: AtomicU64,
    reconnects_scheduled_total: AtomicU64,
    disconnects_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_dispatched_total: AtomicU64,
    decode_failures_total: AtomicU64,
    handler_panics_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_failures_total: AtomicU64,
    auth_failures_total: AtomicU64,
    reconnects_exhausted_total: AtomicU64,
    missing_token_total: AtomicU64,

    /// Start of the current session, if one is open
    connected_at: RwLock<Option<Instant>>,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Transport opens attempted
    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts_total.load(Ordering::Relaxed)
    }

    /// Successful negotiations
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Reconnects scheduled after a transient failure
    pub fn reconnects_scheduled(&self) -> u64 {
        self.reconnects_scheduled_total.load(Ordering::Relaxed)
    }

    /// Sessions that ended, for any reason
    pub fn disconnects(&self) -> u64 {
        self.disconnects_total.load(Ordering::Relaxed)
    }

    /// MESSAGE frames received on the subscription
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Messages delivered to the handler
    pub fn messages_dispatched(&self) -> u64 {
        self.messages_dispatched_total.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures_total.load(Ordering::Relaxed)
    }

    pub fn handler_panics(&self) -> u64 {
        self.handler_panics_total.load(Ordering::Relaxed)
    }

    /// Application heartbeats written
    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    /// Application heartbeats that failed to write
    pub fn heartbeat_failures(&self) -> u64 {
        self.heartbeat_failures_total.load(Ordering::Relaxed)
    }

    /// Broker rejections classified as authentication failures
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures_total.load(Ordering::Relaxed)
    }

    pub fn reconnects_exhausted(&self) -> u64 {
        self.reconnects_exhausted_total.load(Ordering::Relaxed)
    }

    /// `connect()` calls skipped because no token was stored
    pub fn missing_token(&self) -> u64 {
        self.missing_token_total.load(Ordering::Relaxed)
    }

    /// Age of the current session, `None` when not connected
    pub fn connected_for(&self) -> Option<Duration> {
        self.connected_at.read().map(|t| t.elapsed())
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection_attempt(&self) {
        self.connection_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment connection counter and start the uptime clock
    pub(crate) fn record_connected(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        *self.connected_at.write() = Some(Instant::now());
    }

    pub(crate) fn record_reconnect_scheduled(&self) {
        self.reconnects_scheduled_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment disconnect counter and stop the uptime clock
    pub(crate) fn record_disconnect(&self) {
        self.disconnects_total.fetch_add(1, Ordering::Relaxed);
        *self.connected_at.write() = None;
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_dispatched(&self) {
        self.messages_dispatched_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_panic(&self) {
        self.handler_panics_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_failure(&self) {
        self.heartbeat_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_auth_failure(&self) {
        self.auth_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnects_exhausted(&self) {
        self.reconnects_exhausted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_missing_token(&self) {
        self.missing_token_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connection_attempts_total: self.connection_attempts_total.load(Ordering::Acquire),
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnects_scheduled_total: self.reconnects_scheduled_total.load(Ordering::Acquire),
            disconnects_total: self.disconnects_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_dispatched_total: self.messages_dispatched_total.load(Ordering::Acquire),
            decode_failures_total: self.decode_failures_total.load(Ordering::Acquire),
            handler_panics_total: self.handler_panics_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_failures_total: self.heartbeat_failures_total.load(Ordering::Acquire),
            auth_failures_total: self.auth_failures_total.load(Ordering::Acquire),
            reconnects_exhausted_total: self.reconnects_exhausted_total.load(Ordering::Acquire),
            missing_token_total: self.missing_token_total.load(Ordering::Acquire),
            connected_for: self.connected_for(),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connection_attempts_total: u64,
    pub connections_total: u64,
    pub reconnects_scheduled_total: u64,
    pub disconnects_total: u64,
    pub messages_received_total: u64,
    pub messages_dispatched_total: u64,
    pub decode_failures_total: u64,
    pub handler_panics_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_failures_total: u64,
    pub auth_failures_total: u64,
    pub reconnects_exhausted_total: u64,
    pub missing_token_total: u64,
    pub connected_for: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connection_attempt();
        metrics.record_connection_attempt();
        metrics.record_connected();
        metrics.record_reconnect_scheduled();

        assert_eq!(metrics.connection_attempts(), 2);
        assert_eq!(metrics.connections(), 1);
        assert_eq!(metrics.reconnects_scheduled(), 1);
        assert_eq!(metrics.disconnects(), 0);
    }

    #[test]
    fn test_uptime_tracks_session() {
        let metrics = Metrics::new();
        assert!(metrics.connected_for().is_none());

        metrics.record_connected();
        assert!(metrics.connected_for().is_some());

        metrics.record_disconnect();
        assert!(metrics.connected_for().is_none());
        assert_eq!(metrics.disconnects(), 1);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_connected();
        metrics.record_message_received();
        metrics.record_message_received();
        metrics.record_message_dispatched();
        metrics.record_decode_failure();
        metrics.record_heartbeat_sent();
        metrics.record_auth_failure();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.messages_received_total, 2);
        assert_eq!(snapshot.messages_dispatched_total, 1);
        assert_eq!(snapshot.decode_failures_total, 1);
        assert_eq!(snapshot.heartbeats_sent_total, 1);
        assert_eq!(snapshot.auth_failures_total, 1);
        assert_eq!(snapshot.handler_panics_total, 0);
        assert!(snapshot.connected_for.is_some());
    }
}
