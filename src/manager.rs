use crate::config::ClientConfig;
use crate::error::Error;
use crate::handler::{ConnectionState, DisconnectReason, SubscriptionHandler};
use crate::heartbeat::{heartbeat_payload, HeartbeatScheduler};
use crate::metrics::Metrics;
use crate::reconnect::{FailureClass, ReconnectDecision, ReconnectPolicy, ReconnectTimer};
use crate::stomp::{ConnectRequest, SessionEvent, StompSession};
use crate::subscription::{Dispatch, TopicSubscription, SUBSCRIPTION_ID};
use crate::token::TokenStore;
use crate::transport::{redact_url, Transport, WsTransport};
use chrono::Utc;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Commands sent from the handle to the driver task
#[derive(Debug)]
enum DriverCommand {
    Connect,
    Disconnect,
    SetEnabled(bool),
    Shutdown(oneshot::Sender<()>),
}

type PendingConnect = Pin<Box<dyn Future<Output = Result<StompSession, Error>> + Send>>;

/// Handle to the presence channel.
///
/// All transitions happen on a single driver task; the handle only queues
/// commands and reads the published state. Methods never block and never
/// fail: outcomes surface through [`ConnectionManager::watch_state`], the
/// handler callbacks, and the logs.
///
/// # Thread Safety
///
/// `ConnectionManager` is `Send + Sync`. Commands issued from several tasks
/// are applied in the order the driver receives them.
pub struct ConnectionManager<H: SubscriptionHandler, T: Transport = WsTransport> {
    name: String,
    command_tx: mpsc::UnboundedSender<DriverCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    enabled: Arc<AtomicBool>,
    handler: Arc<RwLock<Arc<H>>>,
    metrics: Arc<Metrics>,
    driver: Mutex<Option<JoinHandle<()>>>,
    _transport: PhantomData<fn() -> T>,
}

impl<H: SubscriptionHandler> ConnectionManager<H, WsTransport> {
    /// Create a manager over the default WebSocket transport
    pub fn with_websocket(config: ClientConfig, tokens: Arc<dyn TokenStore>, handler: H) -> Self {
        Self::new(config, WsTransport::new(), tokens, handler)
    }
}

impl<H: SubscriptionHandler, T: Transport> ConnectionManager<H, T> {
    /// Create a manager and spawn its driver on the current Tokio runtime.
    ///
    /// Connects right away when `config.enabled` is set.
    pub fn new(config: ClientConfig, transport: T, tokens: Arc<dyn TokenStore>, handler: H) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let handler = Arc::new(RwLock::new(Arc::new(handler)));
        let metrics = Arc::new(Metrics::new());
        let enabled = Arc::new(AtomicBool::new(config.enabled));

        if config.enabled {
            let _ = command_tx.send(DriverCommand::Connect);
        }

        let driver = Driver {
            name: config.name.clone(),
            subscription: TopicSubscription::new(SUBSCRIPTION_ID, config.stomp.topic.clone()),
            heartbeat: HeartbeatScheduler::new(config.heartbeat.interval),
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            enabled: config.enabled,
            config,
            transport: Arc::new(transport),
            tokens,
            handler: handler.clone(),
            metrics: metrics.clone(),
            state_tx,
            commands: command_rx,
            session: None,
            pending: None,
            reconnect_timer: ReconnectTimer::new(),
            attempts: 0,
        };
        let name = driver.name.clone();
        let handle = tokio::spawn(driver.run());

        Self {
            name,
            command_tx,
            state_rx,
            enabled,
            handler,
            metrics,
            driver: Mutex::new(Some(handle)),
            _transport: PhantomData,
        }
    }

    /// Start a session. A no-op while connecting, open, or disabled.
    pub fn connect(&self) {
        self.send(DriverCommand::Connect);
    }

    /// Tear the session down and cancel any pending reconnect. Idempotent.
    pub fn disconnect(&self) {
        self.send(DriverCommand::Disconnect);
    }

    /// Disabling tears down immediately; re-enabling connects.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            self.send(DriverCommand::SetEnabled(enabled));
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// `true` only while the session is open
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Observe state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Replace the callbacks. Takes effect for the next callback invoked.
    pub fn set_handler(&self, handler: H) {
        *self.handler.write() = Arc::new(handler);
    }

    /// Get metrics
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Disconnect and stop the driver task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(DriverCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }

        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("[{}] Manager shut down", self.name);
    }

    fn send(&self, command: DriverCommand) {
        if self.command_tx.send(command).is_err() {
            debug!("[{}] {}, command dropped", self.name, Error::ShuttingDown);
        }
    }
}

impl<H: SubscriptionHandler, T: Transport> Drop for ConnectionManager<H, T> {
    fn drop(&mut self) {
        // Abort the driver to prevent an orphaned task
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

/// What woke the driver
enum Event {
    Command(Option<DriverCommand>),
    Negotiated(Result<StompSession, Error>),
    Session(SessionEvent),
    HeartbeatDue,
    ReconnectDue,
}

/// Owns every piece of mutable connection state
struct Driver<H: SubscriptionHandler, T: Transport> {
    name: String,
    config: ClientConfig,
    transport: Arc<T>,
    tokens: Arc<dyn TokenStore>,
    handler: Arc<RwLock<Arc<H>>>,
    metrics: Arc<Metrics>,
    state_tx: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    enabled: bool,

    /// Live session, present only while `Open`
    session: Option<StompSession>,
    /// Transport open plus negotiation in flight
    pending: Option<PendingConnect>,
    subscription: TopicSubscription,
    heartbeat: HeartbeatScheduler,
    reconnect_timer: ReconnectTimer,
    policy: ReconnectPolicy,
    /// Reconnects made in the current failure episode
    attempts: u32,
}

impl<H: SubscriptionHandler, T: Transport> Driver<H, T> {
    async fn run(mut self) {
        debug!("[{}] Driver started", self.name);

        loop {
            let event = tokio::select! {
                biased;

                cmd = self.commands.recv() => Event::Command(cmd),
                _ = self.heartbeat.tick() => Event::HeartbeatDue,
                event = next_session_event(&mut self.session) => Event::Session(event),
                result = negotiation(&mut self.pending) => Event::Negotiated(result),
                _ = self.reconnect_timer.fired() => Event::ReconnectDue,
            };

            match event {
                Event::Command(Some(DriverCommand::Connect)) => self.handle_connect().await,
                Event::Command(Some(DriverCommand::Disconnect)) => {
                    self.teardown(DisconnectReason::Requested).await
                }
                Event::Command(Some(DriverCommand::SetEnabled(enabled))) => {
                    self.handle_set_enabled(enabled).await
                }
                Event::Command(Some(DriverCommand::Shutdown(done))) => {
                    self.teardown(DisconnectReason::Requested).await;
                    let _ = done.send(());
                    break;
                }
                Event::Command(None) => {
                    debug!("[{}] All handles dropped", self.name);
                    self.teardown(DisconnectReason::Requested).await;
                    break;
                }
                Event::Negotiated(Ok(session)) => self.handle_negotiated(session).await,
                Event::Negotiated(Err(e)) => self.handle_failure(e).await,
                Event::Session(event) => self.handle_session_event(event).await,
                Event::HeartbeatDue => self.send_heartbeat().await,
                Event::ReconnectDue => self.handle_reconnect_due().await,
            }
        }

        debug!("[{}] Driver stopped", self.name);
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn current_handler(&self) -> Arc<H> {
        self.handler.read().clone()
    }

    async fn set_state(&mut self, to: ConnectionState) {
        let from = self.state();
        if from == to {
            return;
        }
        self.state_tx.send_replace(to);
        debug!("[{}] State {} -> {}", self.name, from, to);

        let handler = self.current_handler();
        self.guarded("on_state_change", handler.on_state_change(from, to))
            .await;
    }

    /// Run a callback, containing panics
    async fn guarded(&mut self, callback: &str, fut: impl Future<Output = ()>) {
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            error!("[{}] Handler.{} panicked", self.name, callback);
            self.metrics.record_handler_panic();
        }
    }

    async fn notify_disconnect(&mut self, reason: &DisconnectReason) {
        let handler = self.current_handler();
        self.guarded("on_disconnect", handler.on_disconnect(reason))
            .await;
    }

    async fn handle_connect(&mut self) {
        if !self.enabled {
            debug!("[{}] Channel disabled, ignoring connect", self.name);
            return;
        }
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Open => {
                debug!("[{}] Already {}, ignoring connect", self.name, self.state());
            }
            _ => {
                self.start_attempt().await;
            }
        }
    }

    /// Kick off transport open plus negotiation. Returns `false` when the
    /// attempt could not start (no token, bad endpoint); state is untouched
    /// in that case.
    async fn start_attempt(&mut self) -> bool {
        let key = &self.config.endpoint.token_key;
        let Some(token) = self.tokens.get(key) else {
            warn!(
                "[{}] {}; not connecting",
                self.name,
                Error::MissingToken { key: key.clone() }
            );
            self.metrics.record_missing_token();
            return false;
        };

        let url = match self.config.endpoint.url_for(&token) {
            Ok(url) => url,
            Err(e) => {
                error!("[{}] Cannot build endpoint URL: {}", self.name, e);
                return false;
            }
        };

        let request = ConnectRequest {
            host: url.host_str().unwrap_or_default().to_string(),
            token,
            heartbeat_outgoing: self.config.stomp.heartbeat_outgoing,
            heartbeat_incoming: self.config.stomp.heartbeat_incoming,
        };
        let connect_timeout = self.config.stomp.connect_timeout;
        let max_frame_size = self.config.stomp.max_frame_size;
        let transport = self.transport.clone();

        info!("[{}] Connecting to {}", self.name, redact_url(&url));
        self.metrics.record_connection_attempt();
        self.set_state(ConnectionState::Connecting).await;

        self.pending = Some(Box::pin(async move {
            let attempt = async {
                let session = transport.open(&url).await?;
                StompSession::negotiate(session, &request, max_frame_size).await
            };
            timeout(connect_timeout, attempt)
                .await
                .map_err(|_| Error::ConnectTimeout(connect_timeout))?
        }));
        true
    }

    async fn handle_negotiated(&mut self, session: StompSession) {
        info!(
            "[{}] Connected (STOMP {})",
            self.name,
            session.version().unwrap_or("1.0")
        );
        self.metrics.record_connected();
        self.attempts = 0;
        self.session = Some(session);
        self.set_state(ConnectionState::Open).await;

        let registered = match self.session.as_mut() {
            Some(session) => self.subscription.register(session).await,
            None => return,
        };
        if let Err(e) = registered {
            warn!(
                "[{}] Failed to subscribe to {}: {}",
                self.name,
                self.subscription.destination(),
                e
            );
            self.handle_failure(e).await;
            return;
        }
        debug!(
            "[{}] Subscribed to {}",
            self.name,
            self.subscription.destination()
        );

        // First tick is immediate
        self.heartbeat.start();

        let handler = self.current_handler();
        self.guarded("on_connect", handler.on_connect()).await;
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Message(frame) => {
                self.metrics.record_message_received();
                let handler = self.current_handler();
                match self.subscription.dispatch(&frame, &*handler).await {
                    Dispatch::Delivered => self.metrics.record_message_dispatched(),
                    Dispatch::Ignored => {
                        debug!(
                            "[{}] Dropping message for unknown subscription {:?}",
                            self.name,
                            frame.header("subscription")
                        );
                    }
                    Dispatch::DecodeFailed(e) => {
                        warn!("[{}] Failed to decode message: {}", self.name, e);
                        self.metrics.record_decode_failure();
                    }
                    Dispatch::HandlerPanicked => {
                        error!(
                            "[{}] Handler.on_message panicked! Message dropped.",
                            self.name
                        );
                        self.metrics.record_handler_panic();
                    }
                }
            }
            SessionEvent::Receipt(id) => trace!("[{}] Receipt {}", self.name, id),
            SessionEvent::Error(e) | SessionEvent::Closed(e) => self.handle_failure(e).await,
        }
    }

    async fn send_heartbeat(&mut self) {
        let Some(session) = self.session.as_mut() else {
            self.heartbeat.stop();
            return;
        };

        let body = heartbeat_payload(Utc::now());
        let destination = &self.config.stomp.heartbeat_destination;
        match session.send(destination, "application/json", body).await {
            Ok(()) => {
                trace!("[{}] Heartbeat sent", self.name);
                self.metrics.record_heartbeat_sent();
            }
            // The session's own close event drives any transition
            Err(e) => {
                warn!("[{}] Failed to send heartbeat: {}", self.name, e);
                self.metrics.record_heartbeat_failure();
            }
        }
    }

    /// Session or negotiation ended on its own
    async fn handle_failure(&mut self, error: Error) {
        let was_open = self.session.take().is_some();
        self.pending = None;
        self.heartbeat.stop();
        self.subscription.reset();
        if was_open {
            self.metrics.record_disconnect();
        }

        let class = FailureClass::of(&error);
        let decision = if self.enabled {
            self.policy.decide(self.attempts, class)
        } else {
            ReconnectDecision::GiveUp
        };

        match decision {
            ReconnectDecision::GiveUp => {
                let reason = if class == FailureClass::Permanent {
                    self.metrics.record_auth_failure();
                    error!(
                        "[{}] Authentication rejected ({}); not reconnecting until connect() is called",
                        self.name, error
                    );
                    DisconnectReason::AuthenticationRejected(error.to_string())
                } else {
                    warn!("[{}] Connection lost while disabled: {}", self.name, error);
                    DisconnectReason::Disabled
                };
                self.notify_disconnect(&reason).await;
                self.set_state(ConnectionState::Closed).await;
            }
            ReconnectDecision::Exhausted { attempts } => {
                self.metrics.record_reconnects_exhausted();
                error!(
                    "[{}] Giving up after {} reconnect attempts (last error: {})",
                    self.name, attempts, error
                );
                self.notify_disconnect(&DisconnectReason::ReconnectExhausted { attempts })
                    .await;
                self.set_state(ConnectionState::Closed).await;
            }
            ReconnectDecision::Retry { attempt, delay } => {
                warn!(
                    "[{}] Connection lost: {}. Reconnecting in {:?} (attempt {}/{})",
                    self.name,
                    error,
                    delay,
                    attempt,
                    self.policy.max_attempts()
                );
                let reason = match &error {
                    Error::Protocol { .. } | Error::Frame(_) => {
                        DisconnectReason::ProtocolError(error.to_string())
                    }
                    _ => DisconnectReason::TransportClosed(error.to_string()),
                };
                self.notify_disconnect(&reason).await;

                self.attempts = attempt;
                self.metrics.record_reconnect_scheduled();
                self.reconnect_timer.schedule(delay);
                self.set_state(ConnectionState::Connecting).await;
            }
        }
    }

    async fn handle_reconnect_due(&mut self) {
        if !self.enabled {
            return;
        }
        debug!(
            "[{}] Reconnect attempt {}/{}",
            self.name,
            self.attempts,
            self.policy.max_attempts()
        );
        if !self.start_attempt().await {
            self.set_state(ConnectionState::Closed).await;
        }
    }

    async fn handle_set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            info!("[{}] Channel enabled", self.name);
            self.handle_connect().await;
        } else {
            info!("[{}] Channel disabled", self.name);
            self.teardown(DisconnectReason::Disabled).await;
        }
    }

    /// Orderly teardown: reconnect timer, heartbeat, subscription, transport.
    async fn teardown(&mut self, reason: DisconnectReason) {
        self.attempts = 0;
        match self.state() {
            ConnectionState::Closed => {
                // Nothing live; make sure nothing is armed either
                self.reconnect_timer.cancel();
                self.heartbeat.stop();
                self.pending = None;
                return;
            }
            ConnectionState::Idle => {
                self.reconnect_timer.cancel();
                self.heartbeat.stop();
                self.pending = None;
                self.set_state(ConnectionState::Closed).await;
                debug!("[{}] Closed before any session ({:?})", self.name, reason);
                return;
            }
            _ => {}
        }

        self.set_state(ConnectionState::Closing).await;
        self.reconnect_timer.cancel();
        self.heartbeat.stop();
        self.pending = None;

        if let Some(mut session) = self.session.take() {
            let subscription = &mut self.subscription;
            let graceful = async move {
                subscription.unregister(&mut session).await?;
                session.disconnect().await
            };
            match timeout(self.config.stomp.close_timeout, graceful).await {
                Ok(Ok(())) => debug!("[{}] Session closed cleanly", self.name),
                Ok(Err(e)) => debug!("[{}] Error while closing session: {}", self.name, e),
                Err(_) => debug!(
                    "[{}] Broker did not confirm DISCONNECT within {:?}",
                    self.name, self.config.stomp.close_timeout
                ),
            }
            self.subscription.reset();
            self.metrics.record_disconnect();
        }

        self.set_state(ConnectionState::Closed).await;
        info!("[{}] Disconnected ({:?})", self.name, reason);
        self.notify_disconnect(&reason).await;
    }
}

/// Next event of the live session; pends forever without one.
async fn next_session_event(session: &mut Option<StompSession>) -> SessionEvent {
    match session.as_mut() {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

/// Outcome of the in-flight negotiation; pends forever without one.
async fn negotiation(pending: &mut Option<PendingConnect>) -> Result<StompSession, Error> {
    match pending.as_mut() {
        Some(fut) => {
            let result = fut.as_mut().await;
            *pending = None;
            result
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Command, Frame};
    use crate::subscription::InboundMessage;
    use crate::test_support::{MockPeer, MockTransport, Outcome, Ping, RecordingHandler, Seen};
    use crate::token::MemoryTokenStore;
    use tokio::time::{sleep, Duration, Instant};

    type TestManager = ConnectionManager<RecordingHandler, MockTransport>;

    fn config() -> ClientConfig {
        ClientConfig::builder()
            .name("test")
            .base_url("http://broker.test")
            .build()
            .unwrap()
    }

    fn tokens(token: Option<&str>) -> Arc<dyn TokenStore> {
        let store = MemoryTokenStore::new();
        if let Some(token) = token {
            store.set("token", token);
        }
        Arc::new(store)
    }

    struct Harness {
        manager: TestManager,
        transport: MockTransport,
        peers: mpsc::UnboundedReceiver<MockPeer>,
        seen: mpsc::UnboundedReceiver<Seen>,
    }

    fn start(config: ClientConfig, token: Option<&str>) -> Harness {
        let (transport, peers) = MockTransport::new();
        let (handler, seen) = RecordingHandler::new();
        let manager = ConnectionManager::new(config, transport.clone(), tokens(token), handler);
        Harness {
            manager,
            transport,
            peers,
            seen,
        }
    }

    impl Harness {
        async fn next_peer(&mut self) -> MockPeer {
            timeout(Duration::from_secs(600), self.peers.recv())
                .await
                .expect("transport opened")
                .expect("peer")
        }

        /// Accept the next connection and consume SUBSCRIBE plus the first heartbeat
        async fn open(&mut self) -> MockPeer {
            let mut peer = self.next_peer().await;
            peer.accept().await;
            let subscribe = peer.next_frame().await.unwrap();
            assert_eq!(subscribe.command, Command::Subscribe);
            let heartbeat = peer.next_frame().await.unwrap();
            assert_eq!(heartbeat.command, Command::Send);
            self.wait_for(ConnectionState::Open).await;
            peer
        }

        async fn wait_for(&self, state: ConnectionState) {
            let mut rx = self.manager.watch_state();
            timeout(Duration::from_secs(600), rx.wait_for(|s| *s == state))
                .await
                .expect("state reached")
                .expect("driver alive");
        }

        /// Let the driver run, then collect what the handler saw
        async fn drain(&mut self) -> Vec<Seen> {
            sleep(Duration::from_millis(10)).await;
            let mut seen = Vec::new();
            while let Ok(event) = self.seen.try_recv() {
                seen.push(event);
            }
            seen
        }
    }

    fn states(seen: &[Seen]) -> Vec<(ConnectionState, ConnectionState)> {
        seen.iter()
            .filter_map(|s| match s {
                Seen::State(from, to) => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    fn receipt_for(frame: &Frame) -> Frame {
        Frame::new(Command::Receipt).with_header("receipt-id", frame.header("receipt").unwrap())
    }

    use ConnectionState::*;

    #[tokio::test(start_paused = true)]
    async fn test_connect_subscribes_and_heartbeats() {
        let mut h = start(config(), Some("abc"));

        let mut peer = h.next_peer().await;
        let connect = peer.accept().await;
        assert_eq!(connect.header("Authorization"), Some("Bearer abc"));
        assert_eq!(connect.header("heart-beat"), Some("4000,4000"));
        assert_eq!(connect.header("host"), Some("broker.test"));

        let subscribe = peer.next_frame().await.unwrap();
        assert_eq!(subscribe.command, Command::Subscribe);
        assert_eq!(subscribe.header("destination"), Some("/topic/user-activity"));

        // Immediate heartbeat on open
        let first = peer.next_frame().await.unwrap();
        assert_eq!(first.command, Command::Send);
        assert_eq!(first.header("destination"), Some("/app/user/heartbeat"));
        let body: serde_json::Value = serde_json::from_str(&first.body).unwrap();
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));

        let t0 = Instant::now();
        let second = peer.next_frame().await.unwrap();
        assert_eq!(second.command, Command::Send);
        assert_eq!(t0.elapsed(), Duration::from_secs(30));

        assert!(h.manager.is_connected());
        assert_eq!(
            h.transport.opened()[0].1.as_str(),
            "ws://broker.test/ws?token=abc"
        );

        let seen = h.drain().await;
        assert_eq!(states(&seen), vec![(Idle, Connecting), (Connecting, Open)]);
        assert!(seen.contains(&Seen::Connected));
        assert_eq!(h.manager.metrics().heartbeats_sent(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_is_noop() {
        let mut h = start(config(), None);

        let seen = h.drain().await;
        assert!(seen.is_empty());
        assert_eq!(h.manager.state(), Idle);
        assert_eq!(h.transport.open_count(), 0);
        assert_eq!(h.manager.metrics().missing_token(), 1);

        h.manager.connect();
        h.drain().await;
        assert_eq!(h.transport.open_count(), 0);
        assert_eq!(h.manager.metrics().missing_token(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_never_retries() {
        let mut h = start(config(), Some("stale"));

        let mut peer = h.next_peer().await;
        peer.reject("401 Unauthorized").await;
        h.wait_for(Closed).await;

        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.manager.metrics().reconnects_scheduled(), 0);
        assert_eq!(h.manager.metrics().auth_failures(), 1);

        let seen = h.drain().await;
        assert_eq!(states(&seen), vec![(Idle, Connecting), (Connecting, Closed)]);
        assert!(seen.iter().any(|s| matches!(
            s,
            Seen::Disconnected(DisconnectReason::AuthenticationRejected(_))
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_while_open_is_permanent() {
        let mut h = start(config(), Some("abc"));
        let peer = h.open().await;

        peer.send_frame(
            &Frame::new(Command::Error)
                .with_header("message", "Session closed")
                .with_body("Invalid token"),
        );
        h.wait_for(Closed).await;

        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_drop_reconnects_and_resubscribes() {
        let mut h = start(config(), Some("abc"));
        let mut peer = h.open().await;

        let t0 = Instant::now();
        peer.close();
        let mut peer = h.open().await;
        assert_eq!(t0.elapsed(), Duration::from_secs(5));
        assert_eq!(h.manager.metrics().reconnects_scheduled(), 1);

        // Counter was reset by the successful negotiation: 5s again, not 10s
        let t1 = Instant::now();
        peer.close();
        let _peer = h.open().await;
        assert_eq!(t1.elapsed(), Duration::from_secs(5));

        let seen = h.drain().await;
        assert_eq!(seen.iter().filter(|s| **s == Seen::Connected).count(), 3);
        assert!(seen.iter().any(|s| matches!(
            s,
            Seen::Disconnected(DisconnectReason::TransportClosed(_))
        )));
        assert!(states(&seen).contains(&(Open, Connecting)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_five_retries() {
        let h = start(config(), Some("abc"));
        for _ in 0..6 {
            h.transport.push(Outcome::Refuse("connection refused".into()));
        }

        h.wait_for(Closed).await;
        sleep(Duration::from_secs(300)).await;

        let opened = h.transport.opened();
        assert_eq!(opened.len(), 6);
        let gaps: Vec<u64> = opened
            .windows(2)
            .map(|w| (w[1].0 - w[0].0).as_secs())
            .collect();
        assert_eq!(gaps, vec![5, 10, 15, 20, 25]);

        let metrics = h.manager.metrics();
        assert_eq!(metrics.reconnects_scheduled(), 5);
        assert_eq!(metrics.reconnects_exhausted(), 1);
        assert_eq!(h.manager.state(), Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_connect_after_exhaustion() {
        let mut h = start(config(), Some("abc"));
        for _ in 0..6 {
            h.transport.push(Outcome::Refuse("connection refused".into()));
        }
        h.wait_for(Closed).await;
        let seen = h.drain().await;
        assert!(seen.contains(&Seen::Disconnected(DisconnectReason::ReconnectExhausted {
            attempts: 5
        })));

        h.manager.connect();
        let _peer = h.open().await;
        assert_eq!(h.transport.open_count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_open_is_noop() {
        let mut h = start(config(), Some("abc"));
        let _peer = h.open().await;

        h.manager.connect();
        h.manager.connect();
        h.drain().await;

        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.manager.metrics().connection_attempts(), 1);
        assert_eq!(h.manager.state(), Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_from_open() {
        let mut h = start(config(), Some("abc"));
        let mut peer = h.open().await;
        h.drain().await;

        h.manager.disconnect();
        let unsubscribe = peer.next_non_send().await.unwrap();
        assert_eq!(unsubscribe.command, Command::Unsubscribe);
        let disconnect = peer.next_frame().await.unwrap();
        assert_eq!(disconnect.command, Command::Disconnect);
        peer.send_frame(&receipt_for(&disconnect));

        h.wait_for(Closed).await;
        assert!(peer.next_frame().await.is_none());

        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.open_count(), 1);

        let seen = h.drain().await;
        assert_eq!(states(&seen), vec![(Open, Closing), (Closing, Closed)]);
        assert_eq!(
            seen.last(),
            Some(&Seen::Disconnected(DisconnectReason::Requested))
        );

        // Idempotent
        h.manager.disconnect();
        assert!(h.drain().await.is_empty());
        assert_eq!(h.manager.state(), Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let h = start(config(), Some("abc"));
        h.transport.push(Outcome::Refuse("connection refused".into()));

        // Initial attempt fails; a reconnect is now pending
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.manager.state(), Connecting);
        assert_eq!(h.manager.metrics().reconnects_scheduled(), 1);

        h.manager.disconnect();
        h.wait_for(Closed).await;

        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_from_idle_closes() {
        // Missing token leaves the manager Idle
        let mut h = start(config(), None);
        h.drain().await;
        assert_eq!(h.manager.state(), Idle);

        h.manager.set_enabled(false);
        h.wait_for(Closed).await;
        let seen = h.drain().await;
        assert_eq!(states(&seen), vec![(Idle, Closed)]);

        h.manager.disconnect();
        assert!(h.drain().await.is_empty());
        assert_eq!(h.manager.state(), Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_in_any_state_leaves_nothing_armed() {
        #[derive(Debug)]
        enum Before {
            Disabled,
            Exhausted,
            Negotiating,
        }

        for before in [Before::Disabled, Before::Exhausted, Before::Negotiating] {
            let mut _silent = None;
            let mut h = match before {
                Before::Disabled => {
                    let config = ClientConfig::builder()
                        .base_url("http://broker.test")
                        .enabled(false)
                        .build()
                        .unwrap();
                    start(config, Some("abc"))
                }
                Before::Exhausted => {
                    let h = start(config(), Some("abc"));
                    for _ in 0..6 {
                        h.transport.push(Outcome::Refuse("connection refused".into()));
                    }
                    h.wait_for(Closed).await;
                    h
                }
                Before::Negotiating => {
                    let mut h = start(config(), Some("abc"));
                    // Socket open, CONNECT never answered
                    _silent = Some(h.next_peer().await);
                    assert_eq!(h.manager.state(), Connecting);
                    h
                }
            };
            h.drain().await;
            let opened = h.transport.open_count();

            h.manager.disconnect();
            h.wait_for(Closed).await;

            sleep(Duration::from_secs(120)).await;
            assert_eq!(h.manager.state(), Closed, "{before:?}");
            assert_eq!(h.transport.open_count(), opened, "{before:?}");
            let revived = states(&h.drain().await)
                .into_iter()
                .any(|(_, to)| matches!(to, Connecting | Open));
            assert!(!revived, "{before:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_generic_error_frame_is_transient() {
        let mut h = start(config(), Some("abc"));

        // Refused during negotiation
        let mut peer = h.next_peer().await;
        peer.reject("Broker restarting").await;
        let t0 = Instant::now();
        let peer = h.open().await;
        assert_eq!(t0.elapsed(), Duration::from_secs(5));

        // Raised while open
        let t1 = Instant::now();
        peer.send_frame(&Frame::new(Command::Error).with_header("message", "Broker restarting"));
        let _peer = h.open().await;
        assert_eq!(t1.elapsed(), Duration::from_secs(5));

        let metrics = h.manager.metrics();
        assert_eq!(metrics.auth_failures(), 0);
        assert_eq!(metrics.reconnects_scheduled(), 2);

        let seen = h.drain().await;
        let protocol_errors = seen
            .iter()
            .filter(|s| match s {
                Seen::Disconnected(DisconnectReason::ProtocolError(m)) => {
                    m.contains("Broker restarting")
                }
                _ => false,
            })
            .count();
        assert_eq!(protocol_errors, 2);
        assert!(states(&seen).contains(&(Open, Connecting)));
    }

    struct SlowHandler;

    impl SubscriptionHandler for SlowHandler {
        type Message = Ping;

        async fn on_message(&self, _message: InboundMessage<Ping>) {
            sleep(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_period_under_message_load() {
        let (transport, mut peers) = MockTransport::new();
        let _manager =
            ConnectionManager::new(config(), transport, tokens(Some("abc")), SlowHandler);

        let mut peer = peers.recv().await.unwrap();
        peer.accept().await;
        assert_eq!(peer.next_frame().await.unwrap().command, Command::Subscribe);
        assert_eq!(peer.next_frame().await.unwrap().command, Command::Send);

        // A minute of back-to-back messages
        let t0 = Instant::now();
        for n in 0..60 {
            peer.deliver(SUBSCRIPTION_ID, "/topic/user-activity", &format!(r#"{{"n":{n}}}"#));
        }

        let second = peer.next_frame().await.unwrap();
        assert_eq!(second.command, Command::Send);
        assert_eq!(second.header("destination"), Some("/app/user/heartbeat"));
        assert!(t0.elapsed() < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_tears_down_and_enable_reconnects() {
        let mut h = start(config(), Some("abc"));
        let mut peer = h.open().await;

        h.manager.set_enabled(false);
        assert!(!h.manager.is_enabled());

        // Broker never confirms; close_timeout bounds the teardown
        let unsubscribe = peer.next_non_send().await.unwrap();
        assert_eq!(unsubscribe.command, Command::Unsubscribe);
        h.wait_for(Closed).await;

        // Disabled: connect() does nothing, nothing reconnects
        h.manager.connect();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.open_count(), 1);

        let seen = h.drain().await;
        assert!(seen.contains(&Seen::Disconnected(DisconnectReason::Disabled)));

        h.manager.set_enabled(true);
        let _peer = h.open().await;
        assert_eq!(h.transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_in_order_and_failures_isolated() {
        let mut h = start(config(), Some("abc"));
        let peer = h.open().await;
        h.drain().await;

        let topic = "/topic/user-activity";
        peer.deliver(SUBSCRIPTION_ID, topic, r#"{"n":1}"#);
        peer.deliver(SUBSCRIPTION_ID, topic, "not json");
        peer.deliver(SUBSCRIPTION_ID, topic, r#"{"n":13}"#);
        peer.deliver(SUBSCRIPTION_ID, topic, r#"{"n":2}"#);

        let seen = h.drain().await;
        assert_eq!(seen, vec![Seen::Message(1), Seen::Message(2)]);
        assert_eq!(h.manager.state(), Open);

        let metrics = h.manager.metrics();
        assert_eq!(metrics.messages_received(), 4);
        assert_eq!(metrics.messages_dispatched(), 2);
        assert_eq!(metrics.decode_failures(), 1);
        assert_eq!(metrics.handler_panics(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_handler_replaces_callbacks() {
        let mut h = start(config(), Some("abc"));
        let peer = h.open().await;
        h.drain().await;

        let (replacement, mut replaced_seen) = RecordingHandler::new();
        h.manager.set_handler(replacement);

        peer.deliver(SUBSCRIPTION_ID, "/topic/user-activity", r#"{"n":5}"#);
        assert!(h.drain().await.is_empty());
        assert_eq!(replaced_seen.recv().await, Some(Seen::Message(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_during_closing_runs_after_teardown() {
        let mut h = start(config(), Some("abc"));
        let mut peer = h.open().await;
        h.drain().await;

        h.manager.disconnect();
        h.manager.connect();

        peer.next_non_send().await.unwrap();
        let disconnect = peer.next_frame().await.unwrap();
        peer.send_frame(&receipt_for(&disconnect));

        let _peer = h.open().await;
        let seen = h.drain().await;
        assert_eq!(
            states(&seen),
            vec![
                (Open, Closing),
                (Closing, Closed),
                (Closed, Connecting),
                (Connecting, Open)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_config_does_not_connect() {
        let config = ClientConfig::builder()
            .base_url("http://broker.test")
            .enabled(false)
            .build()
            .unwrap();
        let mut h = start(config, Some("abc"));

        h.manager.connect();
        h.drain().await;
        assert_eq!(h.transport.open_count(), 0);
        assert_eq!(h.manager.state(), Idle);

        h.manager.set_enabled(true);
        let _peer = h.open().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_transient() {
        let mut h = start(config(), Some("abc"));

        // Broker accepts the socket but never answers CONNECT
        let _silent = h.next_peer().await;
        let t0 = Instant::now();
        let _peer = h.open().await;
        // 10s negotiation timeout, then the 5s first retry
        assert_eq!(t0.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_driver() {
        let mut h = start(config(), Some("abc"));
        let mut peer = h.open().await;

        let responder = tokio::spawn(async move {
            while let Some(frame) = peer.next_frame().await {
                if frame.command == Command::Disconnect {
                    peer.send_frame(&receipt_for(&frame));
                }
            }
        });

        h.manager.shutdown().await;
        assert_eq!(h.manager.state(), Closed);
        responder.await.unwrap();

        // Driver is gone; commands are dropped
        h.manager.connect();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.open_count(), 1);
    }
}
