use crate::error::Error;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::{HeaderName, HeaderValue};
use std::future::Future;
use std::pin::Pin;
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
};
use tracing::{debug, trace};
use url::Url;

/// Sub-protocols offered during the WebSocket upgrade
const STOMP_SUBPROTOCOLS: &str = "v12.stomp, v11.stomp, v10.stomp";

/// Outbound half of a transport session
pub type OutboundSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half of a transport session. The stream ends when the peer closes.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<String, Error>> + Send>>;

/// A duplex, message-oriented connection to the broker.
///
/// Dropping both halves closes the connection.
pub struct TransportSession {
    pub outbound: OutboundSink,
    pub inbound: InboundStream,
}

impl TransportSession {
    pub fn new(outbound: OutboundSink, inbound: InboundStream) -> Self {
        Self { outbound, inbound }
    }
}

/// Opens transport sessions.
///
/// The manager calls `open` once per connection attempt with the fully built
/// endpoint URL (token included).
pub trait Transport: Send + Sync + 'static {
    fn open(&self, url: &Url) -> impl Future<Output = Result<TransportSession, Error>> + Send;
}

/// Replace the `token` query parameter with `***` for logging.
pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();

    if pairs.is_empty() {
        return redacted.to_string();
    }

    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

/// WebSocket transport backed by tokio-tungstenite.
///
/// By default the upgrade request offers the STOMP sub-protocols. Brokers
/// that do not echo one back fail the handshake; use [`WsTransport::bare`]
/// for those.
#[derive(Debug, Clone)]
pub struct WsTransport {
    /// Extra headers for the upgrade request
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self {
            headers: vec![(
                http::header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(STOMP_SUBPROTOCOLS),
            )],
        }
    }
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// No sub-protocol offer, no extra headers
    pub fn bare() -> Self {
        Self {
            headers: Vec::new(),
        }
    }

    /// Add a header to every upgrade request
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }
}

impl Transport for WsTransport {
    async fn open(&self, url: &Url) -> Result<TransportSession, Error> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::transport(format!("Invalid WebSocket request: {}", e)))?;

        for (name, value) in &self.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }

        debug!("Opening WebSocket to {}", redact_url(url));

        // Nagle off: heartbeats and presence updates are tiny
        let (ws_stream, response) = connect_async_tls_with_config(request, None, true, None)
            .await
            .map_err(Error::WebSocket)?;

        trace!(
            "WebSocket upgraded (status={}, protocol={:?})",
            response.status(),
            response.headers().get(http::header::SEC_WEBSOCKET_PROTOCOL)
        );

        let (write, read) = ws_stream.split();

        let outbound = write
            .sink_map_err(Error::WebSocket)
            .with(|text: String| async move { Ok::<_, Error>(Message::Text(text)) });

        let inbound = read.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => Some(
                    String::from_utf8(data)
                        .map_err(|e| Error::transport(format!("Non UTF-8 binary frame: {}", e))),
                ),
                // Ping/pong are answered by tungstenite; close ends the stream
                Ok(_) => None,
                Err(e) => Some(Err(Error::WebSocket(e))),
            }
        });

        Ok(TransportSession::new(Box::pin(outbound), Box::pin(inbound)))
    }
}
