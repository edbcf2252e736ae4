use crate::token::AuthToken;
use std::time::Duration;
use url::Url;

/// Environment variable holding the broker base URL
pub const ENV_BASE_URL: &str = "PRESENCE_WS_BASE_URL";
/// Environment variable overriding the endpoint path
pub const ENV_PATH: &str = "PRESENCE_WS_PATH";
/// Environment variable overriding the application heartbeat interval (ms)
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "PRESENCE_HEARTBEAT_INTERVAL_MS";
/// Environment variable overriding the reconnect attempt cap
pub const ENV_RECONNECT_MAX_ATTEMPTS: &str = "PRESENCE_RECONNECT_MAX_ATTEMPTS";
/// Environment variable overriding the reconnect base delay (ms)
pub const ENV_RECONNECT_BASE_DELAY_MS: &str = "PRESENCE_RECONNECT_BASE_DELAY_MS";

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Label used as the log prefix
    pub name: String,
    /// Where to connect and how to find the token
    pub endpoint: EndpointConfig,
    /// STOMP session settings
    pub stomp: StompConfig,
    /// Application-level heartbeat settings
    pub heartbeat: HeartbeatConfig,
    /// Reconnection settings
    pub reconnect: ReconnectConfig,
    /// Whether the manager should hold a connection at all
    pub enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "presence".to_string(),
            endpoint: EndpointConfig::default(),
            stomp: StompConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            enabled: true,
        }
    }
}

impl ClientConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Build a configuration from `PRESENCE_*` environment variables.
    ///
    /// `PRESENCE_WS_BASE_URL` is required; everything else falls back to the
    /// defaults.
    pub fn from_env() -> Result<ClientConfig, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<ClientConfig, ConfigError> {
        let base_url = lookup(ENV_BASE_URL)
            .ok_or_else(|| ConfigError::InvalidEndpoint(format!("{} is not set", ENV_BASE_URL)))?;

        let mut builder = ClientConfig::builder().base_url(base_url);

        if let Some(path) = lookup(ENV_PATH) {
            builder = builder.path(path);
        }
        if let Some(ms) = lookup(ENV_HEARTBEAT_INTERVAL_MS) {
            builder = builder.heartbeat_interval(Duration::from_millis(parse_env(
                ENV_HEARTBEAT_INTERVAL_MS,
                &ms,
            )?));
        }
        if let Some(n) = lookup(ENV_RECONNECT_MAX_ATTEMPTS) {
            builder = builder.max_reconnect_attempts(parse_env(ENV_RECONNECT_MAX_ATTEMPTS, &n)?);
        }
        if let Some(ms) = lookup(ENV_RECONNECT_BASE_DELAY_MS) {
            builder = builder.reconnect_base_delay(Duration::from_millis(parse_env(
                ENV_RECONNECT_BASE_DELAY_MS,
                &ms,
            )?));
        }

        builder.build()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv(format!("{}={:?}", key, value)))
}

/// Builder for ClientConfig
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the log label
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the broker base URL (`http(s)://` or `ws(s)://`)
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.endpoint.base_url = base_url.into();
        self
    }

    /// Set the endpoint path appended to the base URL
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.endpoint.path = path.into();
        self
    }

    /// Set the token store key
    pub fn token_key(mut self, key: impl Into<String>) -> Self {
        self.config.endpoint.token_key = key.into();
        self
    }

    /// Set endpoint configuration
    pub fn endpoint(mut self, config: EndpointConfig) -> Self {
        self.config.endpoint = config;
        self
    }

    /// Set STOMP configuration
    pub fn stomp(mut self, config: StompConfig) -> Self {
        self.config.stomp = config;
        self
    }

    /// Set the topic to subscribe to
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.stomp.topic = topic.into();
        self
    }

    /// Set the application heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat.interval = interval;
        self
    }

    /// Set reconnection configuration
    pub fn reconnect(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect = config;
        self
    }

    /// Set the maximum number of automatic reconnection attempts
    pub fn max_reconnect_attempts(mut self, max: u32) -> Self {
        self.config.reconnect.max_attempts = max;
        self
    }

    /// Set the reconnection base delay
    pub fn reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect.base_delay = delay;
        self
    }

    /// Enable or disable the manager
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let config = self.config;

        // Validate endpoint
        config.endpoint.base()?;

        // Validate destinations
        for (what, dest) in [
            ("topic", &config.stomp.topic),
            ("heartbeat_destination", &config.stomp.heartbeat_destination),
        ] {
            if !dest.starts_with('/') {
                return Err(ConfigError::InvalidStomp(format!(
                    "{} must start with '/': {:?}",
                    what, dest
                )));
            }
        }

        if config.stomp.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidStomp(
                "connect_timeout must be > 0".to_string(),
            ));
        }

        if config.stomp.max_frame_size == 0 {
            return Err(ConfigError::InvalidStomp(
                "max_frame_size cannot be 0".to_string(),
            ));
        }

        // Validate heartbeat
        if config.heartbeat.interval.is_zero() {
            return Err(ConfigError::InvalidHeartbeat(
                "interval must be > 0".to_string(),
            ));
        }

        // Validate reconnect
        if config.reconnect.base_delay.is_zero() {
            return Err(ConfigError::InvalidReconnect(
                "base_delay must be > 0".to_string(),
            ));
        }

        if let Backoff::Exponential {
            multiplier,
            max_delay,
            ..
        } = config.reconnect.backoff
        {
            if multiplier <= 0.0 {
                return Err(ConfigError::InvalidReconnect(
                    "multiplier must be > 0".to_string(),
                ));
            }
            if max_delay < config.reconnect.base_delay {
                return Err(ConfigError::InvalidReconnect(
                    "max_delay must be >= base_delay".to_string(),
                ));
            }
        }

        Ok(config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid endpoint configuration
    #[error("Invalid endpoint configuration: {0}")]
    InvalidEndpoint(String),
    /// Invalid STOMP configuration
    #[error("Invalid STOMP configuration: {0}")]
    InvalidStomp(String),
    /// Invalid heartbeat configuration
    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
    /// Invalid reconnect configuration
    #[error("Invalid reconnect configuration: {0}")]
    InvalidReconnect(String),
    /// Unparseable environment variable
    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

/// Endpoint and credential lookup configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Base URL of the broker (`http`, `https`, `ws` or `wss`)
    pub base_url: String,
    /// Path of the WebSocket endpoint below the base URL
    pub path: String,
    /// Key under which the bearer token is read from the token store
    pub token_key: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            path: "/ws".to_string(),
            token_key: "token".to_string(),
        }
    }
}

impl EndpointConfig {
    /// Parse the base URL and map `http`/`https` onto `ws`/`wss`.
    fn base(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(self.base_url.trim())
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{}: {}", self.base_url, e)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConfigError::InvalidEndpoint(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };
        if url.set_scheme(scheme).is_err() || url.host_str().is_none() {
            return Err(ConfigError::InvalidEndpoint(format!(
                "no host in {}",
                self.base_url
            )));
        }
        Ok(url)
    }

    /// Build `{base}{path}?token={token}`.
    pub fn url_for(&self, token: &AuthToken) -> Result<Url, ConfigError> {
        let mut url = self.base()?;

        let base_path = url.path().trim_end_matches('/').to_string();
        let path = self.path.trim_start_matches('/');
        url.set_path(&format!("{}/{}", base_path, path));
        url.query_pairs_mut()
            .clear()
            .append_pair("token", token.expose());

        Ok(url)
    }
}

/// STOMP session configuration
#[derive(Debug, Clone)]
pub struct StompConfig {
    /// Topic subscribed to after every negotiation
    pub topic: String,
    /// Destination for application heartbeats
    pub heartbeat_destination: String,
    /// Framing-layer heart-beat we offer to send
    pub heartbeat_outgoing: Duration,
    /// Framing-layer heart-beat we ask to receive
    pub heartbeat_incoming: Duration,
    /// Timeout for opening the transport and completing CONNECT/CONNECTED
    pub connect_timeout: Duration,
    /// Upper bound on the graceful UNSUBSCRIBE/DISCONNECT exchange
    pub close_timeout: Duration,
    /// Largest inbound frame accepted
    pub max_frame_size: usize,
}

impl Default for StompConfig {
    fn default() -> Self {
        Self {
            topic: "/topic/user-activity".to_string(),
            heartbeat_destination: "/app/user/heartbeat".to_string(),
            heartbeat_outgoing: Duration::from_millis(4000),
            heartbeat_incoming: Duration::from_millis(4000),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            max_frame_size: 1024 * 1024,
        }
    }
}

/// Application heartbeat configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Period between heartbeat payloads while open
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Delay curve between reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * multiplier^(attempt - 1)`, capped, optionally full-jittered
    Exponential {
        multiplier: f64,
        max_delay: Duration,
        jitter: bool,
    },
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Automatic attempts per failure episode
    pub max_attempts: u32,
    /// Delay unit for the backoff curve
    pub base_delay: Duration,
    /// Backoff curve
    pub backoff: Backoff,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            backoff: Backoff::Linear,
        }
    }
}

impl ReconnectConfig {
    /// Calculate the delay for a given attempt number (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential {
                multiplier,
                max_delay,
                jitter,
            } => {
                let base_delay = self.base_delay.as_millis() as f64
                    * multiplier.powi(attempt as i32 - 1);
                let capped_delay = base_delay.min(max_delay.as_millis() as f64);

                if jitter {
                    // Full jitter: random value between 0 and capped_delay
                    let jittered = rand::random::<f64>() * capped_delay;
                    Duration::from_millis(jittered as u64)
                } else {
                    Duration::from_millis(capped_delay as u64)
                }
            }
        }
    }
}
