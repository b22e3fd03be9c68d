//! Transport abstraction traits for MQTTBuzz.
//!
//! These traits define the interface that every broker transport must provide,
//! allowing sessions to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Default MQTT keep-alive interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Default bound on a single connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a broker connection.
///
/// Doubles as the MQTT client identifier, so it must be unique per process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "mqttbuzz-{}-{:x}-{}",
            std::process::id(),
            timestamp,
            counter
        ))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Username/password pair presented to the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Broker username.
    pub username: String,
    /// Broker password.
    pub password: String,
}

impl Credentials {
    /// Create a credential pair.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Keep passwords out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Where and how to open a broker connection.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Optional credentials.
    pub credentials: Option<Credentials>,
    /// Keep-alive interval negotiated with the broker.
    pub keep_alive: Duration,
    /// Bound on the connect handshake.
    pub connect_timeout: Duration,
}

impl ConnectTarget {
    /// Create a target with no credentials and default timings.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Attach credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the keep-alive interval.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the connect handshake bound.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `host:port` form of the target.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A message delivered by the broker on a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
}

impl InboundMessage {
    /// Create a new inbound message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker could not be reached or refused the connection.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The connection attempt timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The connection dropped without being asked to.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Operation on a connection that is already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The subscription request could not be issued.
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A transport that can open broker connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to the target broker.
    ///
    /// Resolves once the broker has acknowledged the session, or fails with
    /// the broker/network error. Implementations make exactly one attempt.
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "mqtt", "memory").
    fn name(&self) -> &'static str;
}

/// An open broker connection.
#[async_trait]
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Subscribe to a topic.
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Receive the next message from the broker.
    ///
    /// Returns `None` if the broker closed the connection cleanly, and an
    /// error if it dropped for any other reason.
    async fn recv(&mut self) -> Result<Option<InboundMessage>, TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
