//! Client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

use crate::backoff::{BackoffStrategy, ExponentialBackoff};
use crate::error::{ClientError, ClientResult};
use crate::events::{ConnectionTokenEvent, PrivateSubEvent};

/// Provider called to obtain or refresh the connection token.
pub type ConnectionTokenFn =
    Arc<dyn Fn(ConnectionTokenEvent) -> ClientResult<String> + Send + Sync>;

/// Provider called to obtain or refresh a private-channel subscription token.
pub type SubscriptionTokenFn = Arc<dyn Fn(PrivateSubEvent) -> ClientResult<String> + Send + Sync>;

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone)]
pub struct Config {
    /// Token for connection authentication.
    pub token: String,
    /// Arbitrary payload sent in the connect command. Must be valid JSON
    /// when using the textual flavor.
    pub data: Vec<u8>,
    /// Client name sent in the connect command. This semantically represents
    /// an environment the client connects from, not an individual user.
    pub name: String,
    /// Application-specific client version sent in the connect command.
    pub version: String,
    /// How long to wait for a reply to any request-bearing command.
    pub read_timeout: Duration,
    /// Deadline for a single transport write.
    pub write_timeout: Duration,
    /// Deadline for the WebSocket handshake.
    pub handshake_timeout: Duration,
    /// How long the connection may stay idle before the client pings.
    /// The ping reply itself is timed against `read_timeout` like any
    /// other request.
    pub ping_interval: Duration,
    /// Maximum tolerated delay of a server-initiated ping.
    pub max_server_ping_delay: Duration,
    /// Channels starting with this prefix require a per-subscription token.
    pub private_channel_prefix: String,
    /// Extra headers for the WebSocket upgrade request (cookies included).
    pub headers: HeaderMap,
    /// Delay policy for reconnect attempts.
    pub backoff: Arc<dyn BackoffStrategy>,
    /// Called to get or refresh the connection token.
    pub get_connection_token: Option<ConnectionTokenFn>,
    /// Called to get or refresh a private-channel subscription token.
    pub get_subscription_token: Option<SubscriptionTokenFn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            data: Vec::new(),
            name: "rust".to_string(),
            version: String::new(),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            ping_interval: Duration::from_secs(25),
            max_server_ping_delay: Duration::from_secs(10),
            private_channel_prefix: "$".to_string(),
            headers: HeaderMap::new(),
            backoff: Arc::new(ExponentialBackoff::default()),
            get_connection_token: None,
            get_subscription_token: None,
        }
    }
}

impl Config {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial connection token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Set the connect-command payload.
    #[must_use]
    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Set the client name sent in the connect command.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the client version sent in the connect command.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the per-request read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the transport write deadline.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the WebSocket handshake deadline.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the idle interval after which the client pings.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the tolerance for server-initiated pings.
    #[must_use]
    pub fn max_server_ping_delay(mut self, delay: Duration) -> Self {
        self.max_server_ping_delay = delay;
        self
    }

    /// Set the private channel prefix.
    #[must_use]
    pub fn private_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.private_channel_prefix = prefix.into();
        self
    }

    /// Set the reconnect backoff strategy.
    #[must_use]
    pub fn backoff(mut self, backoff: impl BackoffStrategy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Set the connection token provider.
    #[must_use]
    pub fn get_connection_token(
        mut self,
        f: impl Fn(ConnectionTokenEvent) -> ClientResult<String> + Send + Sync + 'static,
    ) -> Self {
        self.get_connection_token = Some(Arc::new(f));
        self
    }

    /// Set the subscription token provider.
    #[must_use]
    pub fn get_subscription_token(
        mut self,
        f: impl Fn(PrivateSubEvent) -> ClientResult<String> + Send + Sync + 'static,
    ) -> Self {
        self.get_subscription_token = Some(Arc::new(f));
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ClientResult<()> {
        if self.read_timeout.is_zero() {
            return Err(ClientError::config("Read timeout must be > 0"));
        }
        if self.write_timeout.is_zero() {
            return Err(ClientError::config("Write timeout must be > 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ClientError::config("Handshake timeout must be > 0"));
        }
        if self.ping_interval.is_zero() {
            return Err(ClientError::config("Ping interval must be > 0"));
        }
        if self.max_server_ping_delay.is_zero() {
            return Err(ClientError::config("Max server ping delay must be > 0"));
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("max_server_ping_delay", &self.max_server_ping_delay)
            .field("private_channel_prefix", &self.private_channel_prefix)
            .finish_non_exhaustive()
    }
}
