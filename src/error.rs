//! Error types for the client.

use thiserror::Error;

/// The result type used throughout the crate.
pub type ClientResult<T> = Result<T, ClientError>;

/// Well-known server error codes with protocol-level meaning.
pub mod code {
    /// The connection or subscription token has expired; the client should
    /// obtain a fresh token and retry once.
    pub const TOKEN_EXPIRED: u32 = 109;
    /// The requested feature is not available for the channel.
    pub const NOT_AVAILABLE: u32 = 108;
}

/// Error type for all client operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Error sent by the server in a reply, returned to the caller verbatim.
    #[error("server error: code={code}, message={message}")]
    Protocol { code: u32, message: String },

    /// Dial, TLS, read or write failure on the underlying transport.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// No reply arrived within the configured read timeout.
    #[error("operation timed out")]
    Timeout,

    /// The transport was torn down while the operation was in flight.
    #[error("client disconnected")]
    Disconnected,

    /// The client was closed; no further operations are possible.
    #[error("client closed")]
    Closed,

    /// A subscription already exists for the channel.
    #[error("duplicate subscription to channel {channel}")]
    DuplicateSubscription { channel: String },

    /// Invalid configuration or a missing required handler.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Failure encoding a command or decoding a reply or push.
    #[error("codec error: {message}")]
    Codec { message: String },
}

impl ClientError {
    /// Create a protocol error from a server-sent code and message.
    pub fn protocol(code: u32, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Whether this is the server telling us a token expired (code 109).
    pub fn is_token_expired(&self) -> bool {
        matches!(self, Self::Protocol { code, .. } if *code == code::TOKEN_EXPIRED)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::codec(e.to_string())
    }
}

impl From<prost::DecodeError> for ClientError {
    fn from(e: prost::DecodeError) -> Self {
        Self::codec(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::transport(e.to_string())
    }
}
