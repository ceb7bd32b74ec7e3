//! Pure encode/decode facade over the two wire flavors.
//!
//! The facade is stateless beyond the [`Flavor`] tag: the textual flavor
//! goes through serde_json, the binary flavor through prost. Everything
//! above this module works with decoded [`protocol`](crate::protocol) types
//! and never looks at bytes.

use prost::Message as _;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ClientError, ClientResult};
use crate::protocol::{Command, Push, Reply};

/// Wire flavor of a connection, negotiated through the endpoint URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    /// Textual frames (JSON).
    Json,
    /// Binary frames (protobuf).
    Protobuf,
}

impl Flavor {
    /// The query marker selecting the binary flavor.
    pub(crate) const BINARY_MARKER: (&'static str, &'static str) = ("format", "protobuf");

    pub(crate) fn from_url(url: &url::Url) -> Self {
        let (key, value) = Self::BINARY_MARKER;
        if url.query_pairs().any(|(k, v)| k == key && v == value) {
            Self::Protobuf
        } else {
            Self::Json
        }
    }
}

pub(crate) fn encode_command(flavor: Flavor, command: &Command) -> ClientResult<Vec<u8>> {
    match flavor {
        Flavor::Json => Ok(serde_json::to_vec(command)?),
        Flavor::Protobuf => Ok(command.encode_to_vec()),
    }
}

pub(crate) fn decode_reply(flavor: Flavor, frame: &[u8]) -> ClientResult<Reply> {
    match flavor {
        Flavor::Json => Ok(serde_json::from_slice(frame)?),
        Flavor::Protobuf => Ok(Reply::decode(frame)?),
    }
}

pub(crate) fn decode_push(flavor: Flavor, data: &[u8]) -> ClientResult<Push> {
    decode::<Push>(flavor, data)
}

/// Encode per-method params for embedding into a [`Command`].
pub(crate) fn encode_params<T>(flavor: Flavor, params: &T) -> ClientResult<Vec<u8>>
where
    T: Serialize + prost::Message,
{
    match flavor {
        Flavor::Json => Ok(serde_json::to_vec(params)?),
        Flavor::Protobuf => Ok(params.encode_to_vec()),
    }
}

/// Decode a per-method result or a typed push body. An absent body decodes
/// to the type's zero value, matching the binary flavor's semantics.
pub(crate) fn decode<T>(flavor: Flavor, data: &[u8]) -> ClientResult<T>
where
    T: DeserializeOwned + prost::Message + Default,
{
    if data.is_empty() {
        return Ok(T::default());
    }
    match flavor {
        Flavor::Json => Ok(serde_json::from_slice(data)?),
        Flavor::Protobuf => Ok(T::decode(data)?),
    }
}
