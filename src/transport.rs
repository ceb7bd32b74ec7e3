//! WebSocket transport adapter.
//!
//! Owns dialing, TLS, framed read/write and orderly close; nothing
//! WebSocket-specific leaks above this boundary. The read half decodes
//! frames into [`Reply`] values; a close frame sent by the server may carry
//! an advisory hint that is propagated into the client's disconnect routine.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::codec::{self, Flavor};
use crate::config::Config;
use crate::error::{ClientError, ClientResult};
use crate::protocol::Reply;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Why a connection went away, with the server's advice on reconnecting.
#[derive(Clone, Debug)]
pub(crate) struct Disconnect {
    pub reason: String,
    pub reconnect: bool,
}

impl Disconnect {
    pub(crate) fn new(reason: impl Into<String>, reconnect: bool) -> Self {
        Self {
            reason: reason.into(),
            reconnect,
        }
    }
}

impl Default for Disconnect {
    fn default() -> Self {
        Self::new("connection closed", true)
    }
}

/// Advisory hint servers embed in the close frame reason.
#[derive(Deserialize)]
struct CloseHint {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    reconnect: bool,
}

fn parse_close_hint(frame: Option<&CloseFrame<'_>>) -> Option<Disconnect> {
    let frame = frame?;
    let hint: CloseHint = serde_json::from_str(frame.reason.as_ref()).ok()?;
    Some(Disconnect::new(hint.reason, hint.reconnect))
}

/// The endpoint actually dialed: the binary flavor is negotiated through a
/// query marker, appended here when the caller selected it explicitly.
fn endpoint(url: &url::Url, flavor: Flavor) -> String {
    if flavor == Flavor::Protobuf && Flavor::from_url(url) != Flavor::Protobuf {
        let mut url = url.clone();
        let (key, value) = Flavor::BINARY_MARKER;
        url.query_pairs_mut().append_pair(key, value);
        return url.to_string();
    }
    url.to_string()
}

/// Write half of a live connection, shared by every sending task.
pub(crate) struct Transport {
    sink: tokio::sync::Mutex<WsSink>,
    flavor: Flavor,
}

/// Read half of a live connection, owned by the reader task.
pub(crate) struct TransportReader {
    stream: WsRead,
    flavor: Flavor,
}

/// Dial the endpoint and perform the WebSocket handshake.
pub(crate) async fn connect(
    url: &url::Url,
    flavor: Flavor,
    config: &Config,
) -> ClientResult<(Transport, TransportReader)> {
    let endpoint = endpoint(url, flavor);
    let mut request = endpoint.as_str().into_client_request()?;
    for (name, value) in &config.headers {
        request.headers_mut().append(name.clone(), value.clone());
    }

    debug!(url = %endpoint, ?flavor, "dialing");
    let handshake = tokio_tungstenite::connect_async(request);
    let (stream, _response) = tokio::time::timeout(config.handshake_timeout, handshake)
        .await
        .map_err(|_| ClientError::transport("handshake timed out"))??;

    let (sink, stream) = stream.split();
    Ok((
        Transport {
            sink: tokio::sync::Mutex::new(sink),
            flavor,
        },
        TransportReader { stream, flavor },
    ))
}

impl Transport {
    /// Send one encoded command, completing or failing within `timeout`.
    pub(crate) async fn write(&self, frame: Vec<u8>, timeout: Duration) -> ClientResult<()> {
        let message = match self.flavor {
            Flavor::Json => Message::Text(
                String::from_utf8(frame).map_err(|e| ClientError::codec(e.to_string()))?,
            ),
            Flavor::Protobuf => Message::Binary(frame),
        };
        let mut sink = self.sink.lock().await;
        tokio::time::timeout(timeout, sink.send(message))
            .await
            .map_err(|_| ClientError::transport("write timed out"))?
            .map_err(ClientError::from)
    }

    /// Orderly close; best effort.
    pub(crate) async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}

impl TransportReader {
    /// Block until exactly one decoded reply or push frame arrives.
    ///
    /// On failure the optional [`Disconnect`] carries the server's advisory
    /// hint when one was attached to the close frame.
    pub(crate) async fn read(&mut self) -> Result<Reply, (Option<Disconnect>, ClientError)> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) if self.flavor == Flavor::Json => {
                    return codec::decode_reply(self.flavor, text.as_bytes())
                        .map_err(|e| (None, e));
                }
                Some(Ok(Message::Binary(data))) if self.flavor == Flavor::Protobuf => {
                    return codec::decode_reply(self.flavor, &data).map_err(|e| (None, e));
                }
                Some(Ok(Message::Close(frame))) => {
                    let hint = parse_close_hint(frame.as_ref());
                    return Err((hint, ClientError::transport("connection closed by server")));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err((None, ClientError::from(e))),
                None => return Err((None, ClientError::transport("connection lost"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_hint_parsed_from_reason() {
        let frame = CloseFrame {
            code: 3000.into(),
            reason: r#"{"reason":"shutdown","reconnect":true}"#.into(),
        };
        let hint = parse_close_hint(Some(&frame)).expect("hint");
        assert_eq!(hint.reason, "shutdown");
        assert!(hint.reconnect);
    }

    #[test]
    fn test_close_without_hint_gives_none() {
        assert!(parse_close_hint(None).is_none());

        let frame = CloseFrame {
            code: 1000.into(),
            reason: "bye".into(),
        };
        assert!(parse_close_hint(Some(&frame)).is_none());
    }

    #[test]
    fn test_endpoint_appends_binary_marker_once() {
        let url = url::Url::parse("ws://host/connection").unwrap();
        let dialed = endpoint(&url, Flavor::Protobuf);
        assert!(dialed.contains("format=protobuf"));

        let url = url::Url::parse("ws://host/connection?format=protobuf").unwrap();
        let dialed = endpoint(&url, Flavor::Protobuf);
        assert_eq!(dialed.matches("format=protobuf").count(), 1);

        let url = url::Url::parse("ws://host/connection").unwrap();
        assert_eq!(endpoint(&url, Flavor::Json), "ws://host/connection");
    }
}
