//! Connection-level events and the handler registry.
//!
//! Handlers are plain closures stored in an [`EventHub`] and invoked
//! synchronously from the task that produced the event (the reader loop or
//! the calling task). Long-running work must be offloaded by the user.

use std::sync::{Arc, RwLock};

use crate::error::ClientError;
use crate::protocol::{ClientInfo, Publication};

/// Fired once the connection is established and authenticated.
#[derive(Clone, Debug)]
pub struct ConnectEvent {
    /// Server-assigned identifier of this connection.
    pub client_id: String,
    /// Server version advertised in the connect reply.
    pub version: String,
    /// Arbitrary payload the server attached to the connect reply.
    pub data: Vec<u8>,
}

/// Fired once when a live connection is torn down.
#[derive(Clone, Debug)]
pub struct DisconnectEvent {
    pub reason: String,
    /// Whether the client is going to reconnect automatically.
    pub reconnect: bool,
}

/// Fired on asynchronous errors that have no originating caller to return to.
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub error: ClientError,
}

/// Fired for server messages sent outside any channel.
#[derive(Clone, Debug)]
pub struct MessageEvent {
    pub data: Vec<u8>,
}

/// Fired per channel the server subscribed this client to.
#[derive(Clone, Debug)]
pub struct ServerSubscribeEvent {
    pub channel: String,
    /// True iff the channel was present in the previous session's
    /// server-subscription set.
    pub resubscribed: bool,
    /// True iff the server recovered missed publications for the channel.
    pub recovered: bool,
}

/// Publication on a server-side subscription.
#[derive(Clone, Debug)]
pub struct ServerPublishEvent {
    pub channel: String,
    pub publication: Publication,
}

#[derive(Clone, Debug)]
pub struct ServerJoinEvent {
    pub channel: String,
    pub info: ClientInfo,
}

#[derive(Clone, Debug)]
pub struct ServerLeaveEvent {
    pub channel: String,
    pub info: ClientInfo,
}

#[derive(Clone, Debug)]
pub struct ServerUnsubscribeEvent {
    pub channel: String,
}

/// Context passed to the connection token provider.
#[derive(Clone, Debug, Default)]
pub struct ConnectionTokenEvent {}

/// Context passed to the private-channel subscription token provider.
#[derive(Clone, Debug)]
pub struct PrivateSubEvent {
    pub client_id: String,
    pub channel: String,
}

pub(crate) type Handler<E> = Arc<dyn Fn(E) + Send + Sync>;
pub(crate) type TokenHandler<E> = Arc<dyn Fn(E) -> Result<String, ClientError> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    on_connect: Option<Handler<ConnectEvent>>,
    on_disconnect: Option<Handler<DisconnectEvent>>,
    on_error: Option<Handler<ErrorEvent>>,
    on_message: Option<Handler<MessageEvent>>,
    on_server_subscribe: Option<Handler<ServerSubscribeEvent>>,
    on_server_publish: Option<Handler<ServerPublishEvent>>,
    on_server_join: Option<Handler<ServerJoinEvent>>,
    on_server_leave: Option<Handler<ServerLeaveEvent>>,
    on_server_unsubscribe: Option<Handler<ServerUnsubscribeEvent>>,
    on_refresh: Option<TokenHandler<ConnectionTokenEvent>>,
    on_private_sub: Option<TokenHandler<PrivateSubEvent>>,
}

/// Registry of optional connection-level handlers.
#[derive(Default)]
pub(crate) struct EventHub {
    inner: RwLock<Handlers>,
}

macro_rules! setter {
    ($set:ident, $field:ident, $event:ty) => {
        pub(crate) fn $set(&self, f: impl Fn($event) + Send + Sync + 'static) {
            self.inner.write().unwrap().$field = Some(Arc::new(f));
        }
    };
}

macro_rules! emitter {
    ($emit:ident, $field:ident, $event:ty) => {
        pub(crate) fn $emit(&self, event: $event) {
            let handler = self.inner.read().unwrap().$field.clone();
            if let Some(handler) = handler {
                handler(event);
            }
        }
    };
}

impl EventHub {
    setter!(set_on_connect, on_connect, ConnectEvent);
    setter!(set_on_disconnect, on_disconnect, DisconnectEvent);
    setter!(set_on_error, on_error, ErrorEvent);
    setter!(set_on_message, on_message, MessageEvent);
    setter!(set_on_server_subscribe, on_server_subscribe, ServerSubscribeEvent);
    setter!(set_on_server_publish, on_server_publish, ServerPublishEvent);
    setter!(set_on_server_join, on_server_join, ServerJoinEvent);
    setter!(set_on_server_leave, on_server_leave, ServerLeaveEvent);
    setter!(set_on_server_unsubscribe, on_server_unsubscribe, ServerUnsubscribeEvent);

    emitter!(emit_connect, on_connect, ConnectEvent);
    emitter!(emit_disconnect, on_disconnect, DisconnectEvent);
    emitter!(emit_error, on_error, ErrorEvent);
    emitter!(emit_message, on_message, MessageEvent);
    emitter!(emit_server_subscribe, on_server_subscribe, ServerSubscribeEvent);
    emitter!(emit_server_publish, on_server_publish, ServerPublishEvent);
    emitter!(emit_server_join, on_server_join, ServerJoinEvent);
    emitter!(emit_server_leave, on_server_leave, ServerLeaveEvent);
    emitter!(emit_server_unsubscribe, on_server_unsubscribe, ServerUnsubscribeEvent);

    pub(crate) fn set_on_refresh(
        &self,
        f: impl Fn(ConnectionTokenEvent) -> Result<String, ClientError> + Send + Sync + 'static,
    ) {
        self.inner.write().unwrap().on_refresh = Some(Arc::new(f));
    }

    pub(crate) fn set_on_private_sub(
        &self,
        f: impl Fn(PrivateSubEvent) -> Result<String, ClientError> + Send + Sync + 'static,
    ) {
        self.inner.write().unwrap().on_private_sub = Some(Arc::new(f));
    }

    pub(crate) fn refresh_handler(&self) -> Option<TokenHandler<ConnectionTokenEvent>> {
        self.inner.read().unwrap().on_refresh.clone()
    }

    pub(crate) fn private_sub_handler(&self) -> Option<TokenHandler<PrivateSubEvent>> {
        self.inner.read().unwrap().on_private_sub.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_emit_without_handler_is_noop() {
        let hub = EventHub::default();
        hub.emit_connect(ConnectEvent {
            client_id: "c1".to_string(),
            version: String::new(),
            data: Vec::new(),
        });
    }

    #[test]
    fn test_handler_fires_once_per_event() {
        let hub = EventHub::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        hub.set_on_disconnect(move |e| {
            assert!(!e.reconnect);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit_disconnect(DisconnectEvent {
            reason: "clean disconnect".to_string(),
            reconnect: false,
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_token_handler_returns_value() {
        let hub = EventHub::default();
        hub.set_on_refresh(|_| Ok("fresh-token".to_string()));
        let handler = hub.refresh_handler().expect("handler set");
        assert_eq!(
            handler(ConnectionTokenEvent::default()).unwrap(),
            "fresh-token"
        );
    }
}
