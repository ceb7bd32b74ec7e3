//! Client core: connection state machine, reader loop, ping loop and the
//! reconnect scheduler.
//!
//! A [`Client`] is a cheap-clone handle over shared state. Each live
//! connection spawns one reader task; while connected a ping task and an
//! optional token-refresh task run alongside it. A single long-lived
//! reconnect task consumes a one-slot signal so at most one connect attempt
//! is ever in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::codec::{self, Flavor};
use crate::config::Config;
use crate::error::{ClientError, ClientResult};
use crate::events::{
    ConnectEvent, ConnectionTokenEvent, DisconnectEvent, ErrorEvent, EventHub, MessageEvent,
    PrivateSubEvent, ServerJoinEvent, ServerLeaveEvent, ServerPublishEvent, ServerSubscribeEvent,
    ServerUnsubscribeEvent,
};
use crate::protocol::{
    ClientInfo, Command, ConnectRequest, ConnectResult, HistoryRequest, HistoryResult, Join, Leave,
    Message, MethodType, PresenceRequest, PresenceResult, PresenceStatsRequest,
    PresenceStatsResult, Publication, PublishRequest, PublishResult, Push, PushType,
    RefreshRequest, RefreshResult, Reply, RpcRequest, RpcResult, SendRequest, SubRefreshRequest,
    SubRefreshResult, SubscribeRequest, Unsub,
};
use crate::registry::RequestRegistry;
use crate::subscription::Subscription;
use crate::transport::{self, Disconnect, TransportReader};

/// Connection lifecycle states. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Short presence information for a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PresenceStats {
    pub num_clients: u32,
    pub num_users: u32,
}

/// Bookkeeping for a channel the server subscribed this client to.
struct ServerSub {
    offset: u64,
    epoch: String,
    recoverable: bool,
}

struct ServerSubUpdate {
    channel: String,
    resubscribed: bool,
    recovered: bool,
    publications: Vec<Publication>,
}

struct CoreState {
    status: Status,
    client_id: String,
    token: String,
    connect_data: Vec<u8>,
    headers: HeaderMap,
    transport: Option<Arc<transport::Transport>>,
    /// Closing this signal stops the session's ping and refresh tasks.
    session: Option<watch::Sender<bool>>,
    /// Bumped on every install and teardown so tasks of a dead session
    /// cannot tear down its successor.
    session_epoch: u64,
    /// A connect attempt is between dial and its reply.
    connecting: bool,
    subs: HashMap<String, Subscription>,
    server_subs: HashMap<String, ServerSub>,
    reconnect: bool,
    reconnect_attempts: u32,
}

pub(crate) struct ClientInner {
    url: url::Url,
    flavor: Flavor,
    config: Config,
    command_id: AtomicU32,
    state: Mutex<CoreState>,
    requests: RequestRegistry,
    events: EventHub,
    reconnect_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
    /// Armed by the reader on every inbound frame; consumed by the ping loop.
    activity: Notify,
}

/// Handle to a client connection.
///
/// Cheap to clone; all clones share the same connection. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client, choosing the wire flavor by the URL's query marker
    /// (`format=protobuf` selects the binary flavor).
    pub fn new(url: &str, config: Config) -> ClientResult<Self> {
        Self::with_flavor(url, config, None)
    }

    /// Create a client speaking the textual flavor.
    pub fn json(url: &str, config: Config) -> ClientResult<Self> {
        Self::with_flavor(url, config, Some(Flavor::Json))
    }

    /// Create a client speaking the binary flavor. The query marker is
    /// appended to the dialed URL when missing.
    pub fn protobuf(url: &str, config: Config) -> ClientResult<Self> {
        Self::with_flavor(url, config, Some(Flavor::Protobuf))
    }

    fn with_flavor(url: &str, config: Config, flavor: Option<Flavor>) -> ClientResult<Self> {
        config.validate()?;
        let url = url::Url::parse(url)
            .map_err(|e| ClientError::config(format!("invalid endpoint URL: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::config(format!(
                "unsupported connection endpoint: {url}"
            )));
        }
        let flavor = flavor.unwrap_or_else(|| Flavor::from_url(&url));

        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            state: Mutex::new(CoreState {
                status: Status::Disconnected,
                client_id: String::new(),
                token: config.token.clone(),
                connect_data: config.data.clone(),
                headers: config.headers.clone(),
                transport: None,
                session: None,
                session_epoch: 0,
                connecting: false,
                subs: HashMap::new(),
                server_subs: HashMap::new(),
                reconnect: true,
                reconnect_attempts: 0,
            }),
            url,
            flavor,
            config,
            command_id: AtomicU32::new(0),
            requests: RequestRegistry::new(),
            events: EventHub::default(),
            reconnect_tx,
            shutdown_tx,
            activity: Notify::new(),
        });

        tokio::spawn(ClientInner::reconnect_loop(
            Arc::downgrade(&inner),
            reconnect_rx,
            shutdown_rx,
        ));

        Ok(Self { inner })
    }

    /// Current connection status.
    pub fn status(&self) -> Status {
        self.inner.state.lock().unwrap().status
    }

    /// Server-assigned connection identifier; non-empty only while connected.
    pub fn client_id(&self) -> String {
        self.inner.client_id()
    }

    /// Replace the connection token used by subsequent connects and refreshes.
    pub fn set_token(&self, token: impl Into<String>) {
        self.inner.state.lock().unwrap().token = token.into();
    }

    /// Replace the payload sent in the connect command.
    pub fn set_connect_data(&self, data: impl Into<Vec<u8>>) {
        self.inner.state.lock().unwrap().connect_data = data.into();
    }

    /// Upsert a header sent with the WebSocket upgrade request.
    pub fn set_header(&self, name: &str, value: &str) -> ClientResult<()> {
        let name = http::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::config(format!("invalid header name: {e}")))?;
        let value = http::header::HeaderValue::from_str(value)
            .map_err(|e| ClientError::config(format!("invalid header value: {e}")))?;
        self.inner.state.lock().unwrap().headers.insert(name, value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Dial the server and authenticate. On failure the client keeps
    /// reconnecting in the background with exponential backoff.
    pub async fn connect(&self) -> ClientResult<()> {
        self.inner.connect_inner(false).await
    }

    /// Tear down the connection without reconnecting. Idempotent.
    pub async fn disconnect(&self) -> ClientResult<()> {
        if self.inner.is_closed() {
            return Err(ClientError::Closed);
        }
        self.inner
            .handle_disconnect(None, Disconnect::new("clean disconnect", false))
            .await;
        Ok(())
    }

    /// Close the client forever. Every pending request resolves with
    /// [`ClientError::Closed`] and all subsequent operations fail.
    pub async fn close(&self) -> ClientResult<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        self.inner
            .handle_disconnect(None, Disconnect::new("clean disconnect", false))
            .await;
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.status == Status::Closed {
                return Ok(());
            }
            st.status = Status::Closed;
        }
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.requests.drain(|| ClientError::Closed);
        info!("client closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Channel-less operations
    // ------------------------------------------------------------------

    /// Send data to the server without waiting for a reply.
    pub async fn send(&self, data: impl Into<Vec<u8>>) -> ClientResult<()> {
        let params = codec::encode_params(
            self.inner.flavor,
            &SendRequest { data: data.into() },
        )?;
        self.inner.send_command(MethodType::Send, params).await
    }

    /// Call the unnamed server RPC handler.
    pub async fn rpc(&self, data: impl Into<Vec<u8>>) -> ClientResult<Vec<u8>> {
        self.named_rpc("", data).await
    }

    /// Call a named server RPC handler.
    pub async fn named_rpc(
        &self,
        method: &str,
        data: impl Into<Vec<u8>>,
    ) -> ClientResult<Vec<u8>> {
        let req = RpcRequest {
            data: data.into(),
            method: method.to_string(),
        };
        let res: RpcResult = self.inner.request(MethodType::Rpc, &req).await?;
        Ok(res.data)
    }

    // ------------------------------------------------------------------
    // Channel operations
    // ------------------------------------------------------------------

    /// Publish data into a channel.
    pub async fn publish(&self, channel: &str, data: impl Into<Vec<u8>>) -> ClientResult<()> {
        self.inner.publish_to(channel, data.into()).await
    }

    /// Fetch a channel's retained publication history.
    pub async fn history(&self, channel: &str) -> ClientResult<Vec<Publication>> {
        self.inner.history_of(channel).await
    }

    /// Fetch a channel's presence information.
    pub async fn presence(&self, channel: &str) -> ClientResult<HashMap<String, ClientInfo>> {
        self.inner.presence_of(channel).await
    }

    /// Fetch short presence statistics for a channel.
    pub async fn presence_stats(&self, channel: &str) -> ClientResult<PresenceStats> {
        self.inner.presence_stats_of(channel).await
    }

    /// Create a subscription on a channel. At most one subscription may
    /// exist per channel.
    pub fn new_subscription(&self, channel: &str) -> ClientResult<Subscription> {
        let mut st = self.inner.state.lock().unwrap();
        if st.status == Status::Closed {
            return Err(ClientError::Closed);
        }
        if st.subs.contains_key(channel) {
            return Err(ClientError::DuplicateSubscription {
                channel: channel.to_string(),
            });
        }
        let sub = Subscription::new(channel.to_string(), Arc::downgrade(&self.inner));
        st.subs.insert(channel.to_string(), sub.clone());
        Ok(sub)
    }

    // ------------------------------------------------------------------
    // Handler registration
    // ------------------------------------------------------------------

    pub fn on_connect(&self, f: impl Fn(ConnectEvent) + Send + Sync + 'static) {
        self.inner.events.set_on_connect(f);
    }

    pub fn on_disconnect(&self, f: impl Fn(DisconnectEvent) + Send + Sync + 'static) {
        self.inner.events.set_on_disconnect(f);
    }

    pub fn on_error(&self, f: impl Fn(ErrorEvent) + Send + Sync + 'static) {
        self.inner.events.set_on_error(f);
    }

    pub fn on_message(&self, f: impl Fn(MessageEvent) + Send + Sync + 'static) {
        self.inner.events.set_on_message(f);
    }

    /// Register the handler called to refresh an expired connection token.
    pub fn on_refresh(
        &self,
        f: impl Fn(ConnectionTokenEvent) -> ClientResult<String> + Send + Sync + 'static,
    ) {
        self.inner.events.set_on_refresh(f);
    }

    /// Register the handler providing tokens for private channels.
    pub fn on_private_sub(
        &self,
        f: impl Fn(PrivateSubEvent) -> ClientResult<String> + Send + Sync + 'static,
    ) {
        self.inner.events.set_on_private_sub(f);
    }

    pub fn on_server_subscribe(&self, f: impl Fn(ServerSubscribeEvent) + Send + Sync + 'static) {
        self.inner.events.set_on_server_subscribe(f);
    }

    pub fn on_server_publish(&self, f: impl Fn(ServerPublishEvent) + Send + Sync + 'static) {
        self.inner.events.set_on_server_publish(f);
    }

    pub fn on_server_join(&self, f: impl Fn(ServerJoinEvent) + Send + Sync + 'static) {
        self.inner.events.set_on_server_join(f);
    }

    pub fn on_server_leave(&self, f: impl Fn(ServerLeaveEvent) + Send + Sync + 'static) {
        self.inner.events.set_on_server_leave(f);
    }

    pub fn on_server_unsubscribe(
        &self,
        f: impl Fn(ServerUnsubscribeEvent) + Send + Sync + 'static,
    ) {
        self.inner.events.set_on_server_unsubscribe(f);
    }
}

impl ClientInner {
    pub(crate) fn is_connected(&self) -> bool {
        self.state.lock().unwrap().status == Status::Connected
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().status == Status::Closed
    }

    fn client_id(&self) -> String {
        self.state.lock().unwrap().client_id.clone()
    }

    /// Allocate a fresh nonzero command ID; wraps past `u32::MAX`, skipping 0.
    fn next_command_id(&self) -> u32 {
        loop {
            let id = self.command_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    fn emit_error(&self, error: ClientError) {
        warn!(error = %error, "client error");
        if self.is_closed() {
            return;
        }
        self.events.emit_error(ErrorEvent { error });
    }

    // ------------------------------------------------------------------
    // Connect path
    // ------------------------------------------------------------------

    async fn connect_inner(self: &Arc<Self>, is_reconnect: bool) -> ClientResult<()> {
        let effective_config = {
            let mut st = self.state.lock().unwrap();
            match st.status {
                Status::Closed => return Err(ClientError::Closed),
                Status::Connected | Status::Connecting => return Ok(()),
                Status::Disconnected if is_reconnect => return Ok(()),
                _ => {}
            }
            st.status = if is_reconnect {
                Status::Reconnecting
            } else {
                Status::Connecting
            };
            st.reconnect = true;
            st.connecting = true;
            let mut config = self.config.clone();
            config.headers = st.headers.clone();
            config
        };

        let dialed = transport::connect(&self.url, self.flavor, &effective_config).await;
        let (transport, reader) = match dialed {
            Ok(pair) => pair,
            Err(e) => {
                self.handle_disconnect(None, Disconnect::new("connect error", true))
                    .await;
                return Err(e);
            }
        };
        let transport = Arc::new(transport);

        let session_result = {
            let mut st = self.state.lock().unwrap();
            if st.status != Status::Connecting && st.status != Status::Reconnecting {
                None
            } else {
                let (session_tx, _) = watch::channel(false);
                st.session_epoch += 1;
                st.transport = Some(Arc::clone(&transport));
                st.session = Some(session_tx.clone());
                Some((st.session_epoch, session_tx))
            }
        };
        let (epoch, session_tx) = match session_result {
            Some(pair) => pair,
            None => {
                transport.close().await;
                return Ok(());
            }
        };

        tokio::spawn(Self::read_loop(Arc::downgrade(self), reader, epoch));

        let params = {
            let st = self.state.lock().unwrap();
            let mut req = ConnectRequest {
                token: st.token.clone(),
                data: st.connect_data.clone(),
                name: self.config.name.clone(),
                version: self.config.version.clone(),
                ..Default::default()
            };
            if is_reconnect {
                for (channel, server_sub) in &st.server_subs {
                    if !server_sub.recoverable {
                        continue;
                    }
                    req.subs.insert(
                        channel.clone(),
                        SubscribeRequest {
                            recover: true,
                            epoch: server_sub.epoch.clone(),
                            offset: server_sub.offset,
                            ..Default::default()
                        },
                    );
                }
            }
            req
        };

        let res = match self
            .request::<ConnectRequest, ConnectResult>(MethodType::Connect, &params)
            .await
        {
            Ok(res) => res,
            Err(e) => {
                if e.is_token_expired() {
                    // Refresh the token before the next reconnect attempt.
                    if let Err(refresh_err) = self.refresh_token() {
                        self.emit_error(refresh_err);
                    }
                }
                self.handle_disconnect(Some(epoch), Disconnect::new("connect error", true))
                    .await;
                return Err(e);
            }
        };

        let (prev_status, resume_subs, server_events) = {
            let mut st = self.state.lock().unwrap();
            if st.status != Status::Connecting && st.status != Status::Reconnecting {
                return Ok(());
            }
            let prev = st.status;
            st.status = Status::Connected;
            st.connecting = false;
            st.client_id = res.client.clone();
            st.reconnect_attempts = 0;

            let mut events = Vec::with_capacity(res.subs.len());
            for (channel, sub_res) in &res.subs {
                events.push(ServerSubUpdate {
                    channel: channel.clone(),
                    resubscribed: st.server_subs.contains_key(channel),
                    recovered: sub_res.recovered,
                    publications: sub_res.publications.clone(),
                });
            }
            st.server_subs = res
                .subs
                .iter()
                .map(|(channel, r)| {
                    (
                        channel.clone(),
                        ServerSub {
                            offset: r.offset,
                            epoch: r.epoch.clone(),
                            recoverable: r.recoverable,
                        },
                    )
                })
                .collect();

            let resume: Vec<Subscription> = st.subs.values().cloned().collect();
            (prev, resume, events)
        };

        if res.expires {
            self.spawn_refresh_timer(res.ttl, &session_tx);
        }

        if prev_status != Status::Connected {
            info!(client_id = %res.client, "connected");
            self.events.emit_connect(ConnectEvent {
                client_id: res.client.clone(),
                version: res.version.clone(),
                data: res.data.clone(),
            });
        }

        for update in server_events {
            self.events.emit_server_subscribe(ServerSubscribeEvent {
                channel: update.channel.clone(),
                resubscribed: update.resubscribed,
                recovered: update.recovered,
            });
            for publication in update.publications {
                self.apply_server_publication(&update.channel, publication);
            }
        }

        for sub in resume_subs {
            sub.resume();
        }

        self.spawn_ping_loop(epoch, &session_tx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Disconnect path
    // ------------------------------------------------------------------

    /// Tear down the current session. `epoch` restricts the teardown to a
    /// specific session so tasks of a dead one cannot touch its successor;
    /// `None` tears down whatever is live.
    async fn handle_disconnect(&self, epoch: Option<u64>, d: Disconnect) {
        let (transport, need_event, subs) = {
            let mut st = self.state.lock().unwrap();
            if let Some(epoch) = epoch {
                if st.session_epoch != epoch {
                    return;
                }
            }
            if matches!(st.status, Status::Disconnected | Status::Closed) {
                return;
            }
            let transport = st.transport.take();
            if let Some(session) = st.session.take() {
                let _ = session.send(true);
            }
            st.session_epoch += 1;
            let need_event =
                matches!(st.status, Status::Connecting | Status::Connected) || st.connecting;
            st.connecting = false;
            st.client_id.clear();
            st.reconnect = d.reconnect;
            st.status = if d.reconnect {
                Status::Reconnecting
            } else {
                Status::Disconnected
            };
            let subs: Vec<Subscription> = st.subs.values().cloned().collect();
            (transport, need_event, subs)
        };

        let pending = self.requests.len();
        if pending > 0 {
            debug!(pending, "failing requests left on the dead connection");
        }
        self.requests.drain(|| ClientError::Disconnected);
        if let Some(transport) = transport {
            transport.close().await;
        }
        for sub in subs {
            sub.suspend(d.reconnect);
        }
        if need_event {
            info!(reason = %d.reason, reconnect = d.reconnect, "disconnected");
            self.events.emit_disconnect(DisconnectEvent {
                reason: d.reason.clone(),
                reconnect: d.reconnect,
            });
        }
        if d.reconnect {
            let _ = self.reconnect_tx.try_send(());
        }
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    pub(crate) async fn request<Req, Res>(&self, method: MethodType, params: &Req) -> ClientResult<Res>
    where
        Req: Serialize + prost::Message,
        Res: DeserializeOwned + prost::Message + Default,
    {
        let params = codec::encode_params(self.flavor, params)?;
        let reply = self
            .request_raw(method, params, self.config.read_timeout)
            .await?;
        if let Some(error) = reply.error {
            return Err(ClientError::Protocol {
                code: error.code,
                message: error.message,
            });
        }
        codec::decode(self.flavor, &reply.result)
    }

    /// Register a callback, write the command, await the reply. Exactly one
    /// of reply, timeout, disconnect or close resolves the callback.
    async fn request_raw(
        &self,
        method: MethodType,
        params: Vec<u8>,
        timeout: Duration,
    ) -> ClientResult<Reply> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let id = self.next_command_id();
        let command = Command {
            id,
            method: method as i32,
            params,
        };
        let frame = codec::encode_command(self.flavor, &command)?;
        let transport = self
            .state
            .lock()
            .unwrap()
            .transport
            .clone()
            .ok_or(ClientError::Disconnected)?;
        let rx = self.requests.add(id)?;

        if let Err(e) = transport.write(frame, self.config.write_timeout).await {
            self.requests.remove(id);
            self.handle_disconnect(None, Disconnect::new("write error", true))
                .await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.requests.remove(id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Fire-and-forget command with ID 0; never touches the registry.
    async fn send_command(&self, method: MethodType, params: Vec<u8>) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let command = Command {
            id: 0,
            method: method as i32,
            params,
        };
        let frame = codec::encode_command(self.flavor, &command)?;
        let transport = self
            .state
            .lock()
            .unwrap()
            .transport
            .clone()
            .ok_or(ClientError::Disconnected)?;
        if let Err(e) = transport.write(frame, self.config.write_timeout).await {
            self.handle_disconnect(None, Disconnect::new("write error", true))
                .await;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) async fn publish_to(&self, channel: &str, data: Vec<u8>) -> ClientResult<()> {
        let req = PublishRequest {
            channel: channel.to_string(),
            data,
        };
        let _res: PublishResult = self.request(MethodType::Publish, &req).await?;
        Ok(())
    }

    pub(crate) async fn history_of(&self, channel: &str) -> ClientResult<Vec<Publication>> {
        let req = HistoryRequest {
            channel: channel.to_string(),
        };
        let res: HistoryResult = self.request(MethodType::History, &req).await?;
        Ok(res.publications)
    }

    pub(crate) async fn presence_of(
        &self,
        channel: &str,
    ) -> ClientResult<HashMap<String, ClientInfo>> {
        let req = PresenceRequest {
            channel: channel.to_string(),
        };
        let res: PresenceResult = self.request(MethodType::Presence, &req).await?;
        Ok(res.presence)
    }

    pub(crate) async fn presence_stats_of(&self, channel: &str) -> ClientResult<PresenceStats> {
        let req = PresenceStatsRequest {
            channel: channel.to_string(),
        };
        let res: PresenceStatsResult = self.request(MethodType::PresenceStats, &req).await?;
        Ok(PresenceStats {
            num_clients: res.num_clients,
            num_users: res.num_users,
        })
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    /// Obtain a fresh connection token through the configured provider or
    /// the registered refresh handler.
    fn refresh_token(&self) -> ClientResult<()> {
        let token = if let Some(get) = &self.config.get_connection_token {
            get(ConnectionTokenEvent::default())?
        } else if let Some(handler) = self.events.refresh_handler() {
            handler(ConnectionTokenEvent::default())?
        } else {
            return Err(ClientError::config(
                "connection token expired but no refresh handler or token provider is set",
            ));
        };
        self.state.lock().unwrap().token = token;
        Ok(())
    }

    /// Token for a private channel; empty for public channels.
    pub(crate) fn private_sign(&self, channel: &str) -> ClientResult<String> {
        if !channel.starts_with(&self.config.private_channel_prefix) {
            return Ok(String::new());
        }
        let event = PrivateSubEvent {
            client_id: self.client_id(),
            channel: channel.to_string(),
        };
        if let Some(get) = &self.config.get_subscription_token {
            return get(event);
        }
        if let Some(handler) = self.events.private_sub_handler() {
            return handler(event);
        }
        Err(ClientError::config(
            "private channel subscription requires a token provider or on_private_sub handler",
        ))
    }

    // ------------------------------------------------------------------
    // Reader loop and push routing
    // ------------------------------------------------------------------

    async fn read_loop(weak: Weak<ClientInner>, mut reader: TransportReader, epoch: u64) {
        loop {
            let result = reader.read().await;
            let Some(this) = weak.upgrade() else { return };
            match result {
                Ok(reply) => {
                    this.activity.notify_one();
                    this.handle_reply(reply);
                }
                Err((hint, error)) => {
                    debug!(error = %error, "reader exiting");
                    this.handle_disconnect(Some(epoch), hint.unwrap_or_default())
                        .await;
                    return;
                }
            }
        }
    }

    fn handle_reply(&self, reply: Reply) {
        if reply.id > 0 {
            self.requests.resolve(reply.id, Ok(reply));
            return;
        }
        match codec::decode_push(self.flavor, &reply.result) {
            Ok(push) => self.handle_push(push),
            Err(e) => self.emit_error(e),
        }
    }

    fn client_sub(&self, channel: &str) -> Option<Subscription> {
        self.state.lock().unwrap().subs.get(channel).cloned()
    }

    /// Route a push to the client-side subscription if one exists, else to
    /// the server-subscription handlers; drop it when the channel is known
    /// to neither registry.
    fn handle_push(&self, push: Push) {
        let Ok(push_type) = PushType::try_from(push.r#type) else {
            debug!(push_type = push.r#type, "ignoring unknown push type");
            return;
        };
        let channel = push.channel;
        let result = match push_type {
            PushType::Publication => {
                codec::decode::<Publication>(self.flavor, &push.data).map(|publication| {
                    match self.client_sub(&channel) {
                        Some(sub) => sub.handle_publication(publication),
                        None => self.handle_server_publication(&channel, publication),
                    }
                })
            }
            PushType::Join => codec::decode::<Join>(self.flavor, &push.data).map(|join| {
                match self.client_sub(&channel) {
                    Some(sub) => sub.handle_join(join.info),
                    None => self.handle_server_join(&channel, join.info),
                }
            }),
            PushType::Leave => codec::decode::<Leave>(self.flavor, &push.data).map(|leave| {
                match self.client_sub(&channel) {
                    Some(sub) => sub.handle_leave(leave.info),
                    None => self.handle_server_leave(&channel, leave.info),
                }
            }),
            PushType::Unsub => codec::decode::<Unsub>(self.flavor, &push.data).map(|_| {
                match self.client_sub(&channel) {
                    Some(sub) => sub.handle_unsub(),
                    None => self.handle_server_unsub(&channel),
                }
            }),
            PushType::Message => codec::decode::<Message>(self.flavor, &push.data)
                .map(|message| self.events.emit_message(MessageEvent { data: message.data })),
        };
        if let Err(e) = result {
            self.emit_error(e);
        }
    }

    fn handle_server_publication(&self, channel: &str, publication: Publication) {
        if !self.state.lock().unwrap().server_subs.contains_key(channel) {
            return;
        }
        self.apply_server_publication(channel, publication);
    }

    fn apply_server_publication(&self, channel: &str, publication: Publication) {
        self.events.emit_server_publish(ServerPublishEvent {
            channel: channel.to_string(),
            publication: publication.clone(),
        });
        let mut st = self.state.lock().unwrap();
        if let Some(entry) = st.server_subs.get_mut(channel) {
            if publication.offset > entry.offset {
                entry.offset = publication.offset;
            }
        }
    }

    fn handle_server_join(&self, channel: &str, info: Option<ClientInfo>) {
        if !self.state.lock().unwrap().server_subs.contains_key(channel) {
            return;
        }
        self.events.emit_server_join(ServerJoinEvent {
            channel: channel.to_string(),
            info: info.unwrap_or_default(),
        });
    }

    fn handle_server_leave(&self, channel: &str, info: Option<ClientInfo>) {
        if !self.state.lock().unwrap().server_subs.contains_key(channel) {
            return;
        }
        self.events.emit_server_leave(ServerLeaveEvent {
            channel: channel.to_string(),
            info: info.unwrap_or_default(),
        });
    }

    fn handle_server_unsub(&self, channel: &str) {
        let known = self
            .state
            .lock()
            .unwrap()
            .server_subs
            .remove(channel)
            .is_some();
        if !known {
            return;
        }
        self.events.emit_server_unsubscribe(ServerUnsubscribeEvent {
            channel: channel.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Session tasks
    // ------------------------------------------------------------------

    /// While connected, ping after `ping_interval` of silence; any inbound
    /// frame re-arms the timer. A failed or late ping reply tears the
    /// session down with reconnect.
    fn spawn_ping_loop(self: &Arc<Self>, epoch: u64, session: &watch::Sender<bool>) {
        let weak = Arc::downgrade(self);
        let mut session_rx = session.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            loop {
                let Some(this) = weak.upgrade() else { return };
                let ping_due = tokio::select! {
                    _ = this.activity.notified() => false,
                    _ = tokio::time::sleep(interval) => true,
                    _ = session_rx.changed() => return,
                    _ = shutdown_rx.changed() => return,
                };
                if !ping_due {
                    continue;
                }
                debug!("sending ping");
                let wait = this.config.read_timeout;
                if let Err(e) = this.request_raw(MethodType::Ping, Vec::new(), wait).await {
                    warn!(error = %e, "ping failed");
                    this.handle_disconnect(Some(epoch), Disconnect::new("no ping", true))
                        .await;
                    return;
                }
            }
        });
    }

    /// Refresh the connection token `ttl` seconds from now, re-arming as
    /// long as the server keeps marking the connection as expiring.
    fn spawn_refresh_timer(self: &Arc<Self>, ttl: u32, session: &watch::Sender<bool>) {
        let weak = Arc::downgrade(self);
        let mut session_rx = session.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ttl = ttl;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(ttl.into())) => {}
                    _ = session_rx.changed() => return,
                    _ = shutdown_rx.changed() => return,
                }
                let Some(this) = weak.upgrade() else { return };
                if let Err(e) = this.refresh_token() {
                    this.emit_error(e);
                    return;
                }
                let token = this.state.lock().unwrap().token.clone();
                match this
                    .request::<RefreshRequest, RefreshResult>(
                        MethodType::Refresh,
                        &RefreshRequest { token },
                    )
                    .await
                {
                    Ok(res) if res.expires => ttl = res.ttl,
                    Ok(_) => return,
                    Err(e) => {
                        debug!(error = %e, "token refresh failed");
                        return;
                    }
                }
            }
        });
    }

    /// Refresh a private channel's subscription token `ttl` seconds from
    /// now, for as long as the session lives.
    pub(crate) fn spawn_sub_refresh(self: &Arc<Self>, channel: String, ttl: u32) {
        let Some(session_tx) = self.state.lock().unwrap().session.clone() else {
            return;
        };
        let mut session_rx = session_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ttl = ttl;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(ttl.into())) => {}
                    _ = session_rx.changed() => return,
                    _ = shutdown_rx.changed() => return,
                }
                let Some(this) = weak.upgrade() else { return };
                let token = match this.private_sign(&channel) {
                    Ok(token) => token,
                    Err(e) => {
                        this.emit_error(e);
                        return;
                    }
                };
                let req = SubRefreshRequest {
                    channel: channel.clone(),
                    token,
                };
                match this
                    .request::<SubRefreshRequest, SubRefreshResult>(MethodType::SubRefresh, &req)
                    .await
                {
                    Ok(res) if res.expires => ttl = res.ttl,
                    _ => return,
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Reconnect scheduler
    // ------------------------------------------------------------------

    /// Single-flight worker consuming the one-slot reconnect signal. Each
    /// attempt sleeps per the backoff policy, re-verifies the client still
    /// wants to reconnect, then runs the connect path to completion before
    /// looking at the next signal.
    async fn reconnect_loop(
        weak: Weak<ClientInner>,
        mut reconnect_rx: mpsc::Receiver<()>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                signal = reconnect_rx.recv() => {
                    if signal.is_none() {
                        return;
                    }
                }
            }

            let delay = {
                let Some(this) = weak.upgrade() else { return };
                let attempts = this.state.lock().unwrap().reconnect_attempts;
                match this.config.backoff.next_delay(attempts) {
                    Ok(delay) => delay,
                    Err(e) => {
                        this.emit_error(e);
                        return;
                    }
                }
            };

            debug!(?delay, "waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => return,
            }

            let Some(this) = weak.upgrade() else { return };
            {
                let mut st = this.state.lock().unwrap();
                if st.status != Status::Reconnecting || !st.reconnect {
                    continue;
                }
                st.reconnect_attempts += 1;
            }
            if let Err(e) = this.connect_inner(true).await {
                this.emit_error(e);
            }
        }
    }
}
