//! Per-channel subscription state machine.

use std::sync::{Arc, RwLock, Weak};

use tracing::debug;

use crate::client::ClientInner;
use crate::error::{ClientError, ClientResult};
use crate::events::Handler;
use crate::protocol::{
    ClientInfo, MethodType, Publication, StreamPosition, SubscribeRequest, SubscribeResult,
    UnsubscribeRequest, UnsubscribeResult,
};

/// Subscription lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Unsubscribed,
    Subscribing,
    Subscribed,
    SubscribeError,
}

/// Fired when a subscribe attempt succeeds.
#[derive(Clone, Debug)]
pub struct SubscribeEvent {
    /// True when this is a re-subscribe after reconnect.
    pub resubscribed: bool,
    /// True when the server replayed missed publications.
    pub recovered: bool,
}

/// Fired when a subscribe attempt fails.
#[derive(Clone, Debug)]
pub struct SubscriptionErrorEvent {
    pub error: ClientError,
}

/// A publication delivered on the channel.
#[derive(Clone, Debug)]
pub struct PublicationEvent {
    pub data: Vec<u8>,
    pub info: Option<ClientInfo>,
    pub offset: u64,
    pub uid: String,
}

#[derive(Clone, Debug)]
pub struct JoinEvent {
    pub info: ClientInfo,
}

#[derive(Clone, Debug)]
pub struct LeaveEvent {
    pub info: ClientInfo,
}

#[derive(Clone, Debug)]
pub struct UnsubscribeEvent {}

#[derive(Default)]
struct SubHandlers {
    on_subscribe: Option<Handler<SubscribeEvent>>,
    on_error: Option<Handler<SubscriptionErrorEvent>>,
    on_publication: Option<Handler<PublicationEvent>>,
    on_join: Option<Handler<JoinEvent>>,
    on_leave: Option<Handler<LeaveEvent>>,
    on_unsubscribe: Option<Handler<UnsubscribeEvent>>,
}

struct SubState {
    status: SubscriptionStatus,
    /// The user wants this channel subscribed; survives reconnects until
    /// an explicit unsubscribe or a server-pushed unsub.
    desired: bool,
    /// Request replay from the stored stream position on the next subscribe.
    recover: bool,
    /// A Subscribe command is currently awaiting its reply.
    inflight: bool,
    position: StreamPosition,
}

struct SubInner {
    channel: String,
    client: Weak<ClientInner>,
    state: std::sync::Mutex<SubState>,
    handlers: RwLock<SubHandlers>,
}

/// Handle to a per-channel subscription, created through
/// [`Client::new_subscription`](crate::Client::new_subscription).
///
/// Cheap to clone; all clones share state and handlers.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubInner>,
}

impl Subscription {
    pub(crate) fn new(channel: String, client: Weak<ClientInner>) -> Self {
        Self {
            inner: Arc::new(SubInner {
                channel,
                client,
                state: std::sync::Mutex::new(SubState {
                    status: SubscriptionStatus::Unsubscribed,
                    desired: false,
                    recover: false,
                    inflight: false,
                    position: StreamPosition::default(),
                }),
                handlers: RwLock::new(SubHandlers::default()),
            }),
        }
    }

    /// The channel this subscription belongs to.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SubscriptionStatus {
        self.inner.state.lock().unwrap().status
    }

    fn client(&self) -> ClientResult<Arc<ClientInner>> {
        self.inner.client.upgrade().ok_or(ClientError::Closed)
    }

    // ------------------------------------------------------------------
    // Handler registration
    // ------------------------------------------------------------------

    pub fn on_subscribe(&self, f: impl Fn(SubscribeEvent) + Send + Sync + 'static) {
        self.inner.handlers.write().unwrap().on_subscribe = Some(Arc::new(f));
    }

    pub fn on_error(&self, f: impl Fn(SubscriptionErrorEvent) + Send + Sync + 'static) {
        self.inner.handlers.write().unwrap().on_error = Some(Arc::new(f));
    }

    pub fn on_publication(&self, f: impl Fn(PublicationEvent) + Send + Sync + 'static) {
        self.inner.handlers.write().unwrap().on_publication = Some(Arc::new(f));
    }

    pub fn on_join(&self, f: impl Fn(JoinEvent) + Send + Sync + 'static) {
        self.inner.handlers.write().unwrap().on_join = Some(Arc::new(f));
    }

    pub fn on_leave(&self, f: impl Fn(LeaveEvent) + Send + Sync + 'static) {
        self.inner.handlers.write().unwrap().on_leave = Some(Arc::new(f));
    }

    pub fn on_unsubscribe(&self, f: impl Fn(UnsubscribeEvent) + Send + Sync + 'static) {
        self.inner.handlers.write().unwrap().on_unsubscribe = Some(Arc::new(f));
    }

    fn emit_subscribe(&self, event: SubscribeEvent) {
        let h = self.inner.handlers.read().unwrap().on_subscribe.clone();
        if let Some(h) = h {
            h(event);
        }
    }

    fn emit_error(&self, event: SubscriptionErrorEvent) {
        let h = self.inner.handlers.read().unwrap().on_error.clone();
        if let Some(h) = h {
            h(event);
        }
    }

    fn emit_publication(&self, event: PublicationEvent) {
        let h = self.inner.handlers.read().unwrap().on_publication.clone();
        if let Some(h) = h {
            h(event);
        }
    }

    fn emit_join(&self, event: JoinEvent) {
        let h = self.inner.handlers.read().unwrap().on_join.clone();
        if let Some(h) = h {
            h(event);
        }
    }

    fn emit_leave(&self, event: LeaveEvent) {
        let h = self.inner.handlers.read().unwrap().on_leave.clone();
        if let Some(h) = h {
            h(event);
        }
    }

    fn emit_unsubscribe(&self) {
        let h = self.inner.handlers.read().unwrap().on_unsubscribe.clone();
        if let Some(h) = h {
            h(UnsubscribeEvent {});
        }
    }

    // ------------------------------------------------------------------
    // User operations
    // ------------------------------------------------------------------

    /// Subscribe to the channel.
    ///
    /// When the client is not connected yet the subscription enters
    /// `Subscribing` and the command goes out once the client connects;
    /// otherwise the reply is awaited and subscribe errors are both
    /// returned and delivered to `on_error`.
    pub async fn subscribe(&self) -> ClientResult<()> {
        let client = self.client()?;
        if client.is_closed() {
            return Err(ClientError::Closed);
        }
        {
            let mut st = self.inner.state.lock().unwrap();
            st.desired = true;
            match st.status {
                SubscriptionStatus::Subscribed | SubscriptionStatus::Subscribing => {
                    return Ok(());
                }
                _ => st.status = SubscriptionStatus::Subscribing,
            }
        }
        if !client.is_connected() {
            return Ok(());
        }
        self.do_subscribe().await
    }

    /// Unsubscribe from the channel. The Unsubscribe command is sent best
    /// effort, without retry; `on_unsubscribe` fires regardless.
    pub async fn unsubscribe(&self) -> ClientResult<()> {
        let client = self.client()?;
        if client.is_closed() {
            return Err(ClientError::Closed);
        }
        let was_active = {
            let mut st = self.inner.state.lock().unwrap();
            let was_active = matches!(
                st.status,
                SubscriptionStatus::Subscribed | SubscriptionStatus::Subscribing
            );
            st.desired = false;
            st.status = SubscriptionStatus::Unsubscribed;
            st.recover = false;
            st.inflight = false;
            was_active
        };
        if !was_active {
            return Ok(());
        }
        if client.is_connected() {
            let req = UnsubscribeRequest {
                channel: self.inner.channel.clone(),
            };
            if let Err(e) = client
                .request::<UnsubscribeRequest, UnsubscribeResult>(MethodType::Unsubscribe, &req)
                .await
            {
                debug!(channel = %self.inner.channel, error = %e, "unsubscribe command failed");
            }
        }
        self.emit_unsubscribe();
        Ok(())
    }

    /// Publish data into this subscription's channel.
    pub async fn publish(&self, data: impl Into<Vec<u8>>) -> ClientResult<()> {
        self.client()?.publish_to(&self.inner.channel, data.into()).await
    }

    /// Fetch the channel's retained publication history.
    pub async fn history(&self) -> ClientResult<Vec<Publication>> {
        self.client()?.history_of(&self.inner.channel).await
    }

    /// Fetch the channel's presence information.
    pub async fn presence(
        &self,
    ) -> ClientResult<std::collections::HashMap<String, ClientInfo>> {
        self.client()?.presence_of(&self.inner.channel).await
    }

    /// Fetch short presence statistics for the channel.
    pub async fn presence_stats(&self) -> ClientResult<crate::client::PresenceStats> {
        self.client()?.presence_stats_of(&self.inner.channel).await
    }

    // ------------------------------------------------------------------
    // Subscribe machinery
    // ------------------------------------------------------------------

    /// Send the Subscribe command and process its reply. At most one
    /// command is in flight per channel.
    pub(crate) async fn do_subscribe(&self) -> ClientResult<()> {
        let client = self.client()?;
        let (recover, position) = {
            let mut st = self.inner.state.lock().unwrap();
            if st.status != SubscriptionStatus::Subscribing || st.inflight {
                return Ok(());
            }
            st.inflight = true;
            (st.recover, st.position.clone())
        };
        self.send_subscribe(&client, recover, position).await
    }

    async fn send_subscribe(
        &self,
        client: &Arc<ClientInner>,
        recover: bool,
        position: StreamPosition,
    ) -> ClientResult<()> {
        let mut retried = false;
        loop {
            let token = match client.private_sign(&self.inner.channel) {
                Ok(token) => token,
                Err(e) => {
                    self.fail(e.clone());
                    return Err(e);
                }
            };

            let mut req = SubscribeRequest {
                channel: self.inner.channel.clone(),
                token,
                ..Default::default()
            };
            if recover {
                req.recover = true;
                req.epoch = position.epoch.clone();
                // Send whichever position encoding is nonzero, preferring
                // epoch+offset, never both.
                if position.offset > 0 {
                    req.offset = position.offset;
                } else if position.seq > 0 || position.gen > 0 {
                    req.seq = position.seq;
                    req.gen = position.gen;
                }
            }

            match client
                .request::<SubscribeRequest, SubscribeResult>(MethodType::Subscribe, &req)
                .await
            {
                Ok(res) => {
                    self.on_subscribed(client, res, recover);
                    return Ok(());
                }
                Err(e) if e.is_token_expired() && !retried => {
                    debug!(channel = %self.inner.channel, "subscription token expired, retrying once");
                    retried = true;
                }
                Err(e @ (ClientError::Disconnected | ClientError::Closed)) => {
                    // The disconnect path already moved the subscription; just
                    // release the in-flight guard.
                    self.inner.state.lock().unwrap().inflight = false;
                    return Err(e);
                }
                Err(e) => {
                    self.fail(e.clone());
                    return Err(e);
                }
            }
        }
    }

    fn on_subscribed(&self, client: &Arc<ClientInner>, res: SubscribeResult, resubscribed: bool) {
        let publications = {
            let mut st = self.inner.state.lock().unwrap();
            st.inflight = false;
            if st.status != SubscriptionStatus::Subscribing {
                return;
            }
            st.status = SubscriptionStatus::Subscribed;
            st.recover = false;
            if !res.epoch.is_empty() {
                st.position.epoch = res.epoch.clone();
            }
            if res.offset > 0 {
                st.position.offset = res.offset;
            }
            if res.seq > 0 {
                st.position.seq = res.seq;
            }
            if res.gen > 0 {
                st.position.gen = res.gen;
            }
            res.publications.clone()
        };

        self.emit_subscribe(SubscribeEvent {
            resubscribed,
            recovered: res.recovered,
        });
        for publication in publications {
            self.handle_publication(publication);
        }
        if res.expires {
            client.spawn_sub_refresh(self.inner.channel.clone(), res.ttl);
        }
    }

    fn fail(&self, error: ClientError) {
        {
            let mut st = self.inner.state.lock().unwrap();
            st.inflight = false;
            if st.status == SubscriptionStatus::Subscribing {
                st.status = SubscriptionStatus::SubscribeError;
            }
        }
        self.emit_error(SubscriptionErrorEvent { error });
    }

    // ------------------------------------------------------------------
    // Called by the client core
    // ------------------------------------------------------------------

    /// Route a publication push to the user and advance the position.
    pub(crate) fn handle_publication(&self, publication: Publication) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.status != SubscriptionStatus::Subscribed {
                return;
            }
            if publication.offset > 0 {
                st.position.offset = st.position.offset.max(publication.offset);
            }
            if publication.seq > 0 {
                st.position.seq = publication.seq;
            }
            if publication.gen > 0 {
                st.position.gen = publication.gen;
            }
        }
        self.emit_publication(PublicationEvent {
            data: publication.data,
            info: publication.info,
            offset: publication.offset,
            uid: publication.uid,
        });
    }

    pub(crate) fn handle_join(&self, info: Option<ClientInfo>) {
        if self.status() != SubscriptionStatus::Subscribed {
            return;
        }
        self.emit_join(JoinEvent {
            info: info.unwrap_or_default(),
        });
    }

    pub(crate) fn handle_leave(&self, info: Option<ClientInfo>) {
        if self.status() != SubscriptionStatus::Subscribed {
            return;
        }
        self.emit_leave(LeaveEvent {
            info: info.unwrap_or_default(),
        });
    }

    /// Server-pushed unsubscribe for this channel.
    pub(crate) fn handle_unsub(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.status == SubscriptionStatus::Unsubscribed {
                return;
            }
            st.desired = false;
            st.status = SubscriptionStatus::Unsubscribed;
            st.recover = false;
            st.inflight = false;
        }
        self.emit_unsubscribe();
    }

    /// Move the subscription aside while the transport is down. `recover`
    /// carries the disconnect's reconnect flag; the stored stream position
    /// is replayed only for subscriptions that actually reached
    /// `Subscribed`.
    pub(crate) fn suspend(&self, recover: bool) {
        let fire = {
            let mut st = self.inner.state.lock().unwrap();
            let was = st.status;
            st.inflight = false;
            match was {
                SubscriptionStatus::Subscribed | SubscriptionStatus::Subscribing => {
                    st.status = SubscriptionStatus::Unsubscribed;
                    st.recover = recover && was == SubscriptionStatus::Subscribed;
                    true
                }
                _ => false,
            }
        };
        if fire {
            self.emit_unsubscribe();
        }
    }

    /// Send the Subscribe command from a detached task once the client has
    /// reached `Connected`. Covers both a subscription suspended by a
    /// disconnect and one the user opened before the first connect, which
    /// sits in `Subscribing` with no command in flight yet.
    pub(crate) fn resume(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if !st.desired {
                return;
            }
            match st.status {
                SubscriptionStatus::Unsubscribed => {
                    st.status = SubscriptionStatus::Subscribing;
                }
                SubscriptionStatus::Subscribing if !st.inflight => {}
                _ => return,
            }
        }
        let sub = self.clone();
        tokio::spawn(async move {
            let _ = sub.do_subscribe().await;
        });
    }

    #[cfg(test)]
    fn force_state(&self, status: SubscriptionStatus, desired: bool, recover: bool) {
        let mut st = self.inner.state.lock().unwrap();
        st.status = status;
        st.desired = desired;
        st.recover = recover;
    }

    #[cfg(test)]
    fn recover_flag(&self) -> bool {
        self.inner.state.lock().unwrap().recover
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::client::Client;
    use crate::config::Config;

    fn offline_client() -> Client {
        Client::new("ws://localhost:1/connection", Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_enters_subscribing() {
        let client = offline_client();
        let sub = client.new_subscription("news").unwrap();
        assert_eq!(sub.status(), SubscriptionStatus::Unsubscribed);

        sub.subscribe().await.unwrap();
        assert_eq!(sub.status(), SubscriptionStatus::Subscribing);

        // Second subscribe is a no-op, not a second in-flight command.
        sub.subscribe().await.unwrap();
        assert_eq!(sub.status(), SubscriptionStatus::Subscribing);
    }

    #[tokio::test]
    async fn test_unsubscribe_when_inactive_is_noop() {
        let client = offline_client();
        let sub = client.new_subscription("news").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        sub.on_unsubscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.unsubscribe().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_suspend_keeps_recover_only_for_subscribed() {
        let client = offline_client();

        let sub = client.new_subscription("a").unwrap();
        sub.force_state(SubscriptionStatus::Subscribed, true, false);
        sub.suspend(true);
        assert_eq!(sub.status(), SubscriptionStatus::Unsubscribed);
        assert!(sub.recover_flag());

        let sub = client.new_subscription("b").unwrap();
        sub.force_state(SubscriptionStatus::Subscribing, true, false);
        sub.suspend(true);
        assert_eq!(sub.status(), SubscriptionStatus::Unsubscribed);
        assert!(!sub.recover_flag());
    }

    #[tokio::test]
    async fn test_suspend_fires_unsubscribe_once() {
        let client = offline_client();
        let sub = client.new_subscription("news").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        sub.on_unsubscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.force_state(SubscriptionStatus::Subscribed, true, false);
        sub.suspend(false);
        sub.suspend(false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_unsub_clears_desire() {
        let client = offline_client();
        let sub = client.new_subscription("news").unwrap();
        sub.force_state(SubscriptionStatus::Subscribed, true, false);

        sub.handle_unsub();
        assert_eq!(sub.status(), SubscriptionStatus::Unsubscribed);

        // A later reconnect must not resurrect the subscription.
        sub.resume();
        assert_eq!(sub.status(), SubscriptionStatus::Unsubscribed);
    }

    #[tokio::test]
    async fn test_publication_advances_offset_monotonically() {
        let client = offline_client();
        let sub = client.new_subscription("news").unwrap();
        sub.force_state(SubscriptionStatus::Subscribed, true, false);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        sub.on_publication(move |e| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(!e.data.is_empty());
        });

        sub.handle_publication(Publication {
            data: br#"{"n":1}"#.to_vec(),
            offset: 5,
            ..Default::default()
        });
        sub.handle_publication(Publication {
            data: br#"{"n":2}"#.to_vec(),
            offset: 3,
            ..Default::default()
        });
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(sub.inner.state.lock().unwrap().position.offset, 5);
    }

    #[tokio::test]
    async fn test_publication_ignored_when_not_subscribed() {
        let client = offline_client();
        let sub = client.new_subscription("news").unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        sub.on_publication(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.handle_publication(Publication::default());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
