//! Async client for Gyre real-time messaging servers.
//!
//! Speaks a bidirectional pub/sub + RPC protocol over a persistent
//! WebSocket, in either a textual (JSON) or binary (protobuf) flavor
//! selected through the endpoint URL.
//!
//! The client owns the connection state machine: authenticated (re)connect
//! with exponential backoff, request/reply correlation with per-request
//! timeouts, server pushes demultiplexed onto per-channel [`Subscription`]
//! objects, token refresh, pings and recovery of missed publications after
//! reconnect. Events are delivered through registered callbacks.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use gyre::{Client, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gyre::ClientError> {
//!     let client = Client::new("ws://localhost:8000/connection", Config::default())?;
//!     client.on_connect(|e| println!("connected as {}", e.client_id));
//!
//!     client.connect().await?;
//!
//!     let sub = client.new_subscription("news")?;
//!     sub.on_publication(|e| println!("got {} bytes", e.data.len()));
//!     sub.subscribe().await?;
//!
//!     client.publish("news", br#"{"hello":"world"}"#.to_vec()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌────────┐   commands    ┌─────────────┐   frames   ┌───────────┐
//! │ Client │──────────────▶│  transport  │───────────▶│  server   │
//! │ handle │               │  (write)    │            └─────┬─────┘
//! └───┬────┘               └─────────────┘                  │
//!     │ replies ┌──────────────────┐      ┌───────────┐     │
//!     ◀─────────┤ request registry │◀─────┤  reader   │◀────┘
//!     │         └──────────────────┘      │  task     │
//!     │ pushes  ┌──────────────────┐      └───────────┘
//!     ◀─────────┤ sub / server-sub │◀─────  push router
//!               └──────────────────┘
//! ```

pub mod backoff;
mod client;
mod codec;
mod config;
mod error;
mod events;
pub mod protocol;
mod registry;
mod subscription;
mod transport;

pub use backoff::{BackoffStrategy, ExponentialBackoff};
pub use client::{Client, PresenceStats, Status};
pub use codec::Flavor;
pub use config::{Config, ConnectionTokenFn, SubscriptionTokenFn};
pub use error::{code, ClientError, ClientResult};
pub use events::{
    ConnectEvent, ConnectionTokenEvent, DisconnectEvent, ErrorEvent, MessageEvent,
    PrivateSubEvent, ServerJoinEvent, ServerLeaveEvent, ServerPublishEvent, ServerSubscribeEvent,
    ServerUnsubscribeEvent,
};
pub use protocol::{ClientInfo, Publication, StreamPosition};
pub use subscription::{
    JoinEvent, LeaveEvent, PublicationEvent, SubscribeEvent, Subscription, SubscriptionErrorEvent,
    SubscriptionStatus, UnsubscribeEvent,
};
