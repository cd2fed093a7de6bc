//! Bidirectional message channel between a running app and its devtools
//! frontends, multiplexed over one WebSocket per dev server.
//!
//! # Architecture
//!
//! ```text
//! DevToolsPluginClient (app)          DevToolsPluginClient (browser)
//!     │  send_message / listeners         │  handshake on init
//!     ▼                                   ▼
//! ConnectionStore ──► ReconnectingSocket ◄── ConnectionStore
//!     (refcounted,        │                    (one per process)
//!      one socket         │ codec: text fast path /
//!      per address)       │        length-prefixed binary
//!                         ▼
//!            ws[s]://host/expo-dev-plugins/broadcast
//! ```
//!
//! The layers, bottom up:
//!
//! - [`codec`]: a framing codec converting ([`RoutingKey`], [`Payload`])
//!   pairs to and from WebSocket text/binary units.
//! - [`transport`]: [`ReconnectingSocket`], a WebSocket wrapper with a
//!   connect timeout, a bounded retry budget, a FIFO pending-send queue, and
//!   a virtualized ready state.
//! - [`store`]: [`ConnectionStore`], a refcounted map guaranteeing one
//!   transport per server address within whatever scope the caller shares
//!   the store.
//! - [`client`] + [`handshake`]: [`DevToolsPluginClient`], the per-plugin
//!   façade, with the handshake protocol that arbitrates which browser tab
//!   owns each plugin conversation.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pluglink::{ConnectionDescriptor, ConnectionStore, DevToolsPluginClient, Payload, Role};
//!
//! # async fn run() -> Result<(), pluglink::Error> {
//! let store = Arc::new(ConnectionStore::new());
//! let client = DevToolsPluginClient::new(
//!     ConnectionDescriptor {
//!         plugin_name: "network-inspector".to_string(),
//!         server_address: "localhost:8081".to_string(),
//!         protocol_version: 1,
//!         role: Role::App,
//!         secure: false,
//!     },
//!     store,
//! );
//! client.init().await?;
//!
//! let _sub = client.add_message_listener("requestStart", |payload| {
//!     log::info!("request started: {payload:?}");
//! });
//! client.send_message("ready", Payload::Null);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod constants;
pub mod error;
pub mod handshake;
pub mod store;
pub mod transport;

pub use client::{ConnectionDescriptor, DevToolsPluginClient, Role, Subscription};
pub use codec::{Blob, Frame, Payload, RoutingKey, WireUnit};
pub use error::Error;
pub use handshake::{HandshakeMessage, HandshakeMethod};
pub use store::ConnectionStore;
pub use transport::{
    EventKind, ReadyState, ReconnectingSocket, ReconnectingSocketBuilder, SocketEvent,
};
