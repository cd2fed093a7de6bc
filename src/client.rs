//! Per-plugin message client over a shared transport.
//!
//! A [`DevToolsPluginClient`] routes frames for one named plugin over a
//! transport acquired from a caller-supplied [`ConnectionStore`], so any
//! number of plugins in one process share one physical socket.
//!
//! # Architecture
//!
//! ```text
//! DevToolsPluginClient (cheap clone handle)
//!     ├── ConnectionStore ─► shared ReconnectingSocket
//!     ├── per-method listener table (registration order preserved)
//!     └── role strategy
//!         ├── App: plugin → active browser map, evicts stale owners
//!         └── Browser: announces itself, obeys terminate notices
//! ```
//!
//! Inbound dispatch order: handshake marker first (bypasses routing), then
//! the plugin-name filter (mismatches dropped silently), then the per-method
//! listener set in registration order. Decode failures are logged and the
//! frame dropped; nothing in this module can crash the host process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::Utc;
use tokio::sync::oneshot;

use crate::codec::{self, Payload, RoutingKey, WireUnit};
use crate::constants::BROADCAST_ENDPOINT;
use crate::error::Error;
use crate::handshake::{HandshakeMessage, HandshakeMethod};
use crate::store::ConnectionStore;
use crate::transport::{EventKind, ReadyState, ReconnectingSocket, SocketEvent};

/// Which side of the channel a client speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The running application process.
    App,
    /// A devtools frontend in a browser tab.
    Browser,
}

/// Immutable description of one plugin connection.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    /// Plugin this client speaks for.
    pub plugin_name: String,
    /// Dev server host (and port), without a scheme.
    pub server_address: String,
    /// Protocol version this side speaks.
    pub protocol_version: u32,
    /// Which side of the channel this is.
    pub role: Role,
    /// Whether the dev server requires TLS.
    pub secure: bool,
}

impl ConnectionDescriptor {
    /// The WebSocket URL this descriptor connects to.
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}{BROADCAST_ENDPOINT}", self.server_address)
    }
}

type MessageCallback = Arc<dyn Fn(&Payload) + Send + Sync>;

struct MethodListener {
    id: u64,
    callback: MessageCallback,
}

/// Handle to one registered message listener.
///
/// Dropping the subscription does *not* remove the listener; call
/// [`remove`](Self::remove).
#[derive(Debug)]
pub struct Subscription {
    shared: Weak<ClientShared>,
    method: String,
    id: u64,
}

impl Subscription {
    /// Unregister the listener. No-op if the client already closed.
    pub fn remove(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_listener(&self.method, self.id);
        }
    }
}

/// Role-specific behavior plugged into the shared client machinery.
trait RoleStrategy: Send + Sync {
    /// Runs once the transport reaches the open state.
    fn on_init(&self, client: &ClientShared);

    /// Handles an inbound handshake message.
    fn on_handshake(&self, client: &ClientShared, message: HandshakeMessage);

    /// One-shot teardown signal, if this role can be terminated remotely.
    fn take_teardown_rx(&self) -> Option<oneshot::Receiver<()>> {
        None
    }

    /// Active browser owner for a plugin (app role only).
    fn active_browser(&self, _plugin_name: &str) -> Option<String> {
        None
    }

    /// This client's browser id (browser role only).
    fn client_id(&self) -> Option<&str> {
        None
    }
}

/// App side: arbitrates which browser owns each plugin conversation.
struct AppRole {
    /// Plugin name → currently active browser client id. Owned exclusively
    /// by this client instance, never shared.
    active_browsers: Mutex<HashMap<String, String>>,
}

impl AppRole {
    fn new() -> Self {
        Self {
            active_browsers: Mutex::new(HashMap::new()),
        }
    }
}

impl RoleStrategy for AppRole {
    fn on_init(&self, _client: &ClientShared) {}

    fn on_handshake(&self, client: &ClientShared, message: HandshakeMessage) {
        if message.method != HandshakeMethod::Handshake {
            return;
        }
        let ours = client.descriptor.protocol_version;
        if message.protocol_version != ours {
            log::warn!(
                "browser {} speaks protocol v{}, app speaks v{}; terminating it",
                message.browser_client_id,
                message.protocol_version,
                ours
            );
            client.send_handshake(&HandshakeMessage::terminate(
                ours,
                message.plugin_name,
                message.browser_client_id,
            ));
            return;
        }

        let mut active = self
            .active_browsers
            .lock()
            .expect("owner map lock poisoned");
        if let Some(previous) = active.get(&message.plugin_name) {
            // Last handshake wins; the previous owner is explicitly evicted
            // rather than left silently stale.
            if *previous != message.browser_client_id {
                log::info!(
                    "evicting browser {previous} from plugin {}",
                    message.plugin_name
                );
                client.send_handshake(&HandshakeMessage::terminate(
                    ours,
                    message.plugin_name.clone(),
                    previous.clone(),
                ));
            }
        }
        active.insert(message.plugin_name, message.browser_client_id);
    }

    fn active_browser(&self, plugin_name: &str) -> Option<String> {
        self.active_browsers
            .lock()
            .expect("owner map lock poisoned")
            .get(plugin_name)
            .cloned()
    }
}

/// Browser side: announces itself on init, obeys terminate notices.
struct BrowserRole {
    client_id: String,
    teardown_tx: Mutex<Option<oneshot::Sender<()>>>,
    teardown_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl BrowserRole {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            // Timestamp-as-id is the wire contract: uniqueness is weak (two
            // browsers in the same millisecond collide) but sufficient for a
            // single-process, low-concurrency devtools session.
            client_id: Utc::now().timestamp_millis().to_string(),
            teardown_tx: Mutex::new(Some(tx)),
            teardown_rx: Mutex::new(Some(rx)),
        }
    }
}

impl RoleStrategy for BrowserRole {
    fn on_init(&self, client: &ClientShared) {
        client.send_handshake(&HandshakeMessage::handshake(
            client.descriptor.protocol_version,
            client.descriptor.plugin_name.clone(),
            self.client_id.clone(),
        ));
    }

    fn on_handshake(&self, _client: &ClientShared, message: HandshakeMessage) {
        if message.method == HandshakeMethod::TerminateBrowserClient
            && message.browser_client_id == self.client_id
        {
            log::warn!("browser client {} terminated by app", self.client_id);
            if let Some(tx) = self
                .teardown_tx
                .lock()
                .expect("teardown lock poisoned")
                .take()
            {
                let _ = tx.send(());
            }
        }
    }

    fn take_teardown_rx(&self) -> Option<oneshot::Receiver<()>> {
        self.teardown_rx
            .lock()
            .expect("teardown lock poisoned")
            .take()
    }

    fn client_id(&self) -> Option<&str> {
        Some(&self.client_id)
    }
}

struct SocketHandle {
    socket: Arc<ReconnectingSocket>,
    message_listener: u64,
}

struct ClientShared {
    descriptor: ConnectionDescriptor,
    store: Arc<ConnectionStore>,
    role: Box<dyn RoleStrategy>,
    listeners: RwLock<HashMap<String, Vec<MethodListener>>>,
    next_listener_id: AtomicU64,
    socket: Mutex<Option<SocketHandle>>,
    closed: AtomicBool,
}

impl ClientShared {
    fn handle_wire_unit(&self, unit: &WireUnit) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        // Handshakes bypass routing entirely.
        if let WireUnit::Text(text) = unit {
            match HandshakeMessage::try_parse(text) {
                Ok(Some(message)) => {
                    self.role.on_handshake(self, message);
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("malformed handshake dropped: {e}");
                    return;
                }
            }
        }

        let frame = match codec::unpack(unit) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("undecodable frame dropped: {e}");
                return;
            }
        };

        if let Some(plugin) = &frame.routing_key.plugin_name {
            if *plugin != self.descriptor.plugin_name {
                log::trace!(
                    "frame for plugin {plugin} dropped by client for {}",
                    self.descriptor.plugin_name
                );
                return;
            }
        }

        let snapshot: Vec<MessageCallback> = self
            .listeners
            .read()
            .expect("listener lock poisoned")
            .get(&frame.routing_key.method)
            .map(|set| set.iter().map(|l| Arc::clone(&l.callback)).collect())
            .unwrap_or_default();
        for callback in snapshot {
            callback(&frame.payload);
        }
    }

    fn send_handshake(&self, message: &HandshakeMessage) {
        if let Some(handle) = self.socket.lock().expect("socket lock poisoned").as_ref() {
            handle.socket.send(message.to_wire());
        }
    }

    fn insert_listener(&self, method: &str, id: u64, callback: MessageCallback) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .entry(method.to_string())
            .or_default()
            .push(MethodListener { id, callback });
    }

    fn remove_listener(&self, method: &str, id: u64) {
        let mut listeners = self.listeners.write().expect("listener lock poisoned");
        if let Some(set) = listeners.get_mut(method) {
            set.retain(|l| l.id != id);
            if set.is_empty() {
                listeners.remove(method);
            }
        }
    }
}

/// Client for one plugin's conversation over a shared transport.
///
/// Cheap to clone; clones share all state. Created with [`new`](Self::new),
/// brought online with [`init`](Self::init), torn down with
/// [`close`](Self::close).
#[derive(Clone)]
pub struct DevToolsPluginClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for DevToolsPluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevToolsPluginClient")
            .field("descriptor", &self.shared.descriptor)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl DevToolsPluginClient {
    /// Create a client for `descriptor`, sharing transports through `store`.
    ///
    /// The client is offline until [`init`](Self::init) resolves.
    #[must_use]
    pub fn new(descriptor: ConnectionDescriptor, store: Arc<ConnectionStore>) -> Self {
        let role: Box<dyn RoleStrategy> = match descriptor.role {
            Role::App => Box::new(AppRole::new()),
            Role::Browser => Box::new(BrowserRole::new()),
        };
        Self {
            shared: Arc::new(ClientShared {
                descriptor,
                store,
                role,
                listeners: RwLock::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                socket: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Acquire (or create) the shared transport, register this client's
    /// dispatch, and resolve once the socket is open.
    ///
    /// On failure the acquired reference is kept; call [`close`](Self::close)
    /// to release it.
    pub async fn init(&self) -> Result<(), Error> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let url = shared.descriptor.ws_url();

        let socket = {
            let mut guard = shared.socket.lock().expect("socket lock poisoned");
            if let Some(handle) = guard.as_ref() {
                log::warn!(
                    "plugin client {} already initialized",
                    shared.descriptor.plugin_name
                );
                Arc::clone(&handle.socket)
            } else {
                let socket = shared.store.acquire(&url, |builder| builder);
                let weak = Arc::downgrade(shared);
                let message_listener =
                    socket.add_event_listener(EventKind::Message, move |event| {
                        if let SocketEvent::Message(unit) = event {
                            if let Some(shared) = weak.upgrade() {
                                shared.handle_wire_unit(unit);
                            }
                        }
                    });
                *guard = Some(SocketHandle {
                    socket: Arc::clone(&socket),
                    message_listener,
                });
                socket
            }
        };

        socket.wait_until_open().await.map_err(|_| {
            Error::ConnectionFailed(format!("transport to {url} closed before opening"))
        })?;

        shared.role.on_init(shared);

        if let Some(teardown_rx) = shared.role.take_teardown_rx() {
            let client = self.clone();
            tokio::spawn(async move {
                if teardown_rx.await.is_ok() {
                    log::info!("terminate received; tearing down browser client");
                    client.close().await;
                }
            });
        }

        Ok(())
    }

    /// Register a listener for `method`. Listeners for one method run
    /// synchronously, in registration order.
    pub fn add_message_listener(
        &self,
        method: &str,
        listener: impl Fn(&Payload) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared.insert_listener(method, id, Arc::new(listener));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            method: method.to_string(),
            id,
        }
    }

    /// Register a listener delivered at most once.
    ///
    /// The registration removes itself before the listener body runs, so a
    /// re-entrant send from inside the listener cannot fire it again.
    pub fn add_message_listener_once(
        &self,
        method: &str,
        listener: impl Fn(&Payload) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.shared);
        let method_owned = method.to_string();
        let fired = AtomicBool::new(false);
        let wrapper = {
            let weak = weak.clone();
            let method = method_owned.clone();
            move |payload: &Payload| {
                if fired.swap(true, Ordering::AcqRel) {
                    return;
                }
                if let Some(shared) = weak.upgrade() {
                    shared.remove_listener(&method, id);
                }
                listener(payload);
            }
        };
        self.shared.insert_listener(method, id, Arc::new(wrapper));
        Subscription {
            shared: weak,
            method: method_owned,
            id,
        }
    }

    /// Send a message for this plugin.
    ///
    /// Synchronous: delivery happens via the transport's queue. On a closed
    /// transport the message is dropped with a warning - devtools messages
    /// are advisory, not critical-path.
    pub fn send_message(&self, method: &str, payload: Payload) {
        let shared = &self.shared;
        let socket = {
            let guard = shared.socket.lock().expect("socket lock poisoned");
            match guard.as_ref() {
                Some(handle) => Arc::clone(&handle.socket),
                None => {
                    log::warn!("message {method} dropped: client not initialized");
                    return;
                }
            }
        };
        if shared.closed.load(Ordering::Acquire) || socket.ready_state() == ReadyState::Closed {
            log::warn!("message {method} dropped: channel closed");
            return;
        }
        let key = RoutingKey::new(shared.descriptor.plugin_name.clone(), method);
        match codec::pack(&key, payload) {
            Ok(unit) => socket.send(unit),
            Err(e) => log::error!("failed to encode message {method}: {e}"),
        }
    }

    /// Whether the shared transport is currently open.
    pub fn is_connected(&self) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        self.shared
            .socket
            .lock()
            .expect("socket lock poisoned")
            .as_ref()
            .is_some_and(|handle| handle.socket.is_open())
    }

    /// Whether this client was closed (explicitly or by a terminate notice).
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// The browser id currently owning `plugin_name`'s conversation.
    /// Always `None` on browser-role clients.
    pub fn active_browser_client(&self, plugin_name: &str) -> Option<String> {
        self.shared.role.active_browser(plugin_name)
    }

    /// This client's browser id. Always `None` on app-role clients.
    pub fn browser_client_id(&self) -> Option<String> {
        self.shared.role.client_id().map(str::to_string)
    }

    /// Close the client: drop all listeners, unregister from the shared
    /// transport, and release the store reference (closing the socket if
    /// this was the last client). Idempotent.
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        shared
            .listeners
            .write()
            .expect("listener lock poisoned")
            .clear();
        let handle = shared.socket.lock().expect("socket lock poisoned").take();
        if let Some(handle) = handle {
            handle.socket.remove_event_listener(handle.message_listener);
            shared.store.release(&shared.descriptor.ws_url());
        }
        log::debug!("plugin client {} closed", shared.descriptor.plugin_name);
    }
}
