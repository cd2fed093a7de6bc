//! Resilient WebSocket transport.
//!
//! [`ReconnectingSocket`] wraps a raw `tokio-tungstenite` connection with
//! automatic reconnection, a per-attempt connect timeout, a bounded retry
//! budget, and a FIFO queue that holds outbound frames while disconnected.
//!
//! # Architecture
//!
//! ```text
//! ReconnectingSocket (handle)
//!     │ send / close / listeners / ready_state
//!     ▼
//! connection task (spawned, owns the real socket)
//!     ├── connect with timeout, bounded retries, fixed interval
//!     ├── tokio::select! over send queue + socket + shutdown
//!     └── emits Open / Message / Close / Error to registered listeners
//! ```
//!
//! Callers never observe raw socket churn: the reported [`ReadyState`] is
//! virtualized, staying `Connecting` across drops while retries remain and
//! reaching `Closed` only on explicit close or an exhausted retry budget.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::codec::WireUnit;
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL, NORMAL_CLOSE_CODE,
    NO_STATUS_CLOSE_CODE,
};
use crate::error::Error;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Callback invoked with terminal transport errors.
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Callback invoked before each reconnect attempt, with the drop reason.
pub type ReconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

type EventCallback = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

/// Virtualized lifecycle state of the transport.
///
/// Mirrors the four-state WebSocket lifecycle, but `Closed` is reported only
/// when the transport was explicitly closed or its retries are exhausted; a
/// socket drop that is still eligible for retry reports `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// No open socket; a connection attempt is pending or in flight.
    Connecting,
    /// The underlying socket is open.
    Open,
    /// An explicit close is in progress.
    Closing,
    /// Explicitly closed or out of retries. Terminal.
    Closed,
}

/// The event classes listeners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The logical connection (re)opened.
    Open,
    /// An inbound frame arrived.
    Message,
    /// The transport closed for good (emitted exactly once).
    Close,
    /// An underlying socket attempt failed; the transport keeps retrying.
    Error,
}

/// An event emitted to registered listeners.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The logical connection (re)opened; queued frames are being flushed.
    Open,
    /// An inbound frame, verbatim.
    Message(WireUnit),
    /// The final close, synthesized from the last real close frame or the
    /// caller-supplied code/reason.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
    /// An underlying socket failure description.
    Error(String),
}

impl SocketEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Message(_) => EventKind::Message,
            Self::Close { .. } => EventKind::Close,
            Self::Error(_) => EventKind::Error,
        }
    }
}

struct Listener {
    id: u64,
    kind: EventKind,
    callback: EventCallback,
}

/// Builder for [`ReconnectingSocket`].
#[derive(Default)]
pub struct ReconnectingSocketBuilder {
    target_url: Option<String>,
    retries_interval: Option<Duration>,
    max_retries: Option<u32>,
    connect_timeout: Option<Duration>,
    on_error: Option<ErrorCallback>,
    on_reconnect: Option<ReconnectCallback>,
}

impl ReconnectingSocketBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the WebSocket URL to connect to (required).
    #[must_use]
    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    /// Delay between reconnect attempts (default 1500 ms).
    #[must_use]
    pub fn retries_interval(mut self, interval: Duration) -> Self {
        self.retries_interval = Some(interval);
        self
    }

    /// Reconnect budget before the transport gives up (default 200).
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    /// Timeout guarding each individual connection attempt (default 5 s).
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Callback for terminal errors (exhausted retries, dropped sends).
    /// Without one, terminal errors are logged at error level.
    #[must_use]
    pub fn on_error(mut self, callback: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Callback invoked before each reconnect attempt with the drop reason.
    #[must_use]
    pub fn on_reconnect(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_reconnect = Some(Arc::new(callback));
        self
    }

    /// Build the socket and spawn its connection task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if `target_url` is not set.
    #[must_use]
    pub fn build(self) -> ReconnectingSocket {
        let (state_tx, _state_rx) = watch::channel(ReadyState::Connecting);
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            target_url: self.target_url.expect("target_url is required"),
            retries_interval: self.retries_interval.unwrap_or(DEFAULT_RETRY_INTERVAL),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            on_error: self
                .on_error
                .unwrap_or_else(|| Arc::new(|e: &Error| log::error!("transport error: {e}"))),
            on_reconnect: self.on_reconnect,
            state_tx,
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            send_tx,
            closed: AtomicBool::new(false),
            retries: AtomicU32::new(0),
            last_close: Mutex::new(None),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        });

        tokio::spawn(run_connection_loop(
            Arc::clone(&shared),
            send_rx,
            shutdown_rx,
        ));

        ReconnectingSocket { shared }
    }
}

struct Shared {
    target_url: String,
    retries_interval: Duration,
    max_retries: u32,
    connect_timeout: Duration,
    on_error: ErrorCallback,
    on_reconnect: Option<ReconnectCallback>,
    state_tx: watch::Sender<ReadyState>,
    listeners: RwLock<Vec<Listener>>,
    next_listener_id: AtomicU64,
    send_tx: mpsc::UnboundedSender<WireUnit>,
    closed: AtomicBool,
    retries: AtomicU32,
    last_close: Mutex<Option<(u16, String)>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Shared {
    /// Publish a new ready state. Never un-closes a closed transport.
    fn set_state(&self, state: ReadyState) {
        if self.closed.load(Ordering::Acquire) && state != ReadyState::Closed {
            return;
        }
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: &SocketEvent) {
        let kind = event.kind();
        let snapshot: Vec<EventCallback> = self
            .listeners
            .read()
            .expect("listener lock poisoned")
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| Arc::clone(&l.callback))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    /// Emit the one final close event, drop all listeners, and mark the
    /// transport closed. Safe to reach from both the explicit-close path and
    /// the exhausted-retries path; only the first caller emits.
    fn finalize_close(&self, code: Option<u16>, reason: Option<&str>) {
        let (code, reason) = {
            let mut last = self.last_close.lock().expect("close state lock poisoned");
            match last.take() {
                Some(real) => real,
                None => (
                    code.unwrap_or(NORMAL_CLOSE_CODE),
                    reason.unwrap_or("closed").to_string(),
                ),
            }
        };
        self.emit(&SocketEvent::Close { code, reason });
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .clear();
        self.state_tx.send_replace(ReadyState::Closed);
    }
}

/// A reconnecting WebSocket connection.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Frames sent
/// while disconnected are queued and flushed in FIFO order once the socket
/// reopens. The transport stops only on an explicit [`close`](Self::close)
/// or once its retry budget is exhausted.
pub struct ReconnectingSocket {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ReconnectingSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingSocket")
            .field("target_url", &self.shared.target_url)
            .field("ready_state", &self.ready_state())
            .field("retries", &self.shared.retries.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ReconnectingSocket {
    /// Create a new socket builder.
    #[must_use]
    pub fn builder() -> ReconnectingSocketBuilder {
        ReconnectingSocketBuilder::new()
    }

    /// Current virtualized state.
    pub fn ready_state(&self) -> ReadyState {
        *self.shared.state_tx.borrow()
    }

    /// Whether the underlying socket is currently open.
    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Wait until the transport is open.
    ///
    /// Returns an error if the transport closes (explicitly, or by running
    /// out of retries) before ever opening.
    pub async fn wait_until_open(&self) -> Result<(), Error> {
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ReadyState::Open => return Ok(()),
                ReadyState::Closed => return Err(Error::Closed),
                ReadyState::Connecting | ReadyState::Closing => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::Closed);
            }
        }
    }

    /// Register a listener for one event kind. Returns an id usable with
    /// [`remove_event_listener`](Self::remove_event_listener).
    pub fn add_event_listener(
        &self,
        kind: EventKind,
        callback: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .write()
            .expect("listener lock poisoned")
            .push(Listener {
                id,
                kind,
                callback: Arc::new(callback),
            });
        id
    }

    /// Remove a previously registered listener. Unknown ids are ignored.
    pub fn remove_event_listener(&self, id: u64) {
        self.shared
            .listeners
            .write()
            .expect("listener lock poisoned")
            .retain(|l| l.id != id);
    }

    /// Send a frame.
    ///
    /// If the socket is open the frame goes out immediately; while
    /// disconnected (retries remaining) it is queued and flushed in FIFO
    /// order on reopen. On a closed or retry-exhausted transport the frame
    /// is dropped and the error callback is invoked - never queued.
    pub fn send(&self, unit: WireUnit) {
        let s = &self.shared;
        if s.closed.load(Ordering::Acquire) || s.retries.load(Ordering::Relaxed) >= s.max_retries
        {
            (s.on_error)(&Error::SendOnClosed);
            return;
        }
        if s.send_tx.send(unit).is_err() {
            (s.on_error)(&Error::SendFailed("connection task is gone".to_string()));
        }
    }

    /// Close the transport.
    ///
    /// Emits one final `Close` event (built from the last real close frame,
    /// or from `code`/`reason`), drops all listeners and the pending-send
    /// queue, and closes the real socket. Repeated calls are no-ops.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        let s = &self.shared;
        if s.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("closing transport to {}", s.target_url);
        s.state_tx.send_replace(ReadyState::Closing);
        s.finalize_close(code, reason);
        if let Some(tx) = s
            .shutdown_tx
            .lock()
            .expect("shutdown lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
    }
}

enum LoopExit {
    /// Explicit shutdown; leave the reconnect loop for good.
    Shutdown,
    /// The socket dropped; reason for the reconnect decision.
    Dropped(String),
}

/// Run the connection loop with automatic reconnection.
async fn run_connection_loop(
    shared: Arc<Shared>,
    mut send_rx: mpsc::UnboundedReceiver<WireUnit>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        shared.set_state(ReadyState::Connecting);

        let attempt = tokio::select! {
            result = tokio::time::timeout(
                shared.connect_timeout,
                connect_async(shared.target_url.as_str()),
            ) => result,
            _ = &mut shutdown_rx => break,
        };

        let reason = match attempt {
            Ok(Ok((ws, _response))) => {
                log::info!("connected to {}", shared.target_url);
                // A fresh connection invalidates the previous close reason.
                shared
                    .last_close
                    .lock()
                    .expect("close state lock poisoned")
                    .take();
                shared.set_state(ReadyState::Open);
                shared.emit(&SocketEvent::Open);

                match run_message_loop(&shared, ws, &mut send_rx, &mut shutdown_rx).await {
                    LoopExit::Shutdown => break,
                    LoopExit::Dropped(reason) => reason,
                }
            }
            Ok(Err(e)) => format!("connect failed: {e}"),
            Err(_) => format!(
                "connect timed out after {}ms",
                shared.connect_timeout.as_millis()
            ),
        };

        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        log::warn!("socket to {} dropped: {}", shared.target_url, reason);
        shared.emit(&SocketEvent::Error(reason.clone()));

        let retries = shared.retries.load(Ordering::Relaxed);
        if retries >= shared.max_retries {
            log::error!(
                "giving up on {} after {} reconnect attempts",
                shared.target_url,
                retries
            );
            (shared.on_error)(&Error::RetriesExhausted { attempts: retries });
            if !shared.closed.swap(true, Ordering::AcqRel) {
                shared.finalize_close(None, Some("retries exhausted"));
            }
            break;
        }

        shared.set_state(ReadyState::Connecting);
        tokio::select! {
            () = tokio::time::sleep(shared.retries_interval) => {}
            _ = &mut shutdown_rx => break,
        }
        shared.retries.fetch_add(1, Ordering::Relaxed);
        if let Some(callback) = &shared.on_reconnect {
            callback(&reason);
        }
    }
    log::debug!("connection task for {} exited", shared.target_url);
}

/// Pump one live socket until it drops or shutdown is requested.
async fn run_message_loop(
    shared: &Shared,
    ws: WsStream,
    send_rx: &mut mpsc::UnboundedReceiver<WireUnit>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> LoopExit {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            outgoing = send_rx.recv() => {
                let Some(unit) = outgoing else {
                    return LoopExit::Shutdown;
                };
                let message = match unit {
                    WireUnit::Text(text) => Message::Text(text),
                    WireUnit::Binary(data) => Message::Binary(data),
                };
                if let Err(e) = write.send(message).await {
                    return LoopExit::Dropped(format!("send failed: {e}"));
                }
            }

            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        shared.emit(&SocketEvent::Message(WireUnit::Text(text)));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        shared.emit(&SocketEvent::Message(WireUnit::Binary(data)));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            return LoopExit::Dropped("pong failed".to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((NO_STATUS_CLOSE_CODE, String::new()));
                        *shared
                            .last_close
                            .lock()
                            .expect("close state lock poisoned") = Some((code, reason.clone()));
                        return LoopExit::Dropped(format!("closed by peer: {code} {reason}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return LoopExit::Dropped(format!("socket error: {e}")),
                    None => return LoopExit::Dropped("stream ended".to_string()),
                }
            }

            _ = &mut *shutdown_rx => {
                // Best-effort close of the real socket; it may never have
                // finished its own handshake.
                let _ = write.send(Message::Close(None)).await;
                return LoopExit::Shutdown;
            }
        }
    }
}
