//! Reference-counted backing store for shared transports.
//!
//! Guarantees at most one physical [`ReconnectingSocket`] per server address:
//! every plugin client pointing at the same address holds a reference into
//! the same slot, and the socket is torn down only when the last referencing
//! client releases it.
//!
//! The store is an explicitly constructed value handed to clients, not a
//! process-wide singleton; sharing happens wherever the caller shares the
//! store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::transport::{ReconnectingSocket, ReconnectingSocketBuilder};

struct StoreEntry {
    socket: Arc<ReconnectingSocket>,
    ref_count: u32,
}

/// Reference-counted holder of one transport per server address.
#[derive(Default)]
pub struct ConnectionStore {
    entries: Mutex<HashMap<String, StoreEntry>>,
}

impl std::fmt::Debug for ConnectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStore")
            .field("active_connections", &self.active_connections())
            .finish_non_exhaustive()
    }
}

impl ConnectionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the shared socket for `url`, creating it on first use.
    ///
    /// `configure` customizes the builder when (and only when) this call
    /// actually creates the socket; later acquirers share the existing one
    /// untouched. Every call increments the slot's reference count.
    ///
    /// Must be called from within a Tokio runtime (socket creation spawns
    /// the connection task).
    pub fn acquire<F>(&self, url: &str, configure: F) -> Arc<ReconnectingSocket>
    where
        F: FnOnce(ReconnectingSocketBuilder) -> ReconnectingSocketBuilder,
    {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let entry = entries.entry(url.to_string()).or_insert_with(|| {
            log::debug!("opening shared socket for {url}");
            let builder = configure(ReconnectingSocket::builder().target_url(url));
            StoreEntry {
                socket: Arc::new(builder.build()),
                ref_count: 0,
            }
        });
        entry.ref_count += 1;
        Arc::clone(&entry.socket)
    }

    /// Release one reference to the socket for `url`.
    ///
    /// When the count drops below 1 the socket is closed and the slot
    /// removed. Releasing more times than acquired is a caller bug; it is
    /// logged and otherwise ignored.
    pub fn release(&self, url: &str) {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let Some(entry) = entries.get_mut(url) else {
            log::warn!("release for unknown socket {url}");
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count < 1 {
            log::debug!("last client departed; closing shared socket for {url}");
            entry.socket.close(None, Some("last client closed"));
            entries.remove(url);
        }
    }

    /// Number of live shared sockets.
    pub fn active_connections(&self) -> usize {
        self.entries.lock().expect("store lock poisoned").len()
    }

    /// Current reference count for `url`, if a socket exists.
    pub fn ref_count(&self, url: &str) -> Option<u32> {
        self.entries
            .lock()
            .expect("store lock poisoned")
            .get(url)
            .map(|e| e.ref_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReadyState;
    use std::time::Duration;

    const URL: &str = "ws://127.0.0.1:1/";

    fn slow_retry(builder: ReconnectingSocketBuilder) -> ReconnectingSocketBuilder {
        builder.retries_interval(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_acquire_shares_one_socket_per_address() {
        let store = ConnectionStore::new();
        let first = store.acquire(URL, slow_retry);
        let second = store.acquire(URL, slow_retry);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.ref_count(URL), Some(2));
        assert_eq!(store.active_connections(), 1);

        store.release(URL);
        store.release(URL);
    }

    #[tokio::test]
    async fn test_release_closes_only_after_last_reference() {
        let store = ConnectionStore::new();
        let socket = store.acquire(URL, slow_retry);
        let _other = store.acquire(URL, slow_retry);

        store.release(URL);
        assert_eq!(store.active_connections(), 1);
        assert_ne!(socket.ready_state(), ReadyState::Closed);

        store.release(URL);
        assert_eq!(store.active_connections(), 0);
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_over_release_is_ignored() {
        let store = ConnectionStore::new();
        let _socket = store.acquire(URL, slow_retry);
        store.release(URL);
        // Extra releases must not panic or underflow.
        store.release(URL);
        assert_eq!(store.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_distinct_addresses_get_distinct_sockets() {
        let store = ConnectionStore::new();
        let a = store.acquire("ws://127.0.0.1:1/a", slow_retry);
        let b = store.acquire("ws://127.0.0.1:1/b", slow_retry);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(store.active_connections(), 2);
        store.release("ws://127.0.0.1:1/a");
        store.release("ws://127.0.0.1:1/b");
    }
}
