//! Integration tests for the reconnecting transport against real
//! in-process WebSocket servers.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pluglink::{Error, EventKind, ReadyState, ReconnectingSocket, SocketEvent, WireUnit};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const DEADLINE: Duration = Duration::from_secs(5);

// Port 1 is essentially never listening on loopback.
const UNREACHABLE: &str = "ws://127.0.0.1:1/";

#[tokio::test]
async fn test_retry_budget_bounds_reconnect_attempts() {
    support::init_logs();
    let reconnects = Arc::new(AtomicUsize::new(0));
    let (terminal_tx, mut terminal_rx) = mpsc::unbounded_channel();

    let socket = ReconnectingSocket::builder()
        .target_url(UNREACHABLE)
        .retries_interval(Duration::from_millis(20))
        .max_retries(3)
        .connect_timeout(Duration::from_millis(250))
        .on_reconnect({
            let reconnects = Arc::clone(&reconnects);
            move |_reason| {
                reconnects.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_error(move |e| {
            let _ = terminal_tx.send(matches!(e, Error::RetriesExhausted { attempts: 3 }));
        })
        .build();

    let was_exhaustion = timeout(DEADLINE, terminal_rx.recv())
        .await
        .expect("terminal error within deadline")
        .expect("error callback fired");
    assert!(was_exhaustion);
    assert_eq!(reconnects.load(Ordering::SeqCst), 3);

    // Exhaustion is terminal: the state settles on Closed.
    let settled = timeout(DEADLINE, socket.wait_until_open())
        .await
        .expect("state settles within deadline");
    assert!(matches!(settled, Err(Error::Closed)));
    assert_eq!(socket.ready_state(), ReadyState::Closed);
}

#[tokio::test]
async fn test_state_stays_connecting_while_retries_remain() {
    support::init_logs();
    let socket = ReconnectingSocket::builder()
        .target_url(UNREACHABLE)
        .retries_interval(Duration::from_millis(20))
        .max_retries(1000)
        .connect_timeout(Duration::from_millis(250))
        .on_error(|_| {})
        .build();

    // Several failed attempts happen in this window; none may leak through
    // as a Closed (or Open) state.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(socket.ready_state(), ReadyState::Connecting);

    socket.close(None, None);
    assert_eq!(socket.ready_state(), ReadyState::Closed);
}

#[tokio::test]
async fn test_queued_frames_flush_in_order_after_reconnect() {
    support::init_logs();
    let (addr, mut recorded) = support::spawn_capture_server(true).await;

    let socket = ReconnectingSocket::builder()
        .target_url(format!("ws://{addr}/"))
        .retries_interval(Duration::from_millis(20))
        .connect_timeout(Duration::from_secs(1))
        .build();

    // Queued while the first connection attempt is being rejected.
    socket.send(WireUnit::Text("first".to_string()));
    socket.send(WireUnit::Text("second".to_string()));
    socket.send(WireUnit::Text("third".to_string()));

    for expected in ["first", "second", "third"] {
        let msg = timeout(DEADLINE, recorded.recv())
            .await
            .expect("message within deadline")
            .expect("server running");
        assert_eq!(msg, Message::Text(expected.to_string()));
    }

    socket.close(None, None);
}

#[tokio::test]
async fn test_messages_relayed_between_transports() {
    support::init_logs();
    let addr = support::spawn_broadcast_server().await;
    let url = format!("ws://{addr}/");

    let sender = ReconnectingSocket::builder()
        .target_url(url.clone())
        .build();
    let receiver = ReconnectingSocket::builder().target_url(url).build();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    receiver.add_event_listener(EventKind::Message, move |event| {
        if let SocketEvent::Message(unit) = event {
            let _ = msg_tx.send(unit.clone());
        }
    });

    timeout(DEADLINE, sender.wait_until_open())
        .await
        .expect("deadline")
        .expect("sender open");
    timeout(DEADLINE, receiver.wait_until_open())
        .await
        .expect("deadline")
        .expect("receiver open");

    sender.send(WireUnit::Text("hello".to_string()));
    sender.send(WireUnit::Binary(vec![1, 2, 3]));

    let first = timeout(DEADLINE, msg_rx.recv())
        .await
        .expect("deadline")
        .expect("unit");
    assert_eq!(first, WireUnit::Text("hello".to_string()));
    let second = timeout(DEADLINE, msg_rx.recv())
        .await
        .expect("deadline")
        .expect("unit");
    assert_eq!(second, WireUnit::Binary(vec![1, 2, 3]));

    sender.close(None, None);
    receiver.close(None, None);
}

#[tokio::test]
async fn test_close_emits_final_event_with_supplied_reason() {
    support::init_logs();
    let (addr, _recorded) = support::spawn_capture_server(false).await;

    let socket = ReconnectingSocket::builder()
        .target_url(format!("ws://{addr}/"))
        .build();
    timeout(DEADLINE, socket.wait_until_open())
        .await
        .expect("deadline")
        .expect("open");

    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    socket.add_event_listener(EventKind::Close, move |event| {
        if let SocketEvent::Close { code, reason } = event {
            let _ = close_tx.send((*code, reason.clone()));
        }
    });

    socket.close(Some(4000), Some("test over"));
    let (code, reason) = timeout(DEADLINE, close_rx.recv())
        .await
        .expect("deadline")
        .expect("close event");
    assert_eq!(code, 4000);
    assert_eq!(reason, "test over");
}

#[tokio::test]
async fn test_open_event_fires_on_connect() {
    support::init_logs();
    let (addr, _recorded) = support::spawn_capture_server(false).await;

    let (open_tx, mut open_rx) = mpsc::unbounded_channel();
    let socket = ReconnectingSocket::builder()
        .target_url(format!("ws://{addr}/"))
        .build();
    socket.add_event_listener(EventKind::Open, move |_| {
        let _ = open_tx.send(());
    });

    timeout(DEADLINE, open_rx.recv())
        .await
        .expect("open event within deadline")
        .expect("listener fired");
    assert!(socket.is_open());
    socket.close(None, None);
}
