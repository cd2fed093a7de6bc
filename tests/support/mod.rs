//! In-process WebSocket servers backing the integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

/// Route test logging through env_logger (`RUST_LOG=debug` to see it).
pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Spawn a relay that forwards every text/binary message from one connection
/// to every *other* connection, mirroring the dev server's broadcast
/// endpoint. Runs until the test runtime is torn down.
pub async fn spawn_broadcast_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (relay_tx, _) = broadcast::channel::<(usize, Message)>(64);

    tokio::spawn(async move {
        let mut next_id = 0usize;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            next_id += 1;
            let id = next_id;
            let relay_tx = relay_tx.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut write, mut read) = ws.split();
                let mut relay_rx = relay_tx.subscribe();
                loop {
                    tokio::select! {
                        inbound = read.next() => match inbound {
                            Some(Ok(Message::Ping(payload))) => {
                                if write.send(Message::Pong(payload)).await.is_err() {
                                    return;
                                }
                            }
                            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                                let _ = relay_tx.send((id, msg));
                            }
                            Some(Ok(_)) => {}
                            _ => return,
                        },
                        relayed = relay_rx.recv() => {
                            let Ok((sender, msg)) = relayed else {
                                continue;
                            };
                            if sender != id && write.send(msg).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Spawn a server that records every text/binary message it receives.
///
/// With `reject_first` the first TCP connection is dropped before the
/// WebSocket handshake, forcing the client through one reconnect cycle.
pub async fn spawn_capture_server(
    reject_first: bool,
) -> (SocketAddr, mpsc::UnboundedReceiver<Message>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (record_tx, record_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        if reject_first {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        }
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let record_tx = record_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Ping(payload) => {
                            if ws.send(Message::Pong(payload)).await.is_err() {
                                return;
                            }
                        }
                        Message::Text(_) | Message::Binary(_) => {
                            let _ = record_tx.send(msg);
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    (addr, record_rx)
}
