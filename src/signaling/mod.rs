//! Relay signaling channel
//!
//! Owns the one persistent WebSocket connection to the relay: registers our
//! identity on every successful connect (before any other traffic), forwards
//! outbound messages, and dispatches parsed inbound messages. Reconnects
//! with exponential backoff on unexpected disconnects.

pub mod message;
pub mod websocket;

pub use self::message::{DecodeError, MessageType, SignalingMessage};

use anyhow::anyhow;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use self::websocket::RelaySocket;

/// Backoff cap for reconnection attempts.
const MAX_BACKOFF_SECS: u64 = 64;
/// A connection that lived this long resets the backoff.
const STABLE_AFTER: Duration = Duration::from_secs(60);

/// `send` was attempted while the relay link is down. Nothing is queued;
/// an in-progress call cannot be rescued by buffering stale signaling.
#[derive(Debug, Error)]
#[error("signaling channel unavailable")]
pub struct ChannelUnavailable;

/// Cheap cloneable handle for sending messages and observing connectivity.
#[derive(Clone)]
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    connected: watch::Receiver<bool>,
}

impl ChannelHandle {
    /// Queue a message on the open connection.
    ///
    /// Fails fast with [`ChannelUnavailable`] while disconnected.
    pub fn send(&self, message: SignalingMessage) -> Result<(), ChannelUnavailable> {
        if !*self.connected.borrow() {
            return Err(ChannelUnavailable);
        }
        self.outbound.send(message).map_err(|_| ChannelUnavailable)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch connectivity changes (`true` = connected and registered).
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

/// Start the channel task.
///
/// Inbound messages are delivered on `inbound` in arrival order; the
/// returned handle carries outbound traffic. The task runs until every
/// handle is dropped or the inbound consumer goes away.
pub fn start(
    relay_url: String,
    identity: String,
    inbound: mpsc::UnboundedSender<SignalingMessage>,
) -> (ChannelHandle, JoinHandle<()>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (connected_tx, connected_rx) = watch::channel(false);

    let handle = ChannelHandle {
        outbound: outbound_tx,
        connected: connected_rx,
    };
    let task = tokio::spawn(run_channel(
        relay_url,
        identity,
        inbound,
        outbound_rx,
        connected_tx,
    ));

    (handle, task)
}

/// Reason the inner connection loop exited.
enum ConnectionExit {
    /// Consumers are gone; stop for good.
    Shutdown,
    /// Error or relay-initiated close; reconnect.
    Lost(anyhow::Error),
}

/// Connection loop with automatic reconnection.
///
/// On transient errors or relay-initiated disconnects, reconnects with
/// exponential backoff (1s, 2s, 4s, ... capped at 64s). The backoff resets
/// after a connection that stayed up past the stability threshold.
async fn run_channel(
    relay_url: String,
    identity: String,
    inbound: mpsc::UnboundedSender<SignalingMessage>,
    mut outbound_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    connected_tx: watch::Sender<bool>,
) {
    let mut backoff = 1u64;

    loop {
        let connected_at = Instant::now();
        let exit = run_connection(
            &relay_url,
            &identity,
            &inbound,
            &mut outbound_rx,
            &connected_tx,
        )
        .await;
        let _ = connected_tx.send(false);

        match exit {
            ConnectionExit::Shutdown => {
                tracing::info!("Signaling channel shutting down");
                return;
            }
            ConnectionExit::Lost(e) => {
                if connected_at.elapsed() >= STABLE_AFTER {
                    backoff = 1;
                }
                tracing::warn!("Relay disconnected: {:#}. Reconnecting in {}s...", e, backoff);
                time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
            }
        }
    }
}

/// Run one connection: connect, register, then pump frames both ways.
async fn run_connection(
    relay_url: &str,
    identity: &str,
    inbound: &mpsc::UnboundedSender<SignalingMessage>,
    outbound_rx: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    connected_tx: &watch::Sender<bool>,
) -> ConnectionExit {
    let mut socket = match RelaySocket::connect(relay_url).await {
        Ok(socket) => socket,
        Err(e) => return ConnectionExit::Lost(e),
    };

    // Register before any other traffic so the relay can route to us.
    let registration = SignalingMessage::store_user(identity);
    if let Err(e) = socket.send(&registration).await {
        return ConnectionExit::Lost(e.context("Registration failed"));
    }
    tracing::info!("Registered with relay as {}", identity);

    // Discard sends that raced the disconnect; send() fails fast while down
    // and must not replay stale signaling after a reconnect.
    while outbound_rx.try_recv().is_ok() {}

    let _ = connected_tx.send(true);

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if let Err(e) = socket.send(&message).await {
                            return ConnectionExit::Lost(e);
                        }
                    }
                    None => return ConnectionExit::Shutdown,
                }
            }
            received = socket.recv() => {
                match received {
                    Ok(Some(message)) => {
                        if inbound.send(message).is_err() {
                            return ConnectionExit::Shutdown;
                        }
                    }
                    Ok(None) => {
                        return ConnectionExit::Lost(anyhow!("Relay closed the connection"));
                    }
                    Err(e) => return ConnectionExit::Lost(e),
                }
            }
        }
    }
}

/// Handle wired to raw channel ends, for exercising consumers without a
/// live connection.
#[cfg(test)]
pub(crate) fn handle_for_tests() -> (
    ChannelHandle,
    mpsc::UnboundedReceiver<SignalingMessage>,
    watch::Sender<bool>,
) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (connected_tx, connected_rx) = watch::channel(true);
    let handle = ChannelHandle {
        outbound: outbound_tx,
        connected: connected_rx,
    };
    (handle, outbound_rx, connected_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    type ServerStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    async fn accept_relay(listener: &TcpListener) -> ServerStream {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("timed out waiting for connection")
            .expect("accept failed");
        accept_async(stream).await.expect("websocket handshake failed")
    }

    async fn recv_message(server: &mut ServerStream) -> SignalingMessage {
        loop {
            let frame = timeout(Duration::from_secs(5), server.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .expect("websocket error");
            if let Message::Text(text) = frame {
                return SignalingMessage::decode(&text).expect("undecodable frame");
            }
        }
    }

    async fn wait_connected(handle: &ChannelHandle, want: bool) {
        let mut rx = handle.connectivity();
        timeout(Duration::from_secs(10), rx.wait_for(|up| *up == want))
            .await
            .expect("timed out waiting for connectivity change")
            .expect("channel task gone");
    }

    #[tokio::test]
    async fn test_registration_precedes_other_traffic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let (handle, _task) = start(format!("ws://{}", addr), "alice".into(), inbound_tx);

        let mut server = accept_relay(&listener).await;
        assert_eq!(
            recv_message(&mut server).await,
            SignalingMessage::store_user("alice")
        );
        wait_connected(&handle, true).await;

        handle
            .send(SignalingMessage::end_call("alice", "bob"))
            .unwrap();
        assert_eq!(recv_message(&mut server).await.kind, MessageType::EndCall);

        let offer = SignalingMessage::offer("bob", "alice", json!({"sdp": "v=0"}));
        server
            .send(Message::Text(offer.encode().unwrap()))
            .await
            .unwrap();
        let inbound = timeout(Duration::from_secs(5), inbound_rx.recv())
            .await
            .expect("timed out waiting for inbound message")
            .expect("inbound channel closed");
        assert_eq!(inbound, offer);
    }

    #[tokio::test]
    async fn test_undecodable_frame_keeps_connection_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let (handle, _task) = start(format!("ws://{}", addr), "alice".into(), inbound_tx);

        let mut server = accept_relay(&listener).await;
        recv_message(&mut server).await;
        wait_connected(&handle, true).await;

        server
            .send(Message::Text("{\"type\":\"nonsense\"}".into()))
            .await
            .unwrap();
        let end = SignalingMessage::end_call("bob", "alice");
        server.send(Message::Text(end.encode().unwrap())).await.unwrap();

        // The bad frame is swallowed; the next good one still arrives.
        let inbound = timeout(Duration::from_secs(5), inbound_rx.recv())
            .await
            .expect("timed out waiting for inbound message")
            .expect("inbound channel closed");
        assert_eq!(inbound, end);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn test_reconnect_reregisters_and_send_fails_fast_while_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let (handle, _task) = start(format!("ws://{}", addr), "alice".into(), inbound_tx);

        let server = accept_relay(&listener).await;
        wait_connected(&handle, true).await;
        drop(server);

        wait_connected(&handle, false).await;
        assert!(handle
            .send(SignalingMessage::end_call("alice", "bob"))
            .is_err());

        // First reconnect attempt comes after ~1s backoff; registration is
        // the first frame on the new connection.
        let mut server = accept_relay(&listener).await;
        assert_eq!(
            recv_message(&mut server).await,
            SignalingMessage::store_user("alice")
        );
        wait_connected(&handle, true).await;
    }
}
