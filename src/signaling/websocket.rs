//! Relay WebSocket connection and frame handling

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::message::SignalingMessage;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct RelaySocket {
    stream: WsStream,
}

impl RelaySocket {
    /// Connect to the relay WebSocket endpoint.
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::info!("Connecting WebSocket to {}", url);

        let (stream, response) = connect_async(url)
            .await
            .context("WebSocket connection failed")?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self { stream })
    }

    /// Encode and send one signaling message as a text frame.
    pub async fn send(&mut self, message: &SignalingMessage) -> Result<()> {
        let frame = message.encode().context("Failed to encode message")?;
        tracing::debug!("WS send: {}", frame);
        self.stream
            .send(Message::Text(frame))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Receive the next parsed signaling message.
    ///
    /// Malformed frames are logged and dropped without tearing down the
    /// connection. Pings are answered, pongs and binary frames ignored.
    /// Returns `Ok(None)` when the relay closes the connection.
    pub async fn recv(&mut self) -> Result<Option<SignalingMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    match SignalingMessage::decode(&text) {
                        Ok(message) => return Ok(Some(message)),
                        Err(e) => {
                            tracing::warn!("Dropping undecodable frame: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }
}
