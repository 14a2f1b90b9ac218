//! Client side of the signaling WebSocket.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::protocol::{ClientMessage, ServerMessage};
use super::SignalLink;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct SignalSocket {
    stream: WsStream,
}

impl SignalSocket {
    /// Connect to a coordinator. `http(s)://` URLs are accepted and mapped to `ws(s)://`.
    pub async fn connect(server_url: &str) -> Result<Self> {
        let ws_url = server_url
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        let ws_url = url::Url::parse(&ws_url).with_context(|| format!("Invalid server URL {ws_url}"))?;

        tracing::info!("Connecting WebSocket to {}", ws_url);

        let (stream, response) = connect_async(ws_url.as_str())
            .await
            .context("WebSocket connection failed")?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self { stream })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json().context("Failed to encode message")?;
        tracing::debug!("WS send: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Receive the next server message, answering pings and skipping
    /// frames that do not decode. `None` once the server closes.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    match ServerMessage::from_json(&text) {
                        Ok(message) => return Ok(Some(message)),
                        Err(e) => tracing::warn!("Ignoring undecodable frame: {}", e),
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

    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close failed: {}", e);
        }
    }
}

#[async_trait]
impl SignalLink for SignalSocket {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        SignalSocket::send(self, message).await
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        SignalSocket::recv(self).await
    }
}
