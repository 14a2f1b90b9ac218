//! WebSocket front end of the coordinator.
//!
//! Each accepted socket gets a task that forwards decoded frames to the
//! coordinator and writes whatever the coordinator routes to it. Closing
//! the socket, cleanly or not, is reported as a disconnect.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{ClientMessage, ServerMessage};
use super::{CoordinatorConfig, CoordinatorHandle, SignalingError};
use crate::config::Config;

pub struct SignalingServer {
    listener: TcpListener,
    coordinator: CoordinatorHandle,
}

impl SignalingServer {
    pub async fn bind(listen: &str, coordinator: CoordinatorHandle) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to listen on {listen}"))?;
        Ok(Self {
            listener,
            coordinator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Listener has no local address")
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    tracing::debug!(%peer, "New TCP connection");
                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, coordinator).await {
                            tracing::warn!(%peer, "Connection ended with error: {:#}", e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    tracing::info!("Signaling server stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, coordinator: CoordinatorHandle) -> Result<()> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (conn, mut outbound) = coordinator.attach();
    tracing::info!(%peer, conn, "Endpoint connected");

    let result: Result<()> = async {
        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                        Ok(message) => coordinator.send(conn, message),
                        Err(e) => {
                            let error = SignalingError::Protocol(e.to_string());
                            tracing::debug!(conn, "Rejecting frame: {}", error);
                            let reply = ServerMessage::Error {
                                message: error.to_string(),
                            };
                            ws.send(Message::Text(reply.to_json()?))
                                .await
                                .context("Failed to send error frame")?;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        ws.send(Message::Pong(data)).await.context("Failed to send pong")?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("WebSocket receive error"),
                },
                message = outbound.recv() => match message {
                    Some(message) => {
                        let text = message.to_json().context("Failed to encode message")?;
                        ws.send(Message::Text(text))
                            .await
                            .context("Failed to send WebSocket message")?;
                    }
                    None => return Ok(()),
                },
            }
        }
    }
    .await;

    coordinator.disconnect(conn);
    tracing::info!(%peer, conn, "Endpoint disconnected");
    result
}

/// Run the coordinator, its WebSocket listener and, when enabled, the
/// in-process bot until Ctrl+C.
pub async fn serve(config: &Config) -> Result<()> {
    let (coordinator, coordinator_task) = super::spawn(CoordinatorConfig::from(&config.server));
    let server = SignalingServer::bind(&config.server.listen, coordinator.clone()).await?;

    let bot = if config.server.bot_enabled {
        tracing::info!(code = %config.server.bot_code, "Starting in-process bot");
        Some(crate::bot::spawn_in_process(
            coordinator.clone(),
            &config.server.bot_code,
            &config.negotiation,
        ))
    } else {
        None
    };

    println!(
        "Signaling server listening on ws://{} (Ctrl-C to stop)",
        server.local_addr()?
    );
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("Shutting down...");
        })
        .await?;

    if let Some(bot) = bot {
        bot.abort();
    }
    coordinator_task.abort();
    Ok(())
}
