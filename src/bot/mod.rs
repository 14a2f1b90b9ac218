//! The bot participant: a headless endpoint under the reserved code that the
//! coordinator pulls into calls.
//!
//! It runs either inside the server process over a `LocalLink`, or as a
//! separate process over the WebSocket with automatic reconnection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::calling::agent::{AgentCommand, AgentConfig, AgentExit, AgentRole, CallAgent};
use crate::calling::supervisor::SupervisorConfig;
use crate::calling::transport::TransportFactory;
use crate::calling::udp_transport::UdpTransportFactory;
use crate::config::NegotiationConfig;
use crate::signaling::websocket::SignalSocket;
use crate::signaling::CoordinatorHandle;

pub struct BotParticipant {
    agent: CallAgent,
    commands_tx: mpsc::UnboundedSender<AgentCommand>,
    commands: mpsc::UnboundedReceiver<AgentCommand>,
}

impl BotParticipant {
    pub fn new(code: &str, negotiation: &NegotiationConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let config = AgentConfig {
            code: code.to_string(),
            role: AgentRole::Bot,
            bot_code: code.to_string(),
            supervisor: SupervisorConfig::from(negotiation),
        };
        let (commands_tx, commands) = mpsc::unbounded_channel();
        Self {
            agent: CallAgent::new(config, factory),
            commands_tx,
            commands,
        }
    }

    /// Bot using real UDP ICE transports.
    pub fn with_udp(code: &str, negotiation: &NegotiationConfig) -> Self {
        Self::new(code, negotiation, Arc::new(UdpTransportFactory::new(negotiation)))
    }

    /// Sender for stopping the bot; `Shutdown` closes every leg.
    pub fn commands(&self) -> mpsc::UnboundedSender<AgentCommand> {
        self.commands_tx.clone()
    }

    /// Serve through the coordinator directly, until shut down or the
    /// coordinator stops.
    pub async fn run_in_process(mut self, coordinator: CoordinatorHandle) -> Result<()> {
        let mut link = coordinator.local_link();
        let exit = self.agent.run(&mut link, &mut self.commands).await?;
        tracing::info!(?exit, "Bot stopped");
        Ok(())
    }

    /// Serve over the WebSocket, reconnecting with exponential backoff
    /// (1s, 2s, 4s, ... capped at 64s). A session that stayed up for a
    /// minute resets the backoff. Ctrl+C stops it.
    pub async fn run_remote(mut self, server_url: &str) -> Result<()> {
        let stop = self.commands();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("Shutting down...");
                let _ = stop.send(AgentCommand::Shutdown);
            }
        });

        let stability_threshold = Duration::from_secs(60);
        let mut backoff = 1u64;

        loop {
            let connected_at = Instant::now();
            match self.run_once(server_url).await {
                Ok(AgentExit::Shutdown) => return Ok(()),
                Ok(AgentExit::LinkClosed) => {
                    tracing::warn!("Coordinator closed the connection. Reconnecting in {}s...", backoff)
                }
                Err(e) => {
                    tracing::warn!("Bot disconnected: {:#}. Reconnecting in {}s...", e, backoff)
                }
            }
            if connected_at.elapsed() >= stability_threshold {
                backoff = 1;
            }

            tokio::select! {
                _ = time::sleep(Duration::from_secs(backoff)) => {}
                command = self.commands.recv() => {
                    if matches!(command, Some(AgentCommand::Shutdown) | None) {
                        return Ok(());
                    }
                }
            }
            backoff = (backoff * 2).min(64);
        }
    }

    async fn run_once(&mut self, server_url: &str) -> Result<AgentExit> {
        let mut socket = SignalSocket::connect(server_url).await?;
        let exit = self.agent.run(&mut socket, &mut self.commands).await;
        socket.close().await;
        exit
    }
}

/// Host the bot inside the server process under `code`.
pub fn spawn_in_process(
    coordinator: CoordinatorHandle,
    code: &str,
    negotiation: &NegotiationConfig,
) -> JoinHandle<()> {
    let bot = BotParticipant::with_udp(code, negotiation);
    tokio::spawn(async move {
        if let Err(e) = bot.run_in_process(coordinator).await {
            tracing::error!("Bot failed: {:#}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::transport::testing::{Script, ScriptedFactory};
    use crate::calling::SessionDescription;
    use crate::signaling::protocol::{ClientMessage, ServerMessage};
    use crate::signaling::{self, CoordinatorConfig, SignalLink};

    fn negotiation() -> NegotiationConfig {
        NegotiationConfig {
            offer_debounce_ms: 0,
            stun_server: None,
            ..Default::default()
        }
    }

    async fn next(link: &mut signaling::LocalLink) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), link.recv())
            .await
            .expect("timed out")
            .unwrap()
            .expect("link closed")
    }

    #[tokio::test]
    async fn test_direct_call_is_answered_and_ends_with_bot() {
        let (coordinator, _task) = signaling::spawn(CoordinatorConfig {
            bot_enabled: true,
            ..Default::default()
        });
        let factory = Arc::new(ScriptedFactory::new(Script::default()));
        let bot = BotParticipant::new("000", &negotiation(), factory.clone());
        let stop = bot.commands();
        let bot_task = tokio::spawn(bot.run_in_process(coordinator.clone()));

        let mut a = coordinator.local_link();
        a.send(&ClientMessage::Join { code: "A".into() }).await.unwrap();
        assert_eq!(next(&mut a).await, ServerMessage::Joined { code: "A".into() });

        // Let the bot register before dialing it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.send(&ClientMessage::CallInitiate {
            target_code: "000".into(),
            caller_code: "A".into(),
            offer: SessionDescription::offer("v=0 from A"),
        })
        .await
        .unwrap();

        let answered = loop {
            match next(&mut a).await {
                ServerMessage::CallAnswered { answer, from_code } => break (answer, from_code),
                ServerMessage::IceCandidate { .. } => continue,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(answered.1, "000");
        assert!(!answered.0.is_offer());
        assert_eq!(
            factory.script.lock().unwrap().remote,
            vec![SessionDescription::offer("v=0 from A")]
        );

        stop.send(AgentCommand::Shutdown).unwrap();
        bot_task.await.unwrap().unwrap();
        let ended = loop {
            match next(&mut a).await {
                ServerMessage::IceCandidate { .. } => continue,
                other => break other,
            }
        };
        assert_eq!(ended, ServerMessage::CallEnded { from_code: "000".into() });
        assert_eq!(factory.script.lock().unwrap().closed, 1);
    }
}
