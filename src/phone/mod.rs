//! Headless human endpoint for the command line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::calling::agent::{AgentCommand, AgentConfig, AgentEvent, AgentExit, AgentRole, CallAgent};
use crate::calling::supervisor::{Connectivity, SupervisorConfig};
use crate::calling::udp_transport::UdpTransportFactory;
use crate::config::Config;
use crate::signaling::protocol::CallerCode;
use crate::signaling::websocket::SignalSocket;

#[derive(Debug, Clone)]
pub struct PhoneOptions {
    pub code: CallerCode,
    /// Dial this code right after joining; the phone exits when that call ends.
    pub call: Option<CallerCode>,
    pub auto_answer: bool,
    /// Hang up and exit after this long.
    pub duration: Option<Duration>,
}

pub async fn run(config: &Config, options: PhoneOptions) -> Result<()> {
    anyhow::ensure!(!options.code.is_empty(), "Caller code must not be empty");
    anyhow::ensure!(
        options.code != config.server.bot_code,
        "Code {} is reserved for the bot",
        options.code
    );

    let factory = Arc::new(UdpTransportFactory::new(&config.negotiation));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut agent = CallAgent::new(
        AgentConfig {
            code: options.code.clone(),
            role: AgentRole::Human {
                auto_answer: options.auto_answer,
            },
            bot_code: config.server.bot_code.clone(),
            supervisor: SupervisorConfig::from(&config.negotiation),
        },
        factory,
    )
    .with_observer(events_tx);

    let (commands_tx, mut commands) = mpsc::unbounded_channel();
    if let Some(target) = &options.call {
        let _ = commands_tx.send(AgentCommand::Dial(target.clone()));
    }

    let stop = commands_tx.clone();
    let dialed = options.call.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", describe(&event));
            let finished = match (&event, &dialed) {
                (AgentEvent::Declined(remote), Some(target)) => remote == target,
                (AgentEvent::Ended { remote, .. }, Some(target)) => remote == target,
                _ => false,
            };
            if finished {
                let _ = stop.send(AgentCommand::Shutdown);
            }
        }
    });

    let stop = commands_tx.clone();
    let duration = options.duration;
    tokio::spawn(async move {
        match duration {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => println!("Time is up, hanging up..."),
                    _ = tokio::signal::ctrl_c() => println!("Shutting down..."),
                }
            }
            None => {
                if tokio::signal::ctrl_c().await.is_ok() {
                    println!("Shutting down...");
                }
            }
        }
        let _ = stop.send(AgentCommand::Shutdown);
    });

    let mut socket = SignalSocket::connect(&config.client.server_url)
        .await
        .context("Could not reach the coordinator")?;
    println!(
        "Connected as {}. {}",
        options.code,
        if options.auto_answer {
            "Answering incoming calls. (Ctrl-C to stop)"
        } else {
            "Declining incoming calls. (Ctrl-C to stop)"
        }
    );

    let exit = agent.run(&mut socket, &mut commands).await?;
    socket.close().await;
    if exit == AgentExit::LinkClosed {
        println!("Coordinator closed the connection");
    }
    Ok(())
}

fn describe(event: &AgentEvent) -> String {
    match event {
        AgentEvent::Joined(code) => format!("Registered as {code}"),
        AgentEvent::Ringing(code) => format!("Incoming call from {code}"),
        AgentEvent::Answered(code) => format!("{code} answered"),
        AgentEvent::Declined(code) => format!("{code} declined the call"),
        AgentEvent::Connectivity { remote, state } => match state {
            Connectivity::Connected => format!("Media path to {remote} is up"),
            Connectivity::Failed => format!("Media path to {remote} failed"),
            other => format!("Media path to {remote}: {other:?}"),
        },
        AgentEvent::Ended { remote, reason } => format!("Call with {remote} ended ({reason})"),
    }
}
