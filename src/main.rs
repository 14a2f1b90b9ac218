//! peercall - signaling coordinator for peer-to-peer audio calls
//!
//! Routes call setup between endpoints identified by short caller codes and
//! can pull a bot participant into every call.

mod bot;
mod calling;
mod config;
mod phone;
mod signaling;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;

#[derive(Parser)]
#[command(name = "peercall")]
#[command(about = "Signaling coordinator and endpoints for peer-to-peer audio calls", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling coordinator
    Serve {
        /// Address to listen on (overrides config)
        #[arg(short, long)]
        listen: Option<String>,

        /// Do not host the bot or inject it into calls
        #[arg(long)]
        no_bot: bool,
    },

    /// Run the bot participant against a remote coordinator
    Bot {
        /// Coordinator URL (overrides config)
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Headless phone: register a code, place or take a call
    Phone {
        /// Caller code to register under
        #[arg(long)]
        code: String,

        /// Code to dial after joining
        #[arg(long)]
        call: Option<String>,

        /// Answer incoming calls instead of declining them
        #[arg(long)]
        auto_answer: bool,

        /// Hang up and exit after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Coordinator URL (overrides config)
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Write the effective configuration to disk
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = cli.config.as_deref();
    let mut config = Config::load(config_path)?;

    match cli.command {
        Commands::Serve { listen, no_bot } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if no_bot {
                config.server.bot_enabled = false;
            }
            tracing::info!("Starting signaling server...");
            signaling::server::serve(&config).await?;
        }
        Commands::Bot { server } => {
            let url = server.unwrap_or_else(|| config.client.server_url.clone());
            tracing::info!(code = %config.server.bot_code, "Starting bot against {}", url);
            bot::BotParticipant::with_udp(&config.server.bot_code, &config.negotiation)
                .run_remote(&url)
                .await?;
        }
        Commands::Phone {
            code,
            call,
            auto_answer,
            duration,
            server,
        } => {
            if let Some(server) = server {
                config.client.server_url = server;
            }
            let options = phone::PhoneOptions {
                code,
                call,
                auto_answer,
                duration: duration.map(Duration::from_secs),
            };
            phone::run(&config, options).await?;
        }
        Commands::Config { init } => {
            let path = Config::resolve_path(config_path)?;
            if init {
                let written = config.save(config_path)?;
                println!("Wrote {}", written.display());
            } else {
                println!("# {}", path.display());
                print!("{}", config.to_toml()?);
            }
        }
    }

    Ok(())
}
