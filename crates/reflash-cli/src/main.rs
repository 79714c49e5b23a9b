//! reflash - UDS diagnostics and OTA reflash over CAN
//!
//! Thin command-line front end for `reflash-uds`: one-shot diagnostic
//! commands plus the long-running flash and scenario drivers with live
//! progress output.

mod commands;
mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reflash_uds::config::{ClientConfig, SocketCanConfig, TransportConfig};
use reflash_uds::event::EventBus;
use reflash_uds::session::{Addressing, UdsChannel};
use reflash_uds::transport::create_adapter;
use reflash_uds::uds::UdsClient;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::output::OutputContext;

#[derive(Parser)]
#[command(name = "reflash")]
#[command(author, version, about = "UDS diagnostics and OTA reflash over CAN")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "REFLASH_CONFIG")]
    config: Option<PathBuf>,

    /// SocketCAN interface to use, overriding the configured transport
    #[arg(short, long, env = "REFLASH_INTERFACE")]
    interface: Option<String>,

    /// Turn off colored output
    #[arg(long)]
    no_color: bool,

    /// Print results only, no progress lines
    #[arg(short, long)]
    quiet: bool,

    /// Debug-level logging for the client stack
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Change the diagnostic session
    Session {
        /// Session type: default, extended, programming
        #[arg(value_name = "TYPE")]
        session_type: String,

        /// Broadcast the request to all ECUs
        #[arg(long)]
        functional: bool,

        /// Set the suppress-positive-response bit
        #[arg(long)]
        suppress: bool,
    },

    /// Read a data identifier
    Read {
        /// Data identifier (hex, e.g. 0xF190)
        did: String,
    },

    /// Unlock security access
    Unlock {
        /// Security level (hex, e.g. 0x11); defaults to the configured level
        #[arg(long)]
        level: Option<String>,
    },

    /// Flash a firmware image
    Flash {
        /// Path to the firmware image
        file: PathBuf,
    },

    /// Run the automated diagnostic scenario
    Scenario {
        /// Number of rounds, -1 to repeat until interrupted
        #[arg(long)]
        repeat: Option<i32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("reflash=debug,reflash_uds=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load config and apply CLI overrides
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(interface) = &cli.interface {
        config.transport = TransportConfig::SocketCan(SocketCanConfig {
            interface: interface.clone(),
            ..SocketCanConfig::default()
        });
    }

    let ctx = OutputContext::new(cli.no_color, cli.quiet);
    let client = connect(&config).await?;

    match &cli.command {
        Commands::Session {
            session_type,
            functional,
            suppress,
        } => {
            commands::session(&client, session_type, *functional, *suppress, &ctx).await?;
        }

        Commands::Read { did } => {
            commands::read(&client, did, &ctx).await?;
        }

        Commands::Unlock { level } => {
            commands::unlock(&client, &config, level.as_deref(), &ctx).await?;
        }

        Commands::Flash { file } => {
            commands::flash(client, &config, file, &ctx).await?;
        }

        Commands::Scenario { repeat } => {
            let mut config = config.clone();
            if let Some(repeat) = repeat {
                config.scenario.repeat_count = *repeat;
            }
            commands::scenario(client, &config, &ctx).await?;
        }
    }

    Ok(())
}

/// Bring up the transport and wrap it in a service client.
async fn connect(config: &ClientConfig) -> Result<Arc<UdsClient>> {
    let adapter = create_adapter(&config.transport)
        .await
        .context("Failed to open CAN transport")?;
    let addressing =
        Addressing::from_config(&config.addressing).context("Invalid addressing configuration")?;
    let channel = UdsChannel::new(adapter, addressing, &config.timing, EventBus::new());
    Ok(Arc::new(UdsClient::new(channel, config.security.algorithm)))
}
