//! carlink CLI - talk to a head unit from the command line
//!
//! Open sessions, stream raw PCM, and inspect SLIP frames.

use anyhow::{Context, Result};
use carlink_session::SessionConfig;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod codec;
mod config;
mod connect;
mod pcm;

use codec::{FunctionArg, ServiceArg};
use config::CliConfig;

/// carlink - head-unit connectivity client
#[derive(Parser)]
#[command(name = "carlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "CARLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a session to a head unit
    Connect {
        /// Transport (tcp, accessory, bluetooth)
        #[arg(short, long)]
        transport: Option<String>,

        /// Head unit host for tcp
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Head unit port for tcp
        #[arg(short = 'P', long)]
        port: Option<u16>,

        /// Device node for accessory and bluetooth
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Send a HEARTBEAT every N seconds
        #[arg(long)]
        heartbeat: Option<u64>,

        /// Raw PCM file to stream once the session is up
        #[arg(long)]
        play: Option<PathBuf>,

        /// Request the PCM service encrypted
        #[arg(long)]
        encrypted: bool,
    },

    /// Encode a packet as a hex SLIP frame
    Encode {
        /// Service type
        #[arg(short, long, value_enum, default_value = "rpc")]
        service: ServiceArg,

        /// Session id
        #[arg(short = 'i', long, default_value = "1")]
        session: u8,

        /// CONTROL function
        #[arg(short, long, value_enum)]
        function: Option<FunctionArg>,

        /// Protocol version
        #[arg(long = "protocol", default_value = "5")]
        protocol_version: u8,

        /// Payload as hex
        #[arg(default_value = "")]
        payload: String,
    },

    /// Decode hex SLIP frames
    Decode {
        /// Frame bytes as hex
        frames: String,
    },

    /// Show version and defaults
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs)?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(()).await;
        }
    });

    match cli.command {
        Commands::Connect {
            transport,
            host,
            port,
            device,
            heartbeat,
            play,
            encrypted,
        } => {
            let mut config = CliConfig::load(cli.config.as_deref())?;
            if let Some(kind) = transport {
                config.transport.kind = kind;
            }
            if let Some(host) = host {
                config.transport.host = host;
            }
            if let Some(port) = port {
                config.transport.port = port;
            }
            if let Some(device) = device {
                config.transport.device = Some(device.display().to_string());
            }
            if let Some(interval) = heartbeat {
                config.session.heartbeat_interval_secs = interval;
            }

            let mut session = SessionConfig::new(config.transport()?)
                .with_heartbeat(config.heartbeat());
            session.version = config.session.version;

            connect::run(
                connect::ConnectOptions {
                    session,
                    audio: config.audio(),
                    play,
                    encrypted,
                },
                &mut shutdown_rx,
            )
            .await?;
        }

        Commands::Encode {
            service,
            session,
            function,
            protocol_version,
            payload,
        } => {
            let frame =
                codec::encode_frame(service, session, function, protocol_version, &payload)?;
            println!("{}", frame);
        }

        Commands::Decode { frames } => {
            let packets = codec::decode_frames(&frames)?;
            if packets.is_empty() {
                println!("{}", "No complete frames".yellow());
            }
            for (index, packet) in packets.iter().enumerate() {
                codec::print_packet(index, packet);
            }
        }

        Commands::Info => {
            print_info();
        }
    }

    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}

fn print_info() {
    println!("{}", "carlink - head-unit connectivity client".cyan().bold());
    println!();
    println!("Version:    {}", env!("CARGO_PKG_VERSION"));
    println!(
        "Protocol:   v{} (max v{})",
        carlink_core::DEFAULT_PROTOCOL_VERSION,
        carlink_core::MAX_PROTOCOL_VERSION
    );
    println!(
        "Config:     {}",
        config::default_config_file().display()
    );
    println!();
    println!("{}", "Transports:".green());
    println!(
        "  - tcp        (default {}:{})",
        carlink_core::DEFAULT_PEER_ADDR,
        carlink_core::DEFAULT_TCP_PORT
    );
    println!("  - accessory  (USB accessory device node)");
    println!("  - bluetooth  (RFCOMM serial device node)");
    println!();
    println!("{}", "Examples:".green());
    println!("  carlink connect --host 10.0.0.2                # Open a session");
    println!("  carlink connect --play tone.pcm                # Stream raw PCM");
    println!("  carlink encode -s control -f heartbeat         # Build a frame");
    println!("  carlink decode c00501002000000000c955c0        # Inspect frames");
}
