//! # rollbackctl
//!
//! Sends one control signal to every coordinating instance reachable over
//! the configured transport.
//!
//! ```text
//! rollbackctl disable     # freeze commits
//! ...run the destructive test...
//! rollbackctl rollback    # undo everything, commits stay frozen
//! rollbackctl enable
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::Ipv4Addr;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use rollback_common::{ChannelMode, Signal};
use rollback_driver::{ChannelConfig, ControlClient, Transport};

/// Rollback driver control tool
#[derive(Parser, Debug)]
#[command(name = "rollbackctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file path
    #[arg(short, long, env = "ROLLBACK_CONFIG")]
    config: Option<String>,

    /// Transport mode (overrides config)
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Point-to-point listener host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Point-to-point listener port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Multicast group (overrides config)
    #[arg(short, long)]
    group: Option<Ipv4Addr>,

    /// Multicast port (overrides config)
    #[arg(long)]
    multicast_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Disable transactions and roll back every managed connection
    Rollback,
    /// Let commits through again
    Enable,
    /// Suppress commits and rollbacks
    Disable,
    /// Print the transport the current configuration resolves to
    Show,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Mode {
    /// Infer from the configured ports
    #[value(name = "none")]
    Infer,
    Local,
    Multicast,
    PointToPoint,
}

impl From<Mode> for ChannelMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Infer => ChannelMode::None,
            Mode::Local => ChannelMode::Local,
            Mode::Multicast => ChannelMode::Multicast,
            Mode::PointToPoint => ChannelMode::PointToPoint,
        }
    }
}

impl Command {
    fn signal(self) -> Option<Signal> {
        match self {
            Command::Rollback => Some(Signal::RollbackAll),
            Command::Enable => Some(Signal::EnableTransactions),
            Command::Disable => Some(Signal::DisableTransactions),
            Command::Show => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    let config = load_config(&args)?;
    let transport = config.resolve();

    let Some(signal) = args.command.signal() else {
        println!("{}", describe(&transport));
        return Ok(());
    };

    ensure_remote(&transport)?;

    let client = ControlClient::for_transport(&transport);
    client
        .send(signal)
        .await
        .with_context(|| format!("Failed to send {signal} over {}", client.channel_name()))?;

    info!(signal = %signal, transport = %describe(&transport), "Signal sent");
    Ok(())
}

/// Config file and environment, then command-line overrides
fn load_config(args: &Args) -> Result<ChannelConfig> {
    let mut config =
        ChannelConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if let Some(ref host) = args.host {
        config.socket.host = host.clone();
    }
    if let Some(port) = args.port {
        config.socket.port = port;
    }
    if let Some(group) = args.group {
        config.multicast.group = Some(group);
    }
    if let Some(port) = args.multicast_port {
        config.multicast.port = port;
    }

    Ok(config)
}

/// A local-only client would only reach this process, which has no instances
fn ensure_remote(transport: &Transport) -> Result<()> {
    if *transport == Transport::Local {
        bail!(
            "No remote transport configured, no instance can be reached; \
             set ROLLBACK_SOCKET__PORT or ROLLBACK_MULTICAST__PORT, or pass --mode"
        );
    }
    Ok(())
}

fn describe(transport: &Transport) -> String {
    match transport {
        Transport::Local => "local".to_string(),
        Transport::Multicast(target) => format!("multicast {target}"),
        Transport::PointToPoint(target) => format!("point_to_point {}:{}", target.host, target.port),
    }
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
