//! vless-client: VLESS-over-WebSocket tunnel client
//!
//! Parses connection strings, probes servers, and runs a tunnel whose
//! packet side is a UDP socket paired with a local TUN bridge.

mod udp;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use udp::UdpInterface;
use vless_tunnel::{
    ClientSettings, FailureReason, LifecycleObserver, LifecycleStatus, SessionState, TlsMode,
    TunnelConfiguration, TunnelSession,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "vless-client", version, about = "VLESS-over-WebSocket tunnel client")]
struct Cli {
    /// Settings file (.toml or .json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "vless_tunnel=trace"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a connection string and print it as JSON
    Parse { uri: String },

    /// Check that the server accepts TCP connections
    Probe {
        uri: String,

        /// Override the probe deadline
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Run a tunnel until interrupted
    Connect {
        uri: String,

        /// UDP address of the local packet bridge
        #[arg(long)]
        peer: SocketAddr,

        /// Local UDP address to bind
        #[arg(long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,

        /// Accept any server certificate
        #[arg(long)]
        insecure: bool,
    },
}

/// Logs lifecycle notifications
struct LogObserver;

impl LifecycleObserver for LogObserver {
    fn on_status(&self, status: LifecycleStatus) {
        info!("Status: {:?}", status);
    }

    fn on_error(&self, reason: FailureReason, detail: &str) {
        error!("{}: {}", reason, detail);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => ClientSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ClientSettings::default(),
    };

    init_logging(cli.log_level.as_deref(), &settings.logging.level)?;

    match cli.command {
        Command::Parse { uri } => {
            let config = TunnelConfiguration::parse(&uri)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Probe { uri, timeout_secs } => {
            let config = TunnelConfiguration::parse(&uri)?;
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.tunnel.probe_timeout());

            if !vless_tunnel::probe(&config.server_host, config.server_port, timeout).await {
                bail!("{} is unreachable", config.server_addr());
            }
            println!("{} is reachable", config.server_addr());
        }
        Command::Connect {
            uri,
            peer,
            bind,
            insecure,
        } => {
            if insecure {
                settings.tunnel.tls = TlsMode::InsecureAcceptAny;
            }
            run_tunnel(&uri, peer, bind, settings).await?;
        }
    }

    Ok(())
}

/// `--log-level` wins, then `RUST_LOG`, then the settings file
fn init_logging(cli_level: Option<&str>, settings_level: &str) -> Result<()> {
    let filter = match cli_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(settings_level)?,
        },
    };

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

async fn run_tunnel(
    uri: &str,
    peer: SocketAddr,
    bind: SocketAddr,
    settings: ClientSettings,
) -> Result<()> {
    let socket = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    let iface = UdpInterface::new(socket, peer);
    info!("Packet interface on {} <-> {}", iface.local_addr()?, peer);

    let session = TunnelSession::from_settings(Arc::new(iface), settings);
    session.add_observer(Arc::new(LogObserver));

    session.connect(uri).await?;
    if session.state().is_connected() {
        info!("Tunnel up, press Ctrl-C to disconnect");
    }

    let mut state = session.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, disconnecting");
            session.disconnect().await;
        }
        _ = state.wait_for(|s| s.is_terminal()) => {
            warn!("Tunnel ended: {}", session.state());
        }
    }

    info!("{}", session.stats().format());
    if let SessionState::Failed(_) = session.state() {
        bail!(session.last_error().unwrap_or_else(|| "tunnel failed".to_string()));
    }
    Ok(())
}
