use anyhow::Context;
use clap::{Parser, Subcommand};
use peerback_node::{ChannelAddrs, Channels, Peer, PeerConfig};
use peerback_protocol::{PeerId, SharedSecretKeys, Version};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug, Clone)]
#[command(name = "peerback-node", version, about = "Multicast peer-to-peer backup peer")]
struct Args {
    #[arg(long)]
    peer_id: u32,

    /// `1.0` runs the basic protocol, anything else the enhanced one.
    #[arg(long, default_value = "2.0")]
    protocol_version: Version,

    #[arg(long)]
    storage_path: Option<PathBuf>,

    #[arg(long, default_value = "224.0.0.200:8001")]
    control: SocketAddr,

    #[arg(long, default_value = "224.0.0.201:8002")]
    backup: SocketAddr,

    #[arg(long, default_value = "224.0.0.202:8003")]
    restore: SocketAddr,

    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    /// Address peers connect back to during enhanced restores. Defaults to
    /// `--interface`, or the address routing to the control group.
    #[arg(long)]
    advertise_ip: Option<IpAddr>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "PEERBACK_LOG_JSON")]
    log_json: bool,

    /// Group secret every peer derives its keys from.
    #[arg(long, env = "PEERBACK_SECRET")]
    secret: String,

    /// JSON file overriding protocol timings and limits.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    Backup { path: PathBuf, replication_degree: u8 },
    Restore { path: PathBuf },
    Delete { path: PathBuf },
    Reclaim { max_kb: u64 },
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let mut config = match &args.config {
        Some(path) => PeerConfig::load(path)?,
        None => PeerConfig::default(),
    };
    if let Some(path) = &args.storage_path {
        config.storage_path = path.clone();
    }
    config.advertise_ip = args
        .advertise_ip
        .or(config.advertise_ip)
        .or_else(|| advertise_ip_for(&args));
    info!(advertise_ip = ?config.advertise_ip, "restore callback address");

    let addrs = ChannelAddrs {
        control: args.control,
        backup: args.backup,
        restore: args.restore,
        interface: args.interface,
    };
    let channels = Channels::join_multicast(&addrs).context("failed to join multicast groups")?;
    let keys = SharedSecretKeys::new(args.secret.as_bytes());
    let peer = Peer::start(PeerId(args.peer_id), args.protocol_version, config, &keys, channels)
        .await
        .context("failed to start peer")?;

    if let Some(command) = args.command.clone() {
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = run_command(&peer, command).await {
                error!(error = %e, "operation failed");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    peer.shutdown().await;
    Ok(())
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn advertise_ip_for(args: &Args) -> Option<IpAddr> {
    if !args.interface.is_unspecified() {
        return Some(IpAddr::V4(args.interface));
    }
    // Connecting a UDP socket sends nothing; it only picks the outbound route.
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(args.control).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

async fn run_command(peer: &Arc<Peer>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Backup {
            path,
            replication_degree,
        } => {
            let outcome = peer.backup(&path, replication_degree).await?;
            info!(file_id = %outcome.file_id, chunks = outcome.chunk_count, "backup finished");
        }
        Command::Restore { path } => {
            let output = peer.restore(&path).await?;
            info!(output = %output.display(), "restore finished");
        }
        Command::Delete { path } => {
            let outcome = peer.delete(&path).await?;
            info!(file_id = %outcome.file_id, acknowledged = outcome.acknowledged.len(), "delete finished");
        }
        Command::Reclaim { max_kb } => {
            let outcome = peer.reclaim(max_kb).await?;
            info!(evicted = outcome.evicted.len(), used_bytes = outcome.used_bytes, "reclaim finished");
        }
        Command::Info => {
            println!("{}", serde_json::to_string_pretty(&peer.info())?);
        }
    }
    Ok(())
}
