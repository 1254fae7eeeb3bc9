//! Punchline CLI
//!
//! Hosts the signaling relay, probes NAT behavior, and connects peers.

mod config;

use clap::{Parser, Subcommand};
use punchline_core::{Connection, Coordinator, FallbackMode};
use punchline_nat::{NatClassifier, StunServer};
use punchline_signal::signaling::Metadata;
use punchline_signal::{RelayServer, SignalEvent, SignalServer};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::Config;

/// How long `connect` waits for the target to show up in the room
const PEER_WAIT: Duration = Duration::from_secs(30);

/// How long `connect` waits for a reply to its message
const REPLY_WAIT: Duration = Duration::from_secs(5);

/// Punchline - NAT traversal and peer signaling
#[derive(Parser)]
#[command(name = "punchline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay, with optional datagram relay and STUN responder
    Serve {
        /// WebSocket listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Also run the datagram relay
        #[arg(long)]
        relay: bool,

        /// Also run a STUN responder
        #[arg(long)]
        stun: bool,
    },

    /// Run a standalone STUN responder
    Stun {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Probe and print local NAT behavior
    Detect,

    /// Connect to a peer through a shared room
    Connect {
        /// Target peer ID
        #[arg(required = true)]
        peer: String,

        /// Room to meet in
        #[arg(short, long)]
        room: Option<String>,

        /// Race every strategy instead of trying them in order
        #[arg(long)]
        parallel: bool,

        /// Message to send once connected
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Accept connections from peers and echo what they send
    Listen {
        /// Room to wait in
        #[arg(short, long)]
        room: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { bind, relay, stun } => serve(bind, relay, stun, &config).await?,
        Commands::Stun { bind } => run_stun(bind, &config).await?,
        Commands::Detect => detect(&config).await?,
        Commands::Connect {
            peer,
            room,
            parallel,
            message,
        } => connect(peer, room, parallel, message, &config).await?,
        Commands::Listen { room } => listen(room, &config).await?,
    }

    Ok(())
}

/// Run the signaling relay until Ctrl+C
async fn serve(
    bind: Option<String>,
    relay: bool,
    stun: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let mut server_config = config.signal_server_config()?;
    if let Some(bind) = bind {
        server_config.bind_addr = bind.parse()?;
    }

    let server = SignalServer::bind(server_config).await?;
    println!("Punchline signaling relay");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("WebSocket: ws://{}", server.local_addr());
    if let Some(http) = server.http_addr() {
        println!("HTTP: http://{http}");
    }
    let (handle, server_task) = server.spawn();

    if relay || config.relay.serve {
        let relay = RelayServer::bind_with_config(
            config.relay.listen_addr.parse()?,
            config.relay_server_config(),
        )
        .await?;
        println!("Datagram relay: {}", relay.local_addr());
        tokio::spawn(async move {
            if let Err(e) = relay.run().await {
                tracing::error!("datagram relay stopped: {e}");
            }
        });
    }

    if stun || config.stun.serve {
        let responder = StunServer::bind(config.stun.listen_addr.parse()?).await?;
        println!("STUN: {}", responder.local_addr()?);
        tokio::spawn(async move {
            if let Err(e) = responder.run().await {
                tracing::error!("STUN responder stopped: {e}");
            }
        });
    }

    println!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    let stats = handle.stats().await;
    tracing::info!(
        "relayed {} messages, evicted {} peers",
        stats.messages_relayed,
        stats.evictions
    );
    handle.shutdown("server shutting down");
    server_task.await??;

    Ok(())
}

/// Run a STUN responder until Ctrl+C
async fn run_stun(bind: Option<String>, config: &Config) -> anyhow::Result<()> {
    let addr = bind.unwrap_or_else(|| config.stun.listen_addr.clone()).parse()?;
    let responder = StunServer::bind(addr).await?;
    println!("STUN responder listening on {}", responder.local_addr()?);

    tokio::select! {
        result = responder.run() => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            println!("\nShutting down...");
        }
    }
    Ok(())
}

/// Print local NAT behavior as JSON
async fn detect(config: &Config) -> anyhow::Result<()> {
    let classifier = NatClassifier::new(config.classifier_config()?);
    let nat = classifier.detect().await?;
    println!("{}", serde_json::to_string_pretty(&nat)?);
    Ok(())
}

/// Start a coordinator, register, and join `room`
async fn join(config: &Config, room: &str, parallel: bool) -> anyhow::Result<Coordinator> {
    let mut coordinator_config = config.coordinator_config()?;
    if parallel {
        coordinator_config.fallback_mode = FallbackMode::Parallel;
    }

    let coordinator = Coordinator::start(coordinator_config).await?;
    let peer_id = config.peer.id.clone().unwrap_or_else(|| {
        format!("peer-{}", hex::encode(rand::random::<[u8; 4]>()))
    });

    coordinator.register_peer(&peer_id, Metadata::new()).await?;
    let members = coordinator.join_room(room).await?;

    println!("Peer: {peer_id}");
    println!(
        "NAT: {} (public endpoint {})",
        coordinator.nat_info().nat_type,
        coordinator.public_endpoint()
    );
    println!("Room: {room} ({} other members)", members.len());
    Ok(coordinator)
}

/// Connect to `peer`, optionally exchanging one message
async fn connect(
    peer: String,
    room: Option<String>,
    parallel: bool,
    message: Option<String>,
    config: &Config,
) -> anyhow::Result<()> {
    let room = room.unwrap_or_else(|| config.peer.room.clone());
    let coordinator = join(config, &room, parallel).await?;

    if let Some(mut events) = coordinator.events().await {
        tokio::time::timeout(PEER_WAIT, wait_for_peer(&coordinator, &mut events, &peer))
            .await
            .map_err(|_| anyhow::anyhow!("{peer} did not join {room} within {PEER_WAIT:?}"))??;
    }

    let result = exchange(&coordinator, &peer, message).await;
    coordinator.shutdown().await;
    result
}

async fn wait_for_peer(
    coordinator: &Coordinator,
    events: &mut mpsc::UnboundedReceiver<SignalEvent>,
    peer: &str,
) -> anyhow::Result<()> {
    if coordinator.peer(peer).await.is_some() {
        return Ok(());
    }
    println!("Waiting for {peer}...");
    while let Some(event) = events.recv().await {
        match event {
            SignalEvent::PeerJoined { peer: joined, .. } if joined.peer_id == peer => {
                return Ok(());
            }
            SignalEvent::Disconnected => break,
            _ => {}
        }
    }
    anyhow::bail!("signaling connection closed while waiting for {peer}")
}

async fn exchange(
    coordinator: &Coordinator,
    peer: &str,
    message: Option<String>,
) -> anyhow::Result<()> {
    let connection = coordinator.connect_to_peer(peer).await?;
    println!("{}", serde_json::to_string_pretty(connection.info())?);

    if let Some(message) = message {
        connection.send(message.as_bytes()).await?;
        let mut buf = vec![0u8; 64 * 1024];
        match tokio::time::timeout(REPLY_WAIT, connection.recv(&mut buf)).await {
            Ok(received) => {
                let len = received?;
                println!("Reply: {}", String::from_utf8_lossy(&buf[..len]));
            }
            Err(_) => println!("No reply within {REPLY_WAIT:?}"),
        }
    }

    let stats = coordinator.stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Accept connections until Ctrl+C, echoing every message
async fn listen(room: Option<String>, config: &Config) -> anyhow::Result<()> {
    let room = room.unwrap_or_else(|| config.peer.room.clone());
    let coordinator = join(config, &room, false).await?;
    let mut incoming = coordinator
        .incoming()
        .await
        .ok_or_else(|| anyhow::anyhow!("incoming connections already taken"))?;

    println!("Listening, press Ctrl+C to stop");
    loop {
        tokio::select! {
            connection = incoming.recv() => {
                let Some(connection) = connection else { break };
                println!(
                    "Accepted {} from {} via {}",
                    connection.id(),
                    connection.peer_id(),
                    connection.method()
                );
                tokio::spawn(echo(connection));
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                println!("\nShutting down...");
                break;
            }
        }
    }

    let health = coordinator.health().await;
    tracing::info!("final health: {:?}", health.status);
    coordinator.shutdown().await;
    Ok(())
}

async fn echo(connection: Connection) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let len = match connection.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                tracing::debug!("connection {} ended: {e}", connection.id());
                break;
            }
        };
        println!(
            "{}: {}",
            connection.peer_id(),
            String::from_utf8_lossy(&buf[..len])
        );
        if let Err(e) = connection.send(&buf[..len]).await {
            tracing::debug!("echo to {} failed: {e}", connection.peer_id());
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_connect() {
        let cli = Cli::try_parse_from([
            "punchline",
            "-v",
            "connect",
            "bob",
            "--room",
            "test",
            "--parallel",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Connect {
                peer, room, parallel, ..
            } => {
                assert_eq!(peer, "bob");
                assert_eq!(room.as_deref(), Some("test"));
                assert!(parallel);
            }
            _ => panic!("expected connect"),
        }
    }

    #[test]
    fn test_cli_requires_peer() {
        assert!(Cli::try_parse_from(["punchline", "connect"]).is_err());
    }
}
