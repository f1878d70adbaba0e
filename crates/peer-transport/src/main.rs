//! peer-daemon: run an echo server, or call a set of peers round-robin.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peer_core::{BoundList, PeerIdentifier, PeerList, RoundRobin, Transport};
use peer_transport::{Echo, Outbound, TransportConfig, WsTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "peer-daemon")]
#[command(about = "Maintained peer connections over WebSocket")]
struct Args {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the echo procedure until Ctrl+C
    Serve {
        /// Address to listen on for incoming connections
        #[arg(short, long, default_value = "127.0.0.1:4040")]
        listen: String,

        /// Service name both ends must agree on
        #[arg(long)]
        service: Option<String>,
    },

    /// Call the echo procedure on a set of peers, round-robin
    Call {
        /// Peer address (host:port); repeat for several peers
        #[arg(short, long = "peer", required = true)]
        peers: Vec<PeerIdentifier>,

        /// Number of calls to make
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,

        /// Per-call timeout in milliseconds
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,

        /// Service name both ends must agree on
        #[arg(long)]
        service: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,peer_core=debug,peer_transport=debug"
    } else {
        "info,peer_core=info,peer_transport=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Serve { listen, service } => serve(listen, service).await,
        Command::Call {
            peers,
            count,
            timeout_ms,
            service,
        } => call(peers, count, Duration::from_millis(timeout_ms), service).await,
    }
}

fn config(listen: &str, service: Option<String>) -> Result<TransportConfig> {
    let mut builder = TransportConfig::builder().listen_addr(listen);
    if let Some(service) = service {
        builder = builder.service_name(service);
    }
    builder.build().context("Invalid transport configuration")
}

async fn serve(listen: String, service: Option<String>) -> Result<()> {
    let transport = WsTransport::new(config(&listen, service)?);
    let addr = transport.start().await?;
    transport.register("echo", Arc::new(Echo::new(addr.to_string())));

    info!("Serving {} on {}. Press Ctrl+C to stop.", transport.service_name(), addr);
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    transport.stop().await;
    Ok(())
}

async fn call(
    peers: Vec<PeerIdentifier>,
    count: usize,
    timeout: Duration,
    service: Option<String>,
) -> Result<()> {
    let transport = Arc::new(WsTransport::new(config("127.0.0.1:0", service)?));
    let addr = transport.start().await?;
    transport.register("echo", Arc::new(Echo::new(addr.to_string())));

    let list = RoundRobin::new(Arc::clone(&transport) as Arc<dyn Transport>);
    let bound = BoundList::bind(list, peers)?;
    let outbound = Outbound::new(Arc::clone(&transport), bound.list().clone());

    let mut failures = 0;
    for i in 0..count {
        match outbound.call("echo", json!({ "seq": i }), timeout).await {
            Ok(reply) => {
                let peer = reply["peer"].as_str().unwrap_or("?");
                info!("Call {} answered by {}", i, peer);
                println!("{peer}");
            }
            Err(e) => {
                failures += 1;
                warn!("Call {} failed: {}", i, e);
            }
        }
    }

    let snapshot = bound.list().introspect();
    info!("Peer list: {}", serde_json::to_string(&snapshot)?);

    if let Err(e) = bound.unbind() {
        error!("Failed to release peers: {}", e);
    }
    transport.stop().await;

    if failures > 0 {
        anyhow::bail!("{} of {} call(s) failed", failures, count);
    }
    Ok(())
}
