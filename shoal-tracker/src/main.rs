use std::collections::HashSet;
use std::net::SocketAddr;

use clap::Parser;
use shoal::trackerd::{MemoryTracker, TrackerServer, TrackerServerConfig};
use shoal::Sha1;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "shoal-tracker", about = "BitTorrent tracker over HTTP and UDP")]
struct Args {
    /// HTTP listen address (announce at /announce, scrape at /scrape)
    #[arg(long, default_value = "0.0.0.0:6969")]
    http: SocketAddr,

    /// UDP listen address
    #[arg(long, default_value = "0.0.0.0:6969")]
    udp: SocketAddr,

    /// Disable the HTTP listener
    #[arg(long)]
    no_http: bool,

    /// Disable the UDP listener
    #[arg(long)]
    no_udp: bool,

    /// Announce interval handed to clients, in seconds
    #[arg(long, default_value_t = 900)]
    interval: u32,

    /// Only track these info-hashes (40 hex characters, repeatable)
    #[arg(long = "track")]
    track: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let filter = if args.track.is_empty() {
        None
    } else {
        let mut hashes = HashSet::new();
        for hex in &args.track {
            hashes.insert(hex.parse::<Sha1>()?);
        }
        Some(hashes)
    };

    let config = TrackerServerConfig {
        http_addr: (!args.no_http).then_some(args.http),
        udp_addr: (!args.no_udp).then_some(args.udp),
        filter,
    };
    let server = TrackerServer::bind(config).await?;

    if let Some(addr) = server.http_addr() {
        tracing::info!("http tracker listening on {addr}");
    }
    if let Some(addr) = server.udp_addr() {
        tracing::info!("udp tracker listening on {addr}");
    }

    let tracker = MemoryTracker::new(args.interval);
    tokio::select! {
        _ = tracker.serve(server) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    Ok(())
}
