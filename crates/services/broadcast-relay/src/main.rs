//! Broadcast relay binary entry point
//!
//! Hosts the JSON-RPC 2.0 WebSocket relay that broadcasters and viewers
//! register with.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address (0.0.0.0:8080)
//! cargo run -p remotemedia-broadcast-relay
//!
//! # Custom address with JSON logs
//! BROADCAST_RELAY_PORT=9000 cargo run -p remotemedia-broadcast-relay -- --log-json
//! ```

use anyhow::Context;
use clap::Parser;
use remotemedia_broadcast::RelayServer;
use std::net::{IpAddr, SocketAddr};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// RemoteMedia broadcast relay
///
/// Registers one identity per connection and forwards signals between them.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0", env = "BROADCAST_RELAY_HOST")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "BROADCAST_RELAY_PORT")]
    port: u16,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "BROADCAST_RELAY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        library = remotemedia_broadcast::version(),
        "Broadcast relay starting"
    );

    let addr = SocketAddr::new(args.host, args.port);
    let handle = RelayServer::new()
        .bind(addr)
        .await
        .with_context(|| format!("failed to bind relay on {}", addr))?;

    info!("Relay listening on {}", handle.url());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("Shutdown requested");
    handle.shutdown().await;
    info!("Relay stopped");
    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    // RUST_LOG wins; default to info
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("invalid log filter")?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}
