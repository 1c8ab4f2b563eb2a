// SPDX-License-Identifier: MIT OR Apache-2.0

//! punchrelay relay server
//!
//! Run with: cargo run --bin punchrelay-relay -- --port 9050

use anyhow::{Context, Result};
use clap::Parser;
use punchrelay_network::config::{load_config, ServerConfig, ServerOverrides};
use punchrelay_network::{logging, run_until, RelayServer, TcpTransport, TcpTransportConfig};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "punchrelay relay server")]
struct Args {
    /// Config file; the [relay] table is used
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    server: ServerOverrides,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, args.debug);

    let mut config = match &args.config {
        Some(path) => load_config(path)?.relay,
        None => ServerConfig::relay(),
    };
    config.apply(&args.server);
    let addr = config.listen_addr()?;

    info!("Starting punchrelay relay");
    info!("Configuration:");
    info!("  Bind: {}", addr);
    info!("  Admission: {}", config.admission);
    info!("  Id reuse: {}", config.id_reuse);
    info!("  Max sessions: {}", config.max_sessions);

    let transport = TcpTransport::bind(TcpTransportConfig::new(addr))
        .await
        .with_context(|| format!("Failed to start relay on {}", addr))?;
    let mut server = RelayServer::new(transport, config.registry());

    info!("Press Ctrl+C to stop");
    run_until(&mut server, config.poll_interval, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
    })
    .await;

    let stats = server.stats();
    info!(
        "Relay stopped: {} forwarded, {} malformed, {} unroutable, {} rejected",
        stats.forwarded, stats.malformed, stats.unroutable, stats.rejected
    );
    Ok(())
}
