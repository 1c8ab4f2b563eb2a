// SPDX-License-Identifier: MIT OR Apache-2.0

//! punchrelay punch coordinator
//!
//! Run with: cargo run --bin punchrelay-punch -- --port 9051

use anyhow::{Context, Result};
use clap::Parser;
use punchrelay_network::config::{load_config, ServerConfig, ServerOverrides};
use punchrelay_network::{logging, run_until, PunchServer, TcpTransport, TcpTransportConfig};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "punchrelay NAT punch coordinator")]
struct Args {
    /// Config file; the [punch] table is used
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
        Some(path) => load_config(path)?.punch,
        None => ServerConfig::punch(),
    };
    config.apply(&args.server);
    let addr = config.listen_addr()?;

    info!("Starting punchrelay coordinator on {}", addr);

    let transport = TcpTransport::bind(TcpTransportConfig::new(addr))
        .await
        .with_context(|| format!("Failed to start punch server on {}", addr))?;
    let mut server = PunchServer::new(transport, config.registry());

    run_until(&mut server, config.poll_interval, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
    })
    .await;

    info!("Punch server stopped");
    Ok(())
}
