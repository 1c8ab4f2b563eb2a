// SPDX-License-Identifier: MIT OR Apache-2.0

//! punchrelay CLI - interactive peer
//!
//! Starts the client session machine as host or client, then sends every
//! stdin line as a `Data` message: clients address the host, the host
//! broadcasts. Received messages and path changes are printed.

mod render;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use punchrelay_core::{BROADCAST_ID, HOST_ID};
use punchrelay_network::config::load_config;
use punchrelay_network::{
    logging, ClientConfig, DeliveryMethod, PunchClient, SessionEvent, TcpTransport,
    TcpTransportConfig, Transport,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "punchrelay-cli", about = "Interactive punchrelay peer", version)]
struct Args {
    /// The role of this instance
    #[arg(short, long, value_enum, default_value = "client")]
    role: Role,

    /// Config file; the [client] table is used
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Punch coordinator address
    #[arg(long)]
    punch: Option<SocketAddr>,

    /// Relay server address
    #[arg(long)]
    relay: Option<SocketAddr>,

    /// Key for the coordinator token and direct connection
    #[arg(long)]
    base_key: Option<String>,

    /// Key for the relay token
    #[arg(long)]
    relay_key: Option<String>,

    /// Punch timeout, e.g. "5s"
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    punch_timeout: Option<Duration>,

    /// Local bind address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Role of this instance
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Host the session (id 0)
    Host,
    /// Join the host
    Client,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?.client,
            None => ClientConfig::default(),
        };
        if let Some(punch) = self.punch {
            config.punch_server = punch;
        }
        if let Some(relay) = self.relay {
            config.relay_server = relay;
        }
        if let Some(key) = &self.base_key {
            config.base_key = key.clone();
        }
        if let Some(key) = &self.relay_key {
            config.relay_key = key.clone();
        }
        if let Some(timeout) = self.punch_timeout {
            config.punch_timeout = timeout;
        }
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        Ok(config)
    }
}

/// Main entry point
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, args.debug);

    let config = args.client_config()?;
    let transport = TcpTransport::bind(TcpTransportConfig::new(config.bind_address))
        .await
        .context("Failed to bind local transport")?;
    info!("Local transport on {}", transport.local_addr());

    let mut client = PunchClient::new(transport, config);
    match args.role {
        Role::Host => client.start_host()?,
        Role::Client => client.start_client()?,
    }
    let recipient = match args.role {
        Role::Host => BROADCAST_ID,
        Role::Client => HOST_ID,
    };

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(15));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) if !line.trim().is_empty() => {
                    if let Err(e) = client.send(recipient, line.into_bytes(), DeliveryMethod::ReliableOrdered) {
                        println!("! {}", e);
                    }
                }
                Some(_) => {}
                None => break,
            },
            _ = ticker.tick() => {
                client.poll();
                while let Some(event) = client.poll_event() {
                    println!("{}", render::render_event(&event));
                    if matches!(event, SessionEvent::Disconnected { .. }) {
                        warn!("Session ended");
                        return Ok(());
                    }
                }
            }
        }
    }

    client.disconnect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "punchrelay-cli",
            "--role",
            "host",
            "--punch",
            "10.0.0.1:9051",
            "--base-key",
            "chess",
            "--punch-timeout",
            "750ms",
        ]);
        assert_eq!(args.role, Role::Host);
        let config = args.client_config().unwrap();
        assert_eq!(config.punch_server, "10.0.0.1:9051".parse().unwrap());
        assert_eq!(config.base_key, "chess");
        assert_eq!(config.relay_key, "relay");
        assert_eq!(config.punch_timeout, Duration::from_millis(750));
    }
}
