// SPDX-License-Identifier: MIT OR Apache-2.0

//! punchrelay demo
//!
//! Runs the punch coordinator, the relay, a host and one client in a single
//! process on an in-memory network. With `--nat cone` the peers punch
//! through to each other; with `--nat symmetric` the punch times out and
//! both continue over the relay.
//!
//! Run with: cargo run --bin punchrelay-demo -- --nat symmetric

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use punchrelay_core::{BROADCAST_ID, HOST_ID};
use punchrelay_network::{
    logging, ClientConfig, DeliveryMethod, MemoryNetwork, MemoryTransport, NatKind, PunchClient,
    PunchServer, RegistryConfig, RelayServer, ServerLoop, SessionEvent,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "In-process punchrelay walkthrough")]
struct Args {
    /// NAT placed in front of the host
    #[arg(long, value_enum, default_value = "cone")]
    nat: DemoNat,

    /// How long the peers try to punch before falling back
    #[arg(long, default_value = "1s", value_parser = humantime_serde::re::humantime::parse_duration)]
    punch_timeout: Duration,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum DemoNat {
    Cone,
    Symmetric,
}

impl From<DemoNat> for NatKind {
    fn from(nat: DemoNat) -> Self {
        match nat {
            DemoNat::Cone => NatKind::Cone,
            DemoNat::Symmetric => NatKind::Symmetric,
        }
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([198, 51, 100, 1], port))
}

/// Print the events of one peer; returns the payloads it received
fn report(name: &str, peer: &mut PunchClient<MemoryTransport>) -> Vec<String> {
    let mut received = Vec::new();
    while let Some(event) = peer.poll_event() {
        match event {
            SessionEvent::Data {
                sender, payload, ..
            } => {
                let text = String::from_utf8_lossy(&payload).into_owned();
                println!("[{}] message from {}: {}", name, sender, text);
                received.push(text);
            }
            SessionEvent::StateChanged { from, to } => println!("[{}] {} -> {}", name, from, to),
            other => println!("[{}] {:?}", name, other),
        }
    }
    received
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, args.debug);

    let net = MemoryNetwork::new();
    let mut punch = PunchServer::new(net.bind(addr(9051))?, RegistryConfig::punch());
    let mut relay = RelayServer::new(net.bind(addr(9050))?, RegistryConfig::relay());

    let config = ClientConfig {
        punch_server: addr(9051),
        relay_server: addr(9050),
        punch_timeout: args.punch_timeout,
        ..ClientConfig::default()
    };
    let mut host = PunchClient::new(
        net.bind_with_nat(addr(40000), args.nat.into())?,
        config.clone(),
    );
    let mut client = PunchClient::new(net.bind_with_nat(addr(40001), NatKind::Cone)?, config);

    info!("Host behind {:?} NAT, client behind cone NAT", args.nat);
    host.start_host()?;
    client.start_client()?;

    let deadline = tokio::time::Instant::now() + args.punch_timeout + Duration::from_secs(5);
    let mut ticker = tokio::time::interval(Duration::from_millis(15));
    let mut greeted = false;
    let mut host_got = Vec::new();
    let mut client_got = Vec::new();

    while host_got.is_empty() || client_got.is_empty() {
        if tokio::time::Instant::now() > deadline {
            bail!("Peers did not exchange messages in time");
        }
        ticker.tick().await;

        punch.poll_events();
        relay.poll_events();
        host.poll();
        client.poll();
        host_got.extend(report("host", &mut host));
        client_got.extend(report("client", &mut client));

        if !greeted && host.path().is_some() && client.path().is_some() {
            client.send(HOST_ID, "hello from the client", DeliveryMethod::ReliableOrdered)?;
            host.send(BROADCAST_ID, "hello from the host", DeliveryMethod::ReliableOrdered)?;
            greeted = true;
        }
    }

    println!(
        "Done: host path {:?}, client path {:?}, relay forwarded {}",
        host.path(),
        client.path(),
        relay.stats().forwarded
    );
    host.disconnect();
    client.disconnect();
    Ok(())
}
