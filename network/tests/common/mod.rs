// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common utilities for punchrelay integration tests

#![allow(dead_code)]

use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use punchrelay_network::{
    ClientConfig, MemoryNetwork, MemoryTransport, NatKind, PunchClient, PunchServer, RelayServer,
    RegistryConfig, ServerLoop, SessionEvent,
};

pub const PUNCH_PORT: u16 = 9051;
pub const RELAY_PORT: u16 = 9050;

// Initialize logging for tests
static INIT_LOGGING: Lazy<()> = Lazy::new(|| {
    // Only show warnings and errors unless RUST_LOG is explicitly set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
});

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([203, 0, 113, 10], port))
}

/// Punch coordinator and relay sharing one in-memory network
pub struct Cluster {
    pub net: MemoryNetwork,
    pub punch: PunchServer<MemoryTransport>,
    pub relay: RelayServer<MemoryTransport>,
    /// Clock handed to every peer tick
    pub now: Instant,
}

impl Cluster {
    pub fn new() -> Self {
        Lazy::force(&INIT_LOGGING);

        let net = MemoryNetwork::new();
        let punch = PunchServer::new(
            net.bind(addr(PUNCH_PORT)).expect("bind punch server"),
            RegistryConfig::punch(),
        );
        let relay = RelayServer::new(
            net.bind(addr(RELAY_PORT)).expect("bind relay"),
            RegistryConfig::relay(),
        );
        Self {
            net,
            punch,
            relay,
            now: Instant::now(),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            punch_server: addr(PUNCH_PORT),
            relay_server: addr(RELAY_PORT),
            punch_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        }
    }

    /// A peer session behind `nat`
    pub fn peer(&self, port: u16, nat: NatKind) -> PunchClient<MemoryTransport> {
        let transport = self
            .net
            .bind_with_nat(addr(port), nat)
            .expect("bind peer");
        PunchClient::new(transport, self.client_config())
    }

    /// One round: both servers, then every peer in order
    pub fn step(&mut self, peers: &mut [&mut PunchClient<MemoryTransport>]) {
        self.punch.poll_events();
        self.relay.poll_events();
        for peer in peers.iter_mut() {
            peer.tick(self.now);
        }
    }

    /// Run `rounds` rounds without moving the clock
    pub fn settle(&mut self, peers: &mut [&mut PunchClient<MemoryTransport>], rounds: usize) {
        for _ in 0..rounds {
            self.step(peers);
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }
}

/// Every queued session event
pub fn drain(peer: &mut PunchClient<MemoryTransport>) -> Vec<SessionEvent> {
    std::iter::from_fn(|| peer.poll_event()).collect()
}

/// Payloads of received `Data` events with their sender ids
pub fn received(events: &[SessionEvent]) -> Vec<(u64, Vec<u8>)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Data {
                sender, payload, ..
            } => Some((*sender, payload.clone())),
            _ => None,
        })
        .collect()
}
