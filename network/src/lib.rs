// SPDX-License-Identifier: MIT OR Apache-2.0

//! punchrelay network layer
//!
//! This crate provides the session-level protocol on top of a datagram
//! transport:
//! - A [`Transport`] seam with an in-memory and a TCP/UDP implementation
//! - The [`SessionRegistry`] shared by both servers
//! - The [`RelayServer`] and the [`PunchServer`] coordinator
//! - The [`PunchClient`] session machine with relay fallback
//! - `punchrelay.toml` configuration and the server polling loop

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod logging;
mod membership;
pub mod punch_server;
pub mod registry;
pub mod relay_server;
pub mod server_loop;
pub mod session;
pub mod transport;

// Re-exports
pub use config::{ClientConfig, Config, RelayRetryPolicy, ServerConfig};
pub use error::{NetworkError, NetworkResult};
pub use punch_server::PunchServer;
pub use registry::{AdmissionPolicy, IdReuse, RegistryConfig, Session, SessionRegistry};
pub use relay_server::{RelayServer, RelayServerBuilder, RelayStats};
pub use server_loop::{run_until, ServerLoop};
pub use session::{
    ClientState, DisconnectCause, FallbackReason, PathKind, PunchClient, SessionEvent,
};
pub use transport::{
    ConnectionId, DeliveryMethod, DisconnectReason, MemoryNetwork, MemoryTransport, NatKind,
    TcpTransport, TcpTransportConfig, Transport, TransportEvent, UnconnectedKind,
};
