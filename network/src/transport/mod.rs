// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport seam
//!
//! Servers and the client session machine only talk to the network through
//! [`Transport`]. A transport provides reliable and unreliable delivery to
//! connected peers, a "connect by address" primitive carrying a request
//! token, unconnected datagrams, and a NAT-traversal hook. All calls are
//! non-blocking; results surface later as [`TransportEvent`]s drained with
//! [`Transport::poll_event`] in arrival order.

use std::fmt;
use std::net::SocketAddr;

use crate::error::NetworkResult;

pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport, NatKind};
pub use tcp::{TcpTransport, TcpTransportConfig};

/// Handle for one transport-level connection, local to a transport instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Delivery guarantees chosen by the original sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryMethod {
    ReliableUnordered = 0,
    Sequenced = 1,
    ReliableOrdered = 2,
    Unreliable = 4,
}

impl DeliveryMethod {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ReliableUnordered),
            1 => Some(Self::Sequenced),
            2 => Some(Self::ReliableOrdered),
            4 => Some(Self::Unreliable),
            _ => None,
        }
    }

    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::ReliableUnordered | Self::ReliableOrdered)
    }
}

/// Class of an unconnected datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnconnectedKind {
    Basic = 0,
    Broadcast = 1,
    /// NAT-traversal control traffic
    NatMessage = 2,
}

impl UnconnectedKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Basic),
            1 => Some(Self::Broadcast),
            2 => Some(Self::NatMessage),
            _ => None,
        }
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The remote side closed the connection
    RemoteClose,
    /// `disconnect` was called locally
    LocalDisconnect,
    /// The remote side rejected the connection request
    ConnectionRejected,
    /// The remote endpoint could not be reached
    ConnectionFailed,
    /// No traffic within the transport's disconnect timeout
    Timeout,
    /// Socket error
    NetworkError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::RemoteClose => "remote close",
            DisconnectReason::LocalDisconnect => "local disconnect",
            DisconnectReason::ConnectionRejected => "connection rejected",
            DisconnectReason::ConnectionFailed => "connection failed",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::NetworkError => "network error",
        };
        f.write_str(text)
    }
}

/// Something that happened on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote peer asks to connect; answer with `accept` or `reject`
    ConnectionRequest {
        conn: ConnectionId,
        endpoint: SocketAddr,
        token: String,
    },
    PeerConnected {
        conn: ConnectionId,
        endpoint: SocketAddr,
    },
    PeerDisconnected {
        conn: ConnectionId,
        reason: DisconnectReason,
    },
    Receive {
        conn: ConnectionId,
        data: Vec<u8>,
        delivery: DeliveryMethod,
    },
    ReceiveUnconnected {
        from: SocketAddr,
        data: Vec<u8>,
        kind: UnconnectedKind,
    },
    NetworkError {
        endpoint: Option<SocketAddr>,
        message: String,
    },
}

/// Datagram transport used by servers and peers
pub trait Transport {
    /// Address this transport is bound to
    fn local_addr(&self) -> SocketAddr;

    /// Start connecting to `addr`, attaching `token` as request metadata
    fn connect(&mut self, addr: SocketAddr, token: &str) -> NetworkResult<ConnectionId>;

    /// Accept a pending [`TransportEvent::ConnectionRequest`]
    fn accept(&mut self, conn: ConnectionId);

    /// Refuse a pending [`TransportEvent::ConnectionRequest`]
    fn reject(&mut self, conn: ConnectionId);

    /// Queue `data` for a connected peer
    fn send(&mut self, conn: ConnectionId, data: Vec<u8>, delivery: DeliveryMethod);

    /// Send a datagram outside of any connection
    fn send_unconnected(&mut self, addr: SocketAddr, data: Vec<u8>, kind: UnconnectedKind);

    fn disconnect(&mut self, conn: ConnectionId);

    fn disconnect_all(&mut self);

    /// External endpoint of the peer as observed by this transport
    fn remote_endpoint(&self, conn: ConnectionId) -> Option<SocketAddr>;

    /// Hand a NAT-control datagram to the transport's traversal module
    fn process_nat_message(&mut self, from: SocketAddr, data: &[u8]);

    /// Next queued event, in arrival order
    fn poll_event(&mut self) -> Option<TransportEvent>;
}
