// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process network for tests and the demo binary
//!
//! Every [`MemoryTransport`] binds an address on a shared [`MemoryNetwork`]
//! and sits behind a [`NatKind`]:
//! - `Open` endpoints receive unsolicited connection requests.
//! - `Cone` endpoints drop unsolicited requests, but when both sides attempt
//!   a connection to each other the attempts merge into one connection. This
//!   is what a successful hole punch looks like.
//! - `Symmetric` endpoints never merge, so punching through them fails and
//!   only outbound connections to `Open` endpoints work.
//!
//! A dropped request produces no event at all; the caller's own timeout is
//! the only way to notice it.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

use super::{
    ConnectionId, DeliveryMethod, DisconnectReason, Transport, TransportEvent, UnconnectedKind,
};
use crate::error::{NetworkError, NetworkResult};

const EPHEMERAL_START: u16 = 49152;

/// NAT placed in front of a memory endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    Open,
    Cone,
    Symmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// Outbound request delivered, waiting for accept/reject
    Requesting,
    /// Outbound request dropped by the remote NAT
    Waiting,
    /// Inbound request not yet answered
    Pending,
    Connected,
}

#[derive(Debug)]
struct Link {
    remote: SocketAddr,
    peer: Option<ConnectionId>,
    state: LinkState,
}

#[derive(Debug)]
struct Endpoint {
    nat: NatKind,
    next_conn: u64,
    events: VecDeque<TransportEvent>,
    links: HashMap<ConnectionId, Link>,
    nat_log: Vec<(SocketAddr, Vec<u8>)>,
}

impl Endpoint {
    fn new(nat: NatKind) -> Self {
        Self {
            nat,
            next_conn: 1,
            events: VecDeque::new(),
            links: HashMap::new(),
            nat_log: Vec::new(),
        }
    }

    fn alloc(&mut self) -> ConnectionId {
        let conn = ConnectionId(self.next_conn);
        self.next_conn += 1;
        conn
    }
}

#[derive(Debug, Default)]
struct Hub {
    endpoints: HashMap<SocketAddr, Endpoint>,
    next_port: u16,
}

impl Hub {
    fn push(&mut self, at: SocketAddr, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get_mut(&at) {
            endpoint.events.push_back(event);
        }
    }

    fn link_mut(&mut self, at: SocketAddr, conn: ConnectionId) -> Option<&mut Link> {
        self.endpoints.get_mut(&at)?.links.get_mut(&conn)
    }

    /// A `Waiting` link at `at` pointing back to `remote`, if any
    fn waiting_link(&self, at: SocketAddr, remote: SocketAddr) -> Option<ConnectionId> {
        self.endpoints.get(&at)?.links.iter().find_map(|(conn, link)| {
            (link.remote == remote && link.state == LinkState::Waiting).then_some(*conn)
        })
    }

    fn connect(&mut self, from: SocketAddr, to: SocketAddr, token: &str) -> ConnectionId {
        let local = match self.endpoints.get_mut(&from) {
            Some(endpoint) => endpoint.alloc(),
            None => return ConnectionId(0),
        };

        let from_nat = self.endpoints.get(&from).map(|endpoint| endpoint.nat);
        let to_nat = self
            .endpoints
            .get(&to)
            .filter(|_| to != from)
            .map(|endpoint| endpoint.nat);
        let (from_nat, to_nat) = match (from_nat, to_nat) {
            (Some(from_nat), Some(to_nat)) => (from_nat, to_nat),
            _ => {
                debug!("[memory] {} -> {}: nothing bound there", from, to);
                self.push(
                    from,
                    TransportEvent::PeerDisconnected {
                        conn: local,
                        reason: DisconnectReason::ConnectionFailed,
                    },
                );
                return local;
            }
        };

        // Both sides punching towards each other
        let punchable = from_nat != NatKind::Symmetric && to_nat != NatKind::Symmetric;
        if let Some(theirs) = self.waiting_link(to, from).filter(|_| punchable) {
            debug!("[memory] {} <-> {}: simultaneous open", from, to);
            if let Some(link) = self.link_mut(to, theirs) {
                link.peer = Some(local);
                link.state = LinkState::Connected;
            }
            if let Some(endpoint) = self.endpoints.get_mut(&from) {
                endpoint.links.insert(
                    local,
                    Link {
                        remote: to,
                        peer: Some(theirs),
                        state: LinkState::Connected,
                    },
                );
            }
            self.push(
                to,
                TransportEvent::PeerConnected {
                    conn: theirs,
                    endpoint: from,
                },
            );
            self.push(
                from,
                TransportEvent::PeerConnected {
                    conn: local,
                    endpoint: to,
                },
            );
            return local;
        }

        if to_nat != NatKind::Open {
            trace!("[memory] {} -> {}: request dropped by NAT", from, to);
            if let Some(endpoint) = self.endpoints.get_mut(&from) {
                endpoint.links.insert(
                    local,
                    Link {
                        remote: to,
                        peer: None,
                        state: LinkState::Waiting,
                    },
                );
            }
            return local;
        }

        let remote = match self.endpoints.get_mut(&to) {
            Some(target) => {
                let remote = target.alloc();
                target.links.insert(
                    remote,
                    Link {
                        remote: from,
                        peer: Some(local),
                        state: LinkState::Pending,
                    },
                );
                remote
            }
            None => return local,
        };
        if let Some(endpoint) = self.endpoints.get_mut(&from) {
            endpoint.links.insert(
                local,
                Link {
                    remote: to,
                    peer: Some(remote),
                    state: LinkState::Requesting,
                },
            );
        }
        self.push(
            to,
            TransportEvent::ConnectionRequest {
                conn: remote,
                endpoint: from,
                token: token.to_string(),
            },
        );
        local
    }

    fn answer(&mut self, at: SocketAddr, conn: ConnectionId, accepted: bool) {
        let (remote, peer) = match self.link_mut(at, conn) {
            Some(link) if link.state == LinkState::Pending => (link.remote, link.peer),
            _ => return,
        };
        let initiator_alive = peer
            .and_then(|peer| self.endpoints.get(&remote)?.links.get(&peer))
            .map_or(false, |link| link.state == LinkState::Requesting);

        if accepted && initiator_alive {
            if let Some(link) = self.link_mut(at, conn) {
                link.state = LinkState::Connected;
            }
            if let Some(link) = peer.and_then(|peer| self.link_mut(remote, peer)) {
                link.state = LinkState::Connected;
            }
            self.push(at, TransportEvent::PeerConnected { conn, endpoint: remote });
            if let Some(peer) = peer {
                self.push(
                    remote,
                    TransportEvent::PeerConnected {
                        conn: peer,
                        endpoint: at,
                    },
                );
            }
            return;
        }

        if let Some(endpoint) = self.endpoints.get_mut(&at) {
            endpoint.links.remove(&conn);
        }
        if let Some(peer) = peer {
            let removed = self
                .endpoints
                .get_mut(&remote)
                .and_then(|endpoint| endpoint.links.remove(&peer));
            if removed.is_some() {
                self.push(
                    remote,
                    TransportEvent::PeerDisconnected {
                        conn: peer,
                        reason: DisconnectReason::ConnectionRejected,
                    },
                );
            }
        }
    }

    fn disconnect(&mut self, at: SocketAddr, conn: ConnectionId) {
        let link = match self
            .endpoints
            .get_mut(&at)
            .and_then(|endpoint| endpoint.links.remove(&conn))
        {
            Some(link) => link,
            None => return,
        };
        self.push(
            at,
            TransportEvent::PeerDisconnected {
                conn,
                reason: DisconnectReason::LocalDisconnect,
            },
        );

        let peer = match link.peer {
            Some(peer) => peer,
            None => return,
        };
        let removed = self
            .endpoints
            .get_mut(&link.remote)
            .and_then(|endpoint| endpoint.links.remove(&peer));
        if let Some(remote_link) = removed {
            let reason = match remote_link.state {
                LinkState::Connected => Some(DisconnectReason::RemoteClose),
                LinkState::Requesting => Some(DisconnectReason::ConnectionFailed),
                LinkState::Pending | LinkState::Waiting => None,
            };
            if let Some(reason) = reason {
                self.push(link.remote, TransportEvent::PeerDisconnected { conn: peer, reason });
            }
        }
    }

    fn send(&mut self, at: SocketAddr, conn: ConnectionId, data: Vec<u8>, delivery: DeliveryMethod) {
        let (remote, peer) = match self.endpoints.get(&at).and_then(|e| e.links.get(&conn)) {
            Some(Link {
                remote,
                peer: Some(peer),
                state: LinkState::Connected,
            }) => (*remote, *peer),
            _ => {
                trace!("[memory] {} dropping send on {}: not connected", at, conn);
                return;
            }
        };
        self.push(
            remote,
            TransportEvent::Receive {
                conn: peer,
                data,
                delivery,
            },
        );
    }
}

/// Shared in-process network
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an `Open` endpoint
    pub fn bind(&self, addr: SocketAddr) -> NetworkResult<MemoryTransport> {
        self.bind_with_nat(addr, NatKind::Open)
    }

    /// Bind an endpoint behind `nat`. Port 0 picks an unused port.
    pub fn bind_with_nat(&self, addr: SocketAddr, nat: NatKind) -> NetworkResult<MemoryTransport> {
        let mut hub = self.hub.lock();
        let mut addr = addr;
        if addr.port() == 0 {
            loop {
                let port = EPHEMERAL_START.wrapping_add(hub.next_port);
                hub.next_port = hub.next_port.wrapping_add(1);
                let candidate = SocketAddr::new(addr.ip(), port);
                if !hub.endpoints.contains_key(&candidate) {
                    addr = candidate;
                    break;
                }
            }
        }

        if hub.endpoints.contains_key(&addr) {
            return Err(NetworkError::Bind {
                addr,
                source: io::Error::from(io::ErrorKind::AddrInUse),
            });
        }
        hub.endpoints.insert(addr, Endpoint::new(nat));
        debug!("[memory] bound {} ({:?})", addr, nat);

        Ok(MemoryTransport {
            hub: Arc::clone(&self.hub),
            addr,
        })
    }

    /// NAT-control datagrams processed by the endpoint at `addr`
    pub fn nat_messages(&self, addr: SocketAddr) -> Vec<(SocketAddr, Vec<u8>)> {
        self.hub
            .lock()
            .endpoints
            .get(&addr)
            .map(|endpoint| endpoint.nat_log.clone())
            .unwrap_or_default()
    }

    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        self.hub.lock().endpoints.contains_key(&addr)
    }
}

/// One endpoint on a [`MemoryNetwork`]; unbinds when dropped
#[derive(Debug)]
pub struct MemoryTransport {
    hub: Arc<Mutex<Hub>>,
    addr: SocketAddr,
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn connect(&mut self, addr: SocketAddr, token: &str) -> NetworkResult<ConnectionId> {
        Ok(self.hub.lock().connect(self.addr, addr, token))
    }

    fn accept(&mut self, conn: ConnectionId) {
        self.hub.lock().answer(self.addr, conn, true);
    }

    fn reject(&mut self, conn: ConnectionId) {
        self.hub.lock().answer(self.addr, conn, false);
    }

    fn send(&mut self, conn: ConnectionId, data: Vec<u8>, delivery: DeliveryMethod) {
        self.hub.lock().send(self.addr, conn, data, delivery);
    }

    fn send_unconnected(&mut self, addr: SocketAddr, data: Vec<u8>, kind: UnconnectedKind) {
        let from = self.addr;
        self.hub
            .lock()
            .push(addr, TransportEvent::ReceiveUnconnected { from, data, kind });
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        self.hub.lock().disconnect(self.addr, conn);
    }

    fn disconnect_all(&mut self) {
        let mut hub = self.hub.lock();
        let conns: Vec<ConnectionId> = hub
            .endpoints
            .get(&self.addr)
            .map(|endpoint| endpoint.links.keys().copied().collect())
            .unwrap_or_default();
        for conn in conns {
            hub.disconnect(self.addr, conn);
        }
    }

    fn remote_endpoint(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.hub
            .lock()
            .endpoints
            .get(&self.addr)?
            .links
            .get(&conn)
            .map(|link| link.remote)
    }

    fn process_nat_message(&mut self, from: SocketAddr, data: &[u8]) {
        if let Some(endpoint) = self.hub.lock().endpoints.get_mut(&self.addr) {
            endpoint.nat_log.push((from, data.to_vec()));
        }
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.hub
            .lock()
            .endpoints
            .get_mut(&self.addr)?
            .events
            .pop_front()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.disconnect_all();
        self.hub.lock().endpoints.remove(&self.addr);
    }
}
