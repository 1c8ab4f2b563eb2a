// SPDX-License-Identifier: MIT OR Apache-2.0

//! Punch coordinator
//!
//! Peers connect here first. On a `PunchRequest` the coordinator tells both
//! sides the other's external endpoint, after which they try to connect to
//! each other directly. It never retries or reroutes on a peer's behalf.

use punchrelay_core::{encode_endpoint, Packet, PacketType, Role, SessionId, HOST_ID};
use tracing::{debug, info, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::membership::{announce_join, announce_leave, send_packet};
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::server_loop::ServerLoop;
use crate::transport::{ConnectionId, DeliveryMethod, Transport, TransportEvent, UnconnectedKind};

/// Punch Coordinator server over any [`Transport`]
pub struct PunchServer<T> {
    transport: T,
    registry: SessionRegistry,
}

impl<T: Transport> PunchServer<T> {
    pub fn new(transport: T, config: RegistryConfig) -> Self {
        info!(
            "Punch server on {} ({} admission, {} ids)",
            transport.local_addr(),
            config.admission,
            config.id_reuse
        );
        Self {
            transport,
            registry: SessionRegistry::new(config),
        }
    }

    /// Coordinator with open admission and monotonic ids
    pub fn with_defaults(transport: T) -> Self {
        Self::new(transport, RegistryConfig::punch())
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionRequest {
                conn,
                endpoint,
                token,
            } => match self.registry.admit(&token, conn, endpoint) {
                Ok(_) => self.transport.accept(conn),
                Err(e) => {
                    warn!("Rejected {} from {}: {}", conn, endpoint, e);
                    self.transport.reject(conn);
                }
            },
            TransportEvent::PeerConnected { conn, endpoint } => match self.registry.lookup_id(conn) {
                Some(id) => {
                    info!("Peer {} connected from {}", id, endpoint);
                    announce_join(
                        &mut self.transport,
                        &self.registry,
                        id,
                        Role::PunchServer,
                        DeliveryMethod::ReliableOrdered,
                    );
                }
                None => self.transport.disconnect(conn),
            },
            TransportEvent::PeerDisconnected { conn, reason } => {
                if let Some(session) = self.registry.remove(conn) {
                    info!("Peer {} disconnected: {}", session.id, reason);
                    announce_leave(
                        &mut self.transport,
                        &self.registry,
                        session.id,
                        Role::PunchServer,
                    );
                }
            }
            TransportEvent::Receive { conn, data, .. } => {
                if let Err(e) = self.handle_message(conn, &data) {
                    warn!("Dropping message from {}: {}", conn, e);
                }
            }
            TransportEvent::ReceiveUnconnected { from, data, kind } => {
                self.handle_unconnected(from, &data, kind);
            }
            TransportEvent::NetworkError { endpoint, message } => {
                warn!("Network error @ {:?}: {}", endpoint, message);
            }
        }
    }

    fn handle_message(&mut self, conn: ConnectionId, data: &[u8]) -> NetworkResult<()> {
        let packet = Packet::decode(data)?;
        match packet.kind() {
            PacketType::PunchRequest => self.handle_punch_request(conn, packet.recipient()),
            PacketType::PunchFailed => self.handle_punch_failed(conn, packet.recipient()),
            other => {
                debug!("Ignoring {:?} from {}", other, conn);
                Ok(())
            }
        }
    }

    /// Send each side the other's endpoint. An unknown target is logged and
    /// the requester gets no answer.
    pub fn handle_punch_request(
        &mut self,
        from: ConnectionId,
        target_id: SessionId,
    ) -> NetworkResult<()> {
        let requester = self
            .registry
            .lookup_id(from)
            .and_then(|id| self.registry.session(id))
            .cloned()
            .ok_or(NetworkError::UnknownConnection(from.0))?;
        let target = self
            .registry
            .session(target_id)
            .cloned()
            .ok_or(NetworkError::RecipientNotFound(target_id))?;

        info!(
            "Punch request {} ({}) -> {} ({})",
            requester.id, requester.endpoint, target.id, target.endpoint
        );
        self.send_punch_info(requester.connection, &target.endpoint, target.id);
        self.send_punch_info(target.connection, &requester.endpoint, requester.id);
        Ok(())
    }

    fn send_punch_info(
        &mut self,
        conn: ConnectionId,
        endpoint: &std::net::SocketAddr,
        peer_id: SessionId,
    ) {
        let info = Packet::new(PacketType::PunchInfo, Role::PunchServer)
            .with_sender(HOST_ID)
            .with_recipient(peer_id)
            .with_payload(encode_endpoint(*endpoint));
        send_packet(&mut self.transport, conn, &info, DeliveryMethod::ReliableOrdered);
    }

    /// Logged only
    pub fn handle_punch_failed(
        &mut self,
        from: ConnectionId,
        target_id: SessionId,
    ) -> NetworkResult<()> {
        let id = self
            .registry
            .lookup_id(from)
            .ok_or(NetworkError::UnknownConnection(from.0))?;
        warn!("NAT punch failed between {} and {}", id, target_id);
        Ok(())
    }

    /// NAT-control datagrams go to the transport's traversal module; the rest
    /// are ignored.
    pub fn handle_unconnected(
        &mut self,
        from: std::net::SocketAddr,
        data: &[u8],
        kind: UnconnectedKind,
    ) {
        if kind == UnconnectedKind::NatMessage {
            self.transport.process_nat_message(from, data);
        } else {
            debug!("Ignoring {:?} datagram from {}", kind, from);
        }
    }
}

impl<T: Transport> ServerLoop for PunchServer<T> {
    fn poll_events(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.transport.poll_event() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    fn shutdown(&mut self) {
        info!("Punch server stopping with {} peers", self.registry.len());
        self.transport.disconnect_all();
        self.registry.clear();
    }
}
