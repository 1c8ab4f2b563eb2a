// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relay server
//!
//! Forwards opaque application messages between sessions that could not
//! establish a direct path:
//! - Admits peers through the [`SessionRegistry`]
//! - Announces joins and leaves to every other session
//! - Routes each message to its recipient, or to everyone else on broadcast
//!
//! The server never interprets payloads and never rewrites the sender id.

use punchrelay_core::{Packet, Role, BROADCAST_ID};
use tracing::{debug, info, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::membership::{announce_join, announce_leave, send_packet};
use crate::registry::{AdmissionPolicy, IdReuse, RegistryConfig, SessionRegistry};
use crate::server_loop::ServerLoop;
use crate::transport::{ConnectionId, DeliveryMethod, Transport, TransportEvent};

/// Counters kept by a running relay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Copies handed to the transport
    pub forwarded: u64,
    /// Messages that failed to decode
    pub malformed: u64,
    /// Targeted messages whose recipient was unknown
    pub unroutable: u64,
    /// Connection requests refused at admission
    pub rejected: u64,
}

/// Builder for [`RelayServer`]
#[derive(Debug, Clone, Default)]
pub struct RelayServerBuilder {
    registry: RegistryConfig,
}

impl RelayServerBuilder {
    /// Relay defaults: gated admission, ids reset when the host leaves
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admission(mut self, admission: AdmissionPolicy) -> Self {
        self.registry.admission = admission;
        self
    }

    pub fn id_reuse(mut self, id_reuse: IdReuse) -> Self {
        self.registry.id_reuse = id_reuse;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.registry.key_prefix = prefix.into();
        self
    }

    pub fn max_sessions(mut self, max: usize) -> Self {
        self.registry.max_sessions = max;
        self
    }

    pub fn build<T: Transport>(self, transport: T) -> RelayServer<T> {
        RelayServer::new(transport, self.registry)
    }
}

/// Relay Router server over any [`Transport`]
pub struct RelayServer<T> {
    transport: T,
    registry: SessionRegistry,
    stats: RelayStats,
}

impl<T: Transport> RelayServer<T> {
    pub fn new(transport: T, config: RegistryConfig) -> Self {
        info!(
            "Relay server on {} ({} admission, {} ids, {} sessions max)",
            transport.local_addr(),
            config.admission,
            config.id_reuse,
            config.max_sessions
        );
        Self {
            transport,
            registry: SessionRegistry::new(config),
            stats: RelayStats::default(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Handle a single transport event
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
                    self.stats.rejected += 1;
                    self.transport.reject(conn);
                }
            },
            TransportEvent::PeerConnected { conn, endpoint } => {
                match self.registry.lookup_id(conn) {
                    Some(id) => {
                        info!("Session {} connected from {}", id, endpoint);
                        announce_join(
                            &mut self.transport,
                            &self.registry,
                            id,
                            Role::Relay,
                            DeliveryMethod::ReliableUnordered,
                        );
                    }
                    None => {
                        warn!("{} connected without admission, dropping it", conn);
                        self.transport.disconnect(conn);
                    }
                }
            }
            TransportEvent::PeerDisconnected { conn, reason } => {
                if let Some(session) = self.registry.remove(conn) {
                    info!("Session {} disconnected: {}", session.id, reason);
                    announce_leave(&mut self.transport, &self.registry, session.id, Role::Relay);
                }
            }
            TransportEvent::Receive {
                conn,
                data,
                delivery,
            } => {
                if let Err(e) = self.route(conn, &data, delivery) {
                    match e {
                        NetworkError::RecipientNotFound(id) => {
                            warn!("Recipient not found: {}. Discard.", id)
                        }
                        other => warn!("Dropping message from {}: {}", conn, other),
                    }
                }
            }
            TransportEvent::ReceiveUnconnected { from, kind, .. } => {
                debug!("Ignoring {:?} datagram from {}", kind, from);
            }
            TransportEvent::NetworkError { endpoint, message } => {
                warn!("Network error @ {:?}: {}", endpoint, message);
            }
        }
    }

    /// Forward one received message; returns the number of copies sent.
    ///
    /// Malformed input and unknown recipients drop the message only; the
    /// sender's connection stays up.
    pub fn route(
        &mut self,
        from: ConnectionId,
        data: &[u8],
        delivery: DeliveryMethod,
    ) -> NetworkResult<usize> {
        let packet = Packet::decode(data).map_err(|e| {
            self.stats.malformed += 1;
            NetworkError::Malformed(e)
        })?;
        let sender = self
            .registry
            .lookup_id(from)
            .ok_or(NetworkError::UnknownConnection(from.0))?;

        if packet.recipient() == BROADCAST_ID {
            let mut sent = 0;
            for session in self.registry.others(sender) {
                if send_packet(&mut self.transport, session.connection, &packet, delivery) {
                    sent += 1;
                }
            }
            self.stats.forwarded += sent as u64;
            debug!("Broadcast {:?} from {} to {} sessions", packet.kind(), sender, sent);
            return Ok(sent);
        }

        let target = self.registry.lookup(packet.recipient()).ok_or_else(|| {
            self.stats.unroutable += 1;
            NetworkError::RecipientNotFound(packet.recipient())
        })?;
        if !send_packet(&mut self.transport, target, &packet, delivery) {
            return Ok(0);
        }
        self.stats.forwarded += 1;
        debug!(
            "Forwarded {:?} {} -> {}",
            packet.kind(),
            sender,
            packet.recipient()
        );
        Ok(1)
    }
}

impl<T: Transport> ServerLoop for RelayServer<T> {
    fn poll_events(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.transport.poll_event() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    fn shutdown(&mut self) {
        info!("Relay stopping with {} sessions", self.registry.len());
        self.transport.disconnect_all();
        self.registry.clear();
    }
}
