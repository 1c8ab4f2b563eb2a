// SPDX-License-Identifier: MIT OR Apache-2.0

//! Join/leave side effects shared by the relay and the coordinator

use punchrelay_core::{Packet, PacketType, Role, SessionId, HOST_ID};
use tracing::{debug, error};

use crate::registry::SessionRegistry;
use crate::transport::{ConnectionId, DeliveryMethod, Transport};

/// Encode and send one packet. Returns false if it could not be encoded.
pub(crate) fn send_packet<T: Transport>(
    transport: &mut T,
    conn: ConnectionId,
    packet: &Packet,
    delivery: DeliveryMethod,
) -> bool {
    match packet.encode() {
        Ok(bytes) => {
            transport.send(conn, bytes, delivery);
            true
        }
        Err(e) => {
            error!("Failed to encode {:?} for {}: {}", packet.kind(), conn, e);
            false
        }
    }
}

/// Send `IdAssign` to a freshly connected session, then `NotifyJoin` to
/// every other session.
pub(crate) fn announce_join<T: Transport>(
    transport: &mut T,
    registry: &SessionRegistry,
    id: SessionId,
    origin: Role,
    assign_delivery: DeliveryMethod,
) {
    let Some(session) = registry.session(id) else {
        return;
    };

    let assign = Packet::new(PacketType::IdAssign, origin)
        .with_sender(HOST_ID)
        .with_recipient(id);
    send_packet(transport, session.connection, &assign, assign_delivery);

    for other in registry.others(id) {
        let join = Packet::new(PacketType::NotifyJoin, origin)
            .with_sender(id)
            .with_recipient(other.id);
        send_packet(transport, other.connection, &join, DeliveryMethod::ReliableUnordered);
    }
    debug!("Announced session {} to {} peers", id, registry.len() - 1);
}

/// Send `NotifyLeave` for a removed session to every remaining session
pub(crate) fn announce_leave<T: Transport>(
    transport: &mut T,
    registry: &SessionRegistry,
    id: SessionId,
    origin: Role,
) {
    for other in registry.sessions() {
        let leave = Packet::new(PacketType::NotifyLeave, origin)
            .with_sender(id)
            .with_recipient(other.id);
        send_packet(transport, other.connection, &leave, DeliveryMethod::ReliableUnordered);
    }
}
