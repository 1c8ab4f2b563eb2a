// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relay round trip over real sockets on the loopback interface

mod common;

use punchrelay_core::{Packet, PacketType, Role, HOST_ID};
use punchrelay_network::{
    DeliveryMethod, DisconnectReason, RegistryConfig, RelayServer, ServerLoop, TcpTransport,
    TcpTransportConfig, Transport, TransportEvent,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn loopback() -> TcpTransportConfig {
    TcpTransportConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
}

/// Poll the relay and `peer` until `want` matches one of the peer's events
async fn wait_for<F>(
    relay: &mut RelayServer<TcpTransport>,
    peer: &mut TcpTransport,
    mut want: F,
) -> TransportEvent
where
    F: FnMut(&TransportEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            relay.poll_events();
            while let Some(event) = peer.poll_event() {
                if want(&event) {
                    return event;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for transport event")
}

fn packet_of(kind: PacketType) -> impl FnMut(&TransportEvent) -> bool {
    move |event| match event {
        TransportEvent::Receive { data, .. } => {
            Packet::decode(data).map_or(false, |packet| packet.kind() == kind)
        }
        _ => false,
    }
}

fn decode(event: TransportEvent) -> (Packet, DeliveryMethod) {
    match event {
        TransportEvent::Receive { data, delivery, .. } => (Packet::decode(&data).unwrap(), delivery),
        other => panic!("expected a message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_relay_forwards_over_tcp() {
    let mut relay = RelayServer::new(
        TcpTransport::bind(loopback()).await.unwrap(),
        RegistryConfig::relay(),
    );
    let relay_addr = relay.transport().local_addr();

    let mut host = TcpTransport::bind(loopback()).await.unwrap();
    let mut client = TcpTransport::bind(loopback()).await.unwrap();

    let host_conn = host.connect(relay_addr, "relay|I_AM_HOST").unwrap();
    let (assign, _) = decode(wait_for(&mut relay, &mut host, packet_of(PacketType::IdAssign)).await);
    assert_eq!(assign.recipient(), HOST_ID);
    assert_eq!(assign.role(), Role::Relay);

    let client_conn = client.connect(relay_addr, "relay|I_AM_CLIENT").unwrap();
    let (assign, _) =
        decode(wait_for(&mut relay, &mut client, packet_of(PacketType::IdAssign)).await);
    assert_eq!(assign.recipient(), 1);

    let (join, _) = decode(wait_for(&mut relay, &mut host, packet_of(PacketType::NotifyJoin)).await);
    assert_eq!(join.sender(), 1);

    let data = Packet::data(Role::Client, b"over tcp".to_vec())
        .with_sender(1)
        .with_recipient(HOST_ID);
    client.send(client_conn, data.encode().unwrap(), DeliveryMethod::ReliableOrdered);

    let (forwarded, delivery) =
        decode(wait_for(&mut relay, &mut host, packet_of(PacketType::Data)).await);
    assert_eq!(forwarded.sender(), 1);
    assert_eq!(forwarded.payload(), b"over tcp");
    assert_eq!(delivery, DeliveryMethod::ReliableOrdered);
    assert_eq!(relay.stats().forwarded, 1);

    client.disconnect(client_conn);
    let (leave, _) =
        decode(wait_for(&mut relay, &mut host, packet_of(PacketType::NotifyLeave)).await);
    assert_eq!(leave.sender(), 1);
    assert_eq!(relay.registry().len(), 1);

    host.disconnect(host_conn);
}

#[tokio::test]
async fn test_relay_rejects_bad_token_over_tcp() {
    let mut relay = RelayServer::new(
        TcpTransport::bind(loopback()).await.unwrap(),
        RegistryConfig::relay(),
    );
    let relay_addr = relay.transport().local_addr();
    let mut peer = TcpTransport::bind(loopback()).await.unwrap();

    let conn = peer.connect(relay_addr, "game|I_AM_HOST").unwrap();
    let event = wait_for(&mut relay, &mut peer, |event| {
        matches!(event, TransportEvent::PeerDisconnected { .. })
    })
    .await;

    assert_eq!(
        event,
        TransportEvent::PeerDisconnected {
            conn,
            reason: DisconnectReason::ConnectionRejected
        }
    );
    assert!(relay.registry().is_empty());
    assert_eq!(relay.stats().rejected, 1);
}
