// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host and client behind cone NATs end up directly connected

mod common;

use common::{drain, received, Cluster};
use punchrelay_core::{BROADCAST_ID, HOST_ID};
use punchrelay_network::{
    ClientState, DeliveryMethod, DisconnectCause, DisconnectReason, NatKind, PathKind,
    SessionEvent,
};

fn connected_direct(events: &[SessionEvent]) -> bool {
    events.contains(&SessionEvent::Connected {
        path: PathKind::Direct,
    })
}

#[test]
fn test_cone_peers_punch_through() {
    let mut cluster = Cluster::new();
    let mut host = cluster.peer(6000, NatKind::Cone);
    let mut client = cluster.peer(6001, NatKind::Cone);

    host.start_host().unwrap();
    client.start_client().unwrap();
    cluster.settle(&mut [&mut host, &mut client], 3);

    assert_eq!(host.state(), ClientState::Connected);
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(host.path(), Some(PathKind::Direct));
    assert_eq!(client.path(), Some(PathKind::Direct));
    assert_eq!(host.local_id(), Some(HOST_ID));
    assert_eq!(client.local_id(), Some(1));

    let host_events = drain(&mut host);
    let client_events = drain(&mut client);
    assert!(host_events.contains(&SessionEvent::IdAssigned(HOST_ID)));
    assert!(host_events.contains(&SessionEvent::PeerJoined(1)));
    assert!(client_events.contains(&SessionEvent::IdAssigned(1)));
    assert!(connected_direct(&host_events));
    assert!(connected_direct(&client_events));
    assert!(!client_events
        .iter()
        .any(|event| matches!(event, SessionEvent::FallbackToRelay { .. })));

    // Both left the coordinator once they had each other's endpoint
    cluster.settle(&mut [&mut host, &mut client], 1);
    assert!(cluster.punch.registry().is_empty());
    assert!(cluster.relay.registry().is_empty());

    client
        .send(HOST_ID, b"hello".to_vec(), DeliveryMethod::ReliableOrdered)
        .unwrap();
    host.send(BROADCAST_ID, b"welcome".to_vec(), DeliveryMethod::Unreliable)
        .unwrap();
    cluster.settle(&mut [&mut host, &mut client], 1);

    assert_eq!(received(&drain(&mut host)), vec![(1, b"hello".to_vec())]);
    assert_eq!(
        received(&drain(&mut client)),
        vec![(HOST_ID, b"welcome".to_vec())]
    );
    assert_eq!(cluster.relay.stats().forwarded, 0);
}

#[test]
fn test_punch_succeeds_whichever_side_dials_first() {
    let mut cluster = Cluster::new();
    let mut host = cluster.peer(6000, NatKind::Cone);
    let mut client = cluster.peer(6001, NatKind::Open);

    host.start_host().unwrap();
    client.start_client().unwrap();
    cluster.settle(&mut [&mut client, &mut host], 4);

    assert_eq!(client.path(), Some(PathKind::Direct));
    assert_eq!(host.path(), Some(PathKind::Direct));

    client
        .send(HOST_ID, b"move e4".to_vec(), DeliveryMethod::ReliableOrdered)
        .unwrap();
    cluster.settle(&mut [&mut client, &mut host], 1);
    assert!(received(&drain(&mut host)).contains(&(1, b"move e4".to_vec())));
}

#[test]
fn test_direct_peer_leaving_disconnects_the_other() {
    let mut cluster = Cluster::new();
    let mut host = cluster.peer(6000, NatKind::Cone);
    let mut client = cluster.peer(6001, NatKind::Cone);

    host.start_host().unwrap();
    client.start_client().unwrap();
    cluster.settle(&mut [&mut host, &mut client], 3);
    assert_eq!(host.state(), ClientState::Connected);
    let _ = drain(&mut host);
    let _ = drain(&mut client);

    client.disconnect();
    assert!(drain(&mut client).contains(&SessionEvent::Disconnected {
        cause: DisconnectCause::Local
    }));

    cluster.settle(&mut [&mut host, &mut client], 1);
    assert_eq!(host.state(), ClientState::Disconnected);
    assert!(drain(&mut host).contains(&SessionEvent::Disconnected {
        cause: DisconnectCause::TransportDisconnect(DisconnectReason::RemoteClose)
    }));
    assert!(host.start_host().is_ok());
}
