// SPDX-License-Identifier: MIT OR Apache-2.0

//! A symmetric NAT defeats the punch; both peers continue over the relay

mod common;

use common::{drain, received, Cluster};
use punchrelay_core::{BROADCAST_ID, HOST_ID};
use punchrelay_network::{
    ClientState, DeliveryMethod, FallbackReason, NatKind, PathKind, SessionEvent,
};
use std::time::Duration;

#[test]
fn test_symmetric_nat_falls_back_to_relay() {
    let mut cluster = Cluster::new();
    let mut host = cluster.peer(6000, NatKind::Symmetric);
    let mut client = cluster.peer(6001, NatKind::Cone);

    host.start_host().unwrap();
    client.start_client().unwrap();
    cluster.settle(&mut [&mut host, &mut client], 3);

    // Attempts are silently dropped until the timeout
    assert_eq!(host.state(), ClientState::Punching);
    assert_eq!(client.state(), ClientState::Punching);

    cluster.advance(Duration::from_secs(4));
    cluster.settle(&mut [&mut host, &mut client], 1);
    assert_eq!(client.state(), ClientState::Punching);

    cluster.advance(Duration::from_secs(2));
    cluster.settle(&mut [&mut host, &mut client], 1);
    assert_eq!(host.state(), ClientState::ConnectingToRelay);
    assert_eq!(client.state(), ClientState::ConnectingToRelay);

    cluster.settle(&mut [&mut host, &mut client], 1);
    assert_eq!(host.state(), ClientState::Connected);
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(host.path(), Some(PathKind::Relayed));
    assert_eq!(client.path(), Some(PathKind::Relayed));
    assert_eq!(cluster.relay.registry().len(), 2);
    assert!(cluster.relay.registry().has_host());

    let client_events = drain(&mut client);
    assert!(client_events.contains(&SessionEvent::FallbackToRelay {
        reason: FallbackReason::PunchTimeout
    }));
    assert!(client_events.contains(&SessionEvent::Connected {
        path: PathKind::Relayed
    }));
    assert_eq!(client.local_id(), Some(1));
    let _ = drain(&mut host);

    client
        .send(HOST_ID, b"ping".to_vec(), DeliveryMethod::ReliableOrdered)
        .unwrap();
    cluster.settle(&mut [&mut host, &mut client], 1);
    host.send(BROADCAST_ID, b"pong".to_vec(), DeliveryMethod::ReliableOrdered)
        .unwrap();
    cluster.settle(&mut [&mut host, &mut client], 1);

    assert_eq!(received(&drain(&mut host)), vec![(1, b"ping".to_vec())]);
    assert_eq!(received(&drain(&mut client)), vec![(HOST_ID, b"pong".to_vec())]);
    assert_eq!(cluster.relay.stats().forwarded, 2);
}

#[test]
fn test_client_retries_until_host_reaches_relay() {
    let mut cluster = Cluster::new();
    let mut host = cluster.peer(6000, NatKind::Symmetric);
    let mut client = cluster.peer(6001, NatKind::Symmetric);

    host.start_host().unwrap();
    client.start_client().unwrap();
    cluster.settle(&mut [&mut host, &mut client], 3);

    // The client times out first and is turned away by the gated relay
    cluster.advance(Duration::from_secs(6));
    cluster.settle(&mut [&mut client, &mut host], 2);
    assert_eq!(cluster.relay.stats().rejected, 1);
    assert_eq!(client.state(), ClientState::ConnectingToRelay);
    assert_eq!(host.state(), ClientState::Connected);

    cluster.advance(Duration::from_millis(600));
    cluster.settle(&mut [&mut client, &mut host], 2);
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.path(), Some(PathKind::Relayed));
    assert!(drain(&mut host).contains(&SessionEvent::PeerJoined(1)));
}

#[test]
fn test_host_leaving_relay_notifies_clients() {
    let mut cluster = Cluster::new();
    let mut host = cluster.peer(6000, NatKind::Symmetric);
    let mut client = cluster.peer(6001, NatKind::Symmetric);

    host.start_host().unwrap();
    client.start_client().unwrap();
    cluster.settle(&mut [&mut host, &mut client], 3);
    cluster.advance(Duration::from_secs(6));
    cluster.settle(&mut [&mut host, &mut client], 2);
    assert_eq!(client.local_id(), Some(1));

    host.disconnect();
    cluster.settle(&mut [&mut host, &mut client], 1);
    assert!(drain(&mut client).contains(&SessionEvent::PeerLeft(HOST_ID)));
    assert_eq!(cluster.relay.registry().len(), 1);
    assert!(!cluster.relay.registry().has_host());
}
