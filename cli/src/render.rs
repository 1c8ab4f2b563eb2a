// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text rendering of session events for the CLI.

use punchrelay_core::{SessionId, BROADCAST_ID};
use punchrelay_network::SessionEvent;

/// One console line per session event
pub fn render_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::StateChanged { to, .. } => format!("* {}", to),
        SessionEvent::IdAssigned(id) => format!("* you are session {}", id),
        SessionEvent::Connected { path } => format!("* connected ({} path)", path),
        SessionEvent::PeerJoined(id) => format!("* {} joined", peer_name(*id)),
        SessionEvent::PeerLeft(id) => format!("* {} left", peer_name(*id)),
        SessionEvent::Data {
            sender, payload, ..
        } => format!("<{}> {}", peer_name(*sender), String::from_utf8_lossy(payload)),
        SessionEvent::FallbackToRelay { reason } => {
            format!("* direct connection failed ({}), using relay", reason)
        }
        SessionEvent::Disconnected { cause } => format!("* disconnected: {}", cause),
    }
}

fn peer_name(id: SessionId) -> String {
    match id {
        0 => "host".to_string(),
        BROADCAST_ID => "everyone".to_string(),
        id => format!("peer {}", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use punchrelay_network::{DeliveryMethod, PathKind};

    #[test]
    fn test_data_line() {
        let event = SessionEvent::Data {
            sender: 0,
            payload: b"hello".to_vec(),
            delivery: DeliveryMethod::ReliableOrdered,
        };
        assert_eq!(render_event(&event), "<host> hello");
    }

    #[test]
    fn test_status_lines() {
        assert_eq!(
            render_event(&SessionEvent::Connected {
                path: PathKind::Relayed
            }),
            "* connected (relayed path)"
        );
        assert_eq!(
            render_event(&SessionEvent::PeerJoined(3)),
            "* peer 3 joined"
        );
    }
}
