// SPDX-License-Identifier: MIT OR Apache-2.0

//! Property tests for the packet codec

use proptest::prelude::*;
use punchrelay_core::{CodecError, Packet, PacketType, Role, HEADER_LEN};

fn any_kind() -> impl Strategy<Value = PacketType> {
    prop_oneof![
        Just(PacketType::Data),
        Just(PacketType::IdAssign),
        Just(PacketType::NotifyJoin),
        Just(PacketType::NotifyLeave),
        Just(PacketType::PunchRequest),
        Just(PacketType::PunchInfo),
    ]
}

proptest! {
    #[test]
    fn decoded_packet_matches_encoded(
        kind in any_kind(),
        sender in any::<u64>(),
        recipient in any::<u64>(),
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let packet = Packet::new(kind, Role::Client)
            .with_sender(sender)
            .with_recipient(recipient)
            .with_payload(payload);
        let bytes = packet.encode().unwrap();
        prop_assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn any_truncation_is_malformed(
        payload in proptest::collection::vec(any::<u8>(), 1..256),
        cut in any::<prop::sample::Index>(),
    ) {
        let bytes = Packet::data(Role::Host, payload).encode().unwrap();
        let cut = cut.index(bytes.len());

        let err = Packet::decode(&bytes[..cut]).unwrap_err();
        prop_assert!(err.is_malformed());
        if cut < HEADER_LEN {
            prop_assert_eq!(err, CodecError::TooShort { available: cut });
        } else {
            let is_truncated = matches!(err, CodecError::Truncated { .. });
            prop_assert!(is_truncated);
        }
    }
}
