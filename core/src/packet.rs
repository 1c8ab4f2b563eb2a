// SPDX-License-Identifier: MIT OR Apache-2.0

//! Packet codec
//!
//! Wire format (integers little-endian):
//! [Type: 1][Role: 1][Sender: 8][Recipient: 8][PayloadLen: 4, signed][Payload]

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{CodecError, Role, SessionId};

/// Size of the fixed packet prefix
pub const HEADER_LEN: usize = 22;

/// Message kinds of the relay and punch protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0x01,
    Disconnect = 0x02,
    /// Opaque application data
    Data = 0x03,
    /// Tells a session its own identifier (carried in the recipient field)
    IdAssign = 0x04,
    /// Another session joined (carried in the sender field)
    NotifyJoin = 0x05,
    /// Another session left (carried in the sender field)
    NotifyLeave = 0x06,
    /// Ask the coordinator to broker a punch with the recipient
    PunchRequest = 0x07,
    /// Endpoint of the peer whose id is in the recipient field
    PunchInfo = 0x08,
    /// A punch with the recipient did not succeed
    PunchFailed = 0x09,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Connect),
            0x02 => Ok(Self::Disconnect),
            0x03 => Ok(Self::Data),
            0x04 => Ok(Self::IdAssign),
            0x05 => Ok(Self::NotifyJoin),
            0x06 => Ok(Self::NotifyLeave),
            0x07 => Ok(Self::PunchRequest),
            0x08 => Ok(Self::PunchInfo),
            0x09 => Ok(Self::PunchFailed),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

/// A single protocol message.
///
/// The payload is owned, so `clone()` always produces an independent copy
/// that can be handed to another recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketType,
    role: Role,
    sender: SessionId,
    recipient: SessionId,
    payload: Vec<u8>,
}

impl Packet {
    /// Create an empty packet; sender and recipient default to 0
    pub fn new(kind: PacketType, role: Role) -> Self {
        Self {
            kind,
            role,
            sender: 0,
            recipient: 0,
            payload: Vec::new(),
        }
    }

    /// Create a `Data` packet carrying `payload`
    pub fn data(role: Role, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(PacketType::Data, role).with_payload(payload)
    }

    pub fn with_sender(mut self, sender: SessionId) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_recipient(mut self, recipient: SessionId) -> Self {
        self.recipient = recipient;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn kind(&self) -> PacketType {
        self.kind
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sender(&self) -> SessionId {
        self.sender
    }

    pub fn recipient(&self) -> SessionId {
        self.recipient
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Number of bytes `encode` produces
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append the wire form of this packet to `buf`
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) -> Result<(), CodecError> {
        let len = i32::try_from(self.payload.len())
            .map_err(|_| CodecError::PayloadTooLarge(self.payload.len()))?;

        buf.put_u8(self.kind as u8);
        buf.put_u8(self.role as u8);
        buf.put_u64_le(self.sender);
        buf.put_u64_le(self.recipient);
        buf.put_i32_le(len);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Serialize to a fresh buffer
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Parse a packet from the front of `data`.
    ///
    /// Bytes after the declared payload are ignored. On error nothing is
    /// returned, so a caller can never observe a partially decoded packet.
    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::TooShort {
                available: data.len(),
            });
        }

        let kind = PacketType::try_from(data.get_u8())?;
        let role = Role::try_from(data.get_u8())?;
        let sender = data.get_u64_le();
        let recipient = data.get_u64_le();

        let declared = data.get_i32_le();
        if declared < 0 {
            return Err(CodecError::NegativeLength(declared));
        }

        let declared = declared as usize;
        if data.remaining() < declared {
            return Err(CodecError::Truncated {
                declared,
                available: data.remaining(),
            });
        }

        Ok(Self {
            kind,
            role,
            sender,
            recipient,
            payload: data[..declared].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BROADCAST_ID, HOST_ID};

    fn sample(payload_len: usize) -> Packet {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
        Packet::data(Role::Client, payload)
            .with_sender(7)
            .with_recipient(HOST_ID)
    }

    #[test]
    fn test_round_trip_payload_sizes() {
        for len in [0usize, 1, 70_000] {
            let packet = sample(len);
            let bytes = packet.encode().unwrap();
            assert_eq!(bytes.len(), HEADER_LEN + len);

            let decoded = Packet::decode(&bytes).unwrap();
            assert_eq!(decoded, packet);
            assert_eq!(decoded.payload().len(), len);
        }
    }

    #[test]
    fn test_header_layout() {
        let packet = Packet::new(PacketType::IdAssign, Role::Relay)
            .with_sender(0x0102)
            .with_recipient(BROADCAST_ID)
            .with_payload(vec![0xAA]);
        let bytes = packet.encode().unwrap();

        assert_eq!(bytes[0], 0x04);
        assert_eq!(bytes[1], 0x03);
        assert_eq!(&bytes[2..10], &0x0102u64.to_le_bytes());
        assert_eq!(&bytes[10..18], &[0xFF; 8]);
        assert_eq!(&bytes[18..22], &1i32.to_le_bytes());
        assert_eq!(bytes[22], 0xAA);
    }

    #[test]
    fn test_short_header_rejected() {
        let bytes = sample(4).encode().unwrap();
        for cut in 0..HEADER_LEN {
            assert_eq!(
                Packet::decode(&bytes[..cut]),
                Err(CodecError::TooShort { available: cut })
            );
        }
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let bytes = sample(10).encode().unwrap();
        let err = Packet::decode(&bytes[..HEADER_LEN + 3]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                declared: 10,
                available: 3
            }
        );
        assert!(err.is_malformed());
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut bytes = sample(0).encode().unwrap();
        bytes[18..22].copy_from_slice(&(-1i32).to_le_bytes());
        assert_eq!(Packet::decode(&bytes), Err(CodecError::NegativeLength(-1)));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = sample(0).encode().unwrap();
        bytes[0] = 0x7F;
        assert_eq!(Packet::decode(&bytes), Err(CodecError::UnknownType(0x7F)));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let packet = sample(3);
        let mut bytes = packet.encode().unwrap();
        bytes.extend_from_slice(&[9, 9, 9]);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_clone_is_independent() {
        let original = sample(16);
        let mut copy = original.clone().into_payload();
        copy[0] = 0xFF;
        assert_eq!(original.payload()[0], 0);
        assert_ne!(original.payload(), copy.as_slice());
    }
}
