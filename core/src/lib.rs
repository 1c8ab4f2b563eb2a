// SPDX-License-Identifier: MIT OR Apache-2.0

//! punchrelay core - wire messages and session addressing
//!
//! This crate provides the pieces every punchrelay component shares:
//! - Session identifiers and the reserved host / broadcast values
//! - The sender role carried in every message
//! - The packet codec (fixed 22-byte prefix plus opaque payload)
//! - The endpoint payload carried by `PunchInfo`
//! - Connection-request role tokens (`<baseKey>|I_AM_HOST`)

#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod packet;
pub mod punch_info;
pub mod token;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier assigned to a connected peer by a server instance
pub type SessionId = u64;

/// Identifier always held by the host session
pub const HOST_ID: SessionId = 0;

/// First identifier handed out to clients
pub const FIRST_CLIENT_ID: SessionId = 1;

/// Recipient value meaning "every other connected session"
pub const BROADCAST_ID: SessionId = u64::MAX;

/// Logical class of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    /// The hosting peer (session 0)
    Host = 0x01,
    /// A joining peer
    Client = 0x02,
    /// Messages originated by a relay server
    Relay = 0x03,
    /// Messages originated by a punch coordinator
    PunchServer = 0x04,
}

impl TryFrom<u8> for Role {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Role::Host),
            0x02 => Ok(Role::Client),
            0x03 => Ok(Role::Relay),
            0x04 => Ok(Role::PunchServer),
            other => Err(CodecError::UnknownRole(other)),
        }
    }
}

/// Errors produced while encoding or decoding wire data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes than the fixed packet prefix
    #[error("not enough data for packet header: {available} bytes available, 22 required")]
    TooShort { available: usize },

    /// The declared payload length is negative
    #[error("invalid payload length {0}")]
    NegativeLength(i32),

    /// Fewer payload bytes than declared
    #[error("payload truncated: {declared} bytes declared, {available} available")]
    Truncated { declared: usize, available: usize },

    /// Unrecognised message type byte
    #[error("unknown packet type 0x{0:02x}")]
    UnknownType(u8),

    /// Unrecognised role byte
    #[error("unknown role 0x{0:02x}")]
    UnknownRole(u8),

    /// Payload does not fit the signed 32-bit length field
    #[error("payload of {0} bytes exceeds the maximum packet size")]
    PayloadTooLarge(usize),

    /// `PunchInfo` payload does not hold a valid endpoint
    #[error("invalid endpoint payload: {0}")]
    InvalidEndpoint(String),

    /// Connection-request token is not `<key>|I_AM_HOST` or `<key>|I_AM_CLIENT`
    #[error("invalid role token: {0:?}")]
    InvalidToken(String),
}

impl CodecError {
    /// Whether the error means an inbound message must be discarded
    pub fn is_malformed(&self) -> bool {
        !matches!(self, CodecError::PayloadTooLarge(_) | CodecError::InvalidToken(_))
    }
}

// Re-exports
pub use packet::{Packet, PacketType, HEADER_LEN};
pub use punch_info::{decode_endpoint, encode_endpoint};
pub use token::{DeclaredRole, RoleToken};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_bytes() {
        for role in [Role::Host, Role::Client, Role::Relay, Role::PunchServer] {
            assert_eq!(Role::try_from(role as u8), Ok(role));
        }
        assert_eq!(Role::try_from(0), Err(CodecError::UnknownRole(0)));
    }

    #[test]
    fn test_reserved_ids() {
        assert_eq!(HOST_ID, 0);
        assert_eq!(FIRST_CLIENT_ID, 1);
        assert_eq!(BROADCAST_ID, u64::MAX);
    }
}
