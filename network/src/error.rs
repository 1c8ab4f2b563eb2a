// SPDX-License-Identifier: MIT OR Apache-2.0

//! Network layer errors

use punchrelay_core::{CodecError, SessionId};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by servers, transports and the client session machine.
///
/// None of these are fatal to a running server: they abort the single
/// operation that produced them. Only [`NetworkError::Bind`] at startup ends
/// a server process.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Message failed to decode and was dropped
    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),

    /// Targeted message for an identifier nobody holds
    #[error("recipient {0} not found")]
    RecipientNotFound(SessionId),

    /// Connection refused because of its declared role or key
    #[error("role rejected: {0}")]
    RoleRejected(String),

    /// Connection refused because the server is full
    #[error("capacity exceeded: {0} sessions connected")]
    CapacityExceeded(usize),

    /// `start_host`/`start_client` called on a running session
    #[error("session already started as {0}")]
    AlreadyStarted(String),

    /// No direct or relayed path is currently established
    #[error("not connected")]
    NotConnected,

    /// Transport-level connection handle is not known
    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    /// Listen socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

impl NetworkError {
    /// Admission-level errors: the connection is refused before a session exists
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            NetworkError::RoleRejected(_) | NetworkError::CapacityExceeded(_)
        )
    }
}
