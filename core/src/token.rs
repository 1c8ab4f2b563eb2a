// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection-request role tokens
//!
//! A peer attaches `<baseKey>|I_AM_HOST` or `<baseKey>|I_AM_CLIENT` to every
//! connection attempt made to a coordinator or relay.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CodecError, Role};

pub const HOST_MARKER: &str = "I_AM_HOST";
pub const CLIENT_MARKER: &str = "I_AM_CLIENT";
pub const SEPARATOR: char = '|';

/// Role a peer claims when connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredRole {
    Host,
    Client,
}

impl DeclaredRole {
    pub fn marker(&self) -> &'static str {
        match self {
            DeclaredRole::Host => HOST_MARKER,
            DeclaredRole::Client => CLIENT_MARKER,
        }
    }

    /// Exact marker match, used by gated admission
    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            HOST_MARKER => Some(DeclaredRole::Host),
            CLIENT_MARKER => Some(DeclaredRole::Client),
            _ => None,
        }
    }

    /// Lenient detection used by open admission: any token mentioning the
    /// host marker declares a host.
    pub fn sniff(token: &str) -> Self {
        if token.contains(HOST_MARKER) {
            DeclaredRole::Host
        } else {
            DeclaredRole::Client
        }
    }

    /// Role byte this peer puts on the messages it sends
    pub fn packet_role(&self) -> Role {
        match self {
            DeclaredRole::Host => Role::Host,
            DeclaredRole::Client => Role::Client,
        }
    }
}

impl fmt::Display for DeclaredRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclaredRole::Host => write!(f, "host"),
            DeclaredRole::Client => write!(f, "client"),
        }
    }
}

/// A parsed `<baseKey>|<marker>` token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleToken {
    base_key: String,
    role: DeclaredRole,
}

impl RoleToken {
    pub fn new(base_key: impl Into<String>, role: DeclaredRole) -> Self {
        Self {
            base_key: base_key.into(),
            role,
        }
    }

    pub fn parse(token: &str) -> Result<Self, CodecError> {
        let (base_key, marker) = token
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| CodecError::InvalidToken(token.to_string()))?;
        let role = DeclaredRole::from_marker(marker)
            .ok_or_else(|| CodecError::InvalidToken(token.to_string()))?;

        Ok(Self::new(base_key, role))
    }

    pub fn base_key(&self) -> &str {
        &self.base_key
    }

    pub fn role(&self) -> DeclaredRole {
        self.role
    }
}

impl fmt::Display for RoleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.base_key, SEPARATOR, self.role.marker())
    }
}
