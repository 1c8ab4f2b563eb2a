// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session registry
//!
//! Owns the mapping between transport connections and session identifiers for
//! one server process. The host always holds [`HOST_ID`]; clients get
//! identifiers from a counter starting at [`FIRST_CLIENT_ID`].

use punchrelay_core::{DeclaredRole, SessionId, FIRST_CLIENT_ID, HOST_ID};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, info};

use crate::error::{NetworkError, NetworkResult};
use crate::transport::ConnectionId;

/// Which connection requests are admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionPolicy {
    /// Key prefix required, one host at a time, clients only while a host is present
    Gated,
    /// Any token is admitted
    Open,
}

/// What happens to the client counter when the host leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IdReuse {
    /// Never reassign an identifier while the process runs
    Monotonic,
    /// Restart client numbering at 1 once the host disconnects
    ResetOnHostLeave,
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionPolicy::Gated => write!(f, "gated"),
            AdmissionPolicy::Open => write!(f, "open"),
        }
    }
}

impl fmt::Display for IdReuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdReuse::Monotonic => write!(f, "monotonic"),
            IdReuse::ResetOnHostLeave => write!(f, "reset-on-host-leave"),
        }
    }
}

/// Registry settings, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub admission: AdmissionPolicy,
    pub id_reuse: IdReuse,
    /// Required token prefix under gated admission
    pub key_prefix: String,
    pub max_sessions: usize,
}

impl RegistryConfig {
    /// Relay defaults: gated, counter reset on host leave, 8 sessions
    pub fn relay() -> Self {
        Self {
            admission: AdmissionPolicy::Gated,
            id_reuse: IdReuse::ResetOnHostLeave,
            key_prefix: "relay|".to_string(),
            max_sessions: 8,
        }
    }

    /// Coordinator defaults: open, monotonic
    pub fn punch() -> Self {
        Self {
            admission: AdmissionPolicy::Open,
            id_reuse: IdReuse::Monotonic,
            key_prefix: "relay|".to_string(),
            max_sessions: 1024,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::relay()
    }
}

/// Server-side record of an admitted peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub connection: ConnectionId,
    /// External endpoint as observed by the transport
    pub endpoint: SocketAddr,
    pub is_host: bool,
}

#[derive(Debug)]
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: BTreeMap<SessionId, Session>,
    by_connection: HashMap<ConnectionId, SessionId>,
    next_client_id: SessionId,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: BTreeMap::new(),
            by_connection: HashMap::new(),
            next_client_id: FIRST_CLIENT_ID,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Validate `token` and record a session for `connection`.
    ///
    /// On error nothing is recorded and the caller must refuse the connection.
    pub fn admit(
        &mut self,
        token: &str,
        connection: ConnectionId,
        endpoint: SocketAddr,
    ) -> NetworkResult<SessionId> {
        if let Some(id) = self.by_connection.get(&connection) {
            return Ok(*id);
        }

        // Key and role are checked before capacity
        let role = match self.config.admission {
            AdmissionPolicy::Gated => self.gated_role(token)?,
            AdmissionPolicy::Open => match DeclaredRole::sniff(token) {
                DeclaredRole::Host if self.has_host() => {
                    debug!("Host already present, admitting {} as a client", endpoint);
                    DeclaredRole::Client
                }
                role => role,
            },
        };
        if self.sessions.len() >= self.config.max_sessions {
            return Err(NetworkError::CapacityExceeded(self.sessions.len()));
        }

        let id = match role {
            DeclaredRole::Host => HOST_ID,
            DeclaredRole::Client => self.allocate_client_id(),
        };
        self.sessions.insert(
            id,
            Session {
                id,
                connection,
                endpoint,
                is_host: role == DeclaredRole::Host,
            },
        );
        self.by_connection.insert(connection, id);

        info!("Admitted {} from {} as {} (id {})", connection, endpoint, role, id);
        Ok(id)
    }

    fn gated_role(&self, token: &str) -> NetworkResult<DeclaredRole> {
        let marker = token.strip_prefix(self.config.key_prefix.as_str()).ok_or_else(|| {
            NetworkError::RoleRejected(format!("token {:?} lacks key prefix", token))
        })?;
        let role = DeclaredRole::from_marker(marker)
            .ok_or_else(|| NetworkError::RoleRejected(format!("unknown role in {:?}", token)))?;

        match role {
            DeclaredRole::Host if self.has_host() => Err(NetworkError::RoleRejected(
                "a host is already connected".to_string(),
            )),
            DeclaredRole::Client if !self.has_host() => Err(NetworkError::RoleRejected(
                "no host connected".to_string(),
            )),
            role => Ok(role),
        }
    }

    /// Next free client identifier; skips identifiers still held after a
    /// counter reset.
    fn allocate_client_id(&mut self) -> SessionId {
        let mut id = self.next_client_id;
        while id == HOST_ID || self.sessions.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_client_id = id.wrapping_add(1);
        id
    }

    /// Drop the session owned by `connection`
    pub fn remove(&mut self, connection: ConnectionId) -> Option<Session> {
        let id = self.by_connection.remove(&connection)?;
        let session = self.sessions.remove(&id)?;

        if session.is_host && self.config.id_reuse == IdReuse::ResetOnHostLeave {
            debug!("Host left, client ids restart at {}", FIRST_CLIENT_ID);
            self.next_client_id = FIRST_CLIENT_ID;
        }
        Some(session)
    }

    pub fn lookup(&self, id: SessionId) -> Option<ConnectionId> {
        self.sessions.get(&id).map(|session| session.connection)
    }

    pub fn lookup_id(&self, connection: ConnectionId) -> Option<SessionId> {
        self.by_connection.get(&connection).copied()
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// All sessions except `except`, in identifier order
    pub fn others(&self, except: SessionId) -> impl Iterator<Item = &Session> + '_ {
        self.sessions.values().filter(move |session| session.id != except)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> + '_ {
        self.sessions.values()
    }

    pub fn has_host(&self) -> bool {
        self.sessions.contains_key(&HOST_ID)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.by_connection.clear();
        self.next_client_id = FIRST_CLIENT_ID;
    }
}
