// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client session state machine
//!
//! A peer first registers with the punch coordinator, then tries a direct
//! connection to the endpoint the coordinator hands out. When that attempt
//! fails or times out the machine connects to the relay instead. Either way
//! the application sees the same [`SessionEvent`]s, with data tagged by the
//! original sender's session id.
//!
//! ```text
//! Disconnected -> ConnectingToPunchServer -> WaitingForPunch -> Punching -> Connected
//!                                                                  |
//!                                                                  +-> ConnectingToRelay -> Connected
//! ```
//!
//! The machine never blocks. [`PunchClient::tick`] drains transport events
//! and checks the punch timeout and relay retry schedule once per call.

use punchrelay_core::{
    decode_endpoint, DeclaredRole, Packet, PacketType, Role, RoleToken, SessionId, HOST_ID,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::membership::send_packet;
use crate::transport::{
    ConnectionId, DeliveryMethod, DisconnectReason, Transport, TransportEvent, UnconnectedKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    ConnectingToPunchServer,
    WaitingForPunch,
    Punching,
    ConnectingToRelay,
    Connected,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::ConnectingToPunchServer => "connecting to punch server",
            ClientState::WaitingForPunch => "waiting for punch",
            ClientState::Punching => "punching",
            ClientState::ConnectingToRelay => "connecting to relay",
            ClientState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// How application data currently travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    Direct,
    Relayed,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::Direct => write!(f, "direct"),
            PathKind::Relayed => write!(f, "relayed"),
        }
    }
}

/// Why the machine gave up on a direct path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    PunchTimeout,
    TransportDisconnect(DisconnectReason),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::PunchTimeout => write!(f, "punch timeout"),
            FallbackReason::TransportDisconnect(reason) => write!(f, "punch attempt closed ({})", reason),
        }
    }
}

/// Why the machine went back to `Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// `disconnect` was called
    Local,
    TransportDisconnect(DisconnectReason),
    /// Every relay attempt failed
    RelayUnavailable,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::Local => write!(f, "local disconnect"),
            DisconnectCause::TransportDisconnect(reason) => write!(f, "{}", reason),
            DisconnectCause::RelayUnavailable => write!(f, "relay unavailable"),
        }
    }
}

/// What the application learns from [`PunchClient::poll_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: ClientState,
        to: ClientState,
    },
    IdAssigned(SessionId),
    Connected {
        path: PathKind,
    },
    PeerJoined(SessionId),
    PeerLeft(SessionId),
    Data {
        sender: SessionId,
        payload: Vec<u8>,
        delivery: DeliveryMethod,
    },
    FallbackToRelay {
        reason: FallbackReason,
    },
    Disconnected {
        cause: DisconnectCause,
    },
}

/// Punch-first, relay-second peer session over any [`Transport`]
pub struct PunchClient<T> {
    transport: T,
    config: ClientConfig,
    role: Option<DeclaredRole>,
    state: ClientState,
    local_id: Option<SessionId>,
    /// Connection the current state is about: coordinator, punch attempt,
    /// relay or the established direct link
    current: Option<ConnectionId>,
    path: Option<PathKind>,
    target: Option<(SocketAddr, SessionId)>,
    punch_started: Option<Instant>,
    /// Established connections that did not come from our own dialing
    direct_links: HashMap<ConnectionId, SocketAddr>,
    relay_attempts: u32,
    retry_at: Option<Instant>,
    events: VecDeque<SessionEvent>,
}

impl<T: Transport> PunchClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            role: None,
            state: ClientState::Disconnected,
            local_id: None,
            current: None,
            path: None,
            target: None,
            punch_started: None,
            direct_links: HashMap::new(),
            relay_attempts: 0,
            retry_at: None,
            events: VecDeque::new(),
        }
    }

    pub fn start_host(&mut self) -> NetworkResult<()> {
        self.start(DeclaredRole::Host)
    }

    pub fn start_client(&mut self) -> NetworkResult<()> {
        self.start(DeclaredRole::Client)
    }

    fn start(&mut self, role: DeclaredRole) -> NetworkResult<()> {
        if let Some(current) = self.role {
            return Err(NetworkError::AlreadyStarted(current.to_string()));
        }

        let token = RoleToken::new(self.config.base_key.as_str(), role);
        info!(
            "Starting as {} -> punch server {}",
            role, self.config.punch_server
        );
        let conn = self
            .transport
            .connect(self.config.punch_server, &token.to_string())?;

        self.role = Some(role);
        self.current = Some(conn);
        self.set_state(ClientState::ConnectingToPunchServer);
        Ok(())
    }

    /// Send application data to `recipient` over the current path
    pub fn send(
        &mut self,
        recipient: SessionId,
        payload: impl Into<Vec<u8>>,
        delivery: DeliveryMethod,
    ) -> NetworkResult<()> {
        let (conn, role, id) = match (self.state, self.current, self.role, self.local_id) {
            (ClientState::Connected, Some(conn), Some(role), Some(id)) => (conn, role, id),
            _ => return Err(NetworkError::NotConnected),
        };

        let packet = Packet::data(role.packet_role(), payload)
            .with_sender(id)
            .with_recipient(recipient);
        let bytes = packet.encode()?;
        self.transport.send(conn, bytes, delivery);
        Ok(())
    }

    /// Close every connection and return to `Disconnected`
    pub fn disconnect(&mut self) {
        if self.state == ClientState::Disconnected && self.role.is_none() {
            return;
        }
        info!("Disconnecting");
        self.enter_disconnected(DisconnectCause::Local);
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn role(&self) -> Option<DeclaredRole> {
        self.role
    }

    pub fn local_id(&self) -> Option<SessionId> {
        self.local_id
    }

    pub fn path(&self) -> Option<PathKind> {
        self.path
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// [`tick`](Self::tick) with the current time
    pub fn poll(&mut self) {
        self.tick(Instant::now());
    }

    /// Drain transport events, then check the punch timeout and the relay
    /// retry schedule against `now`.
    pub fn tick(&mut self, now: Instant) {
        while let Some(event) = self.transport.poll_event() {
            self.handle_transport_event(event, now);
        }

        if matches!(self.state, ClientState::Punching | ClientState::WaitingForPunch) {
            let expired = self
                .punch_started
                .map_or(false, |started| now.saturating_duration_since(started) > self.config.punch_timeout);
            if expired {
                if self.state == ClientState::Punching {
                    info!("NAT punch timeout, falling back to relay");
                } else {
                    info!("No punch info from coordinator, falling back to relay");
                }
                self.fallback(FallbackReason::PunchTimeout, now);
            }
        }

        if self.state == ClientState::ConnectingToRelay {
            if let Some(at) = self.retry_at {
                if now >= at {
                    self.retry_at = None;
                    self.connect_relay(now);
                }
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::ConnectionRequest { conn, endpoint, .. } => {
                debug!("Accepting connection request {} from {}", conn, endpoint);
                self.transport.accept(conn);
            }
            TransportEvent::PeerConnected { conn, endpoint } => self.on_connected(conn, endpoint),
            TransportEvent::PeerDisconnected { conn, reason } => {
                self.on_disconnected(conn, reason, now)
            }
            TransportEvent::Receive {
                conn,
                data,
                delivery,
            } => self.on_receive(conn, &data, delivery, now),
            TransportEvent::ReceiveUnconnected { from, data, kind } => {
                if kind == UnconnectedKind::NatMessage {
                    self.transport.process_nat_message(from, &data);
                }
            }
            TransportEvent::NetworkError { endpoint, message } => {
                warn!("Network error @ {:?}: {}", endpoint, message);
            }
        }
    }

    fn on_connected(&mut self, conn: ConnectionId, endpoint: SocketAddr) {
        debug!("{} connected to {}", conn, endpoint);

        if self.current != Some(conn) {
            self.direct_links.insert(conn, endpoint);
            if self.state == ClientState::Punching && self.is_target(endpoint) {
                // The target reached us before our own attempt finished
                if let Some(attempt) = self.current.take() {
                    self.transport.disconnect(attempt);
                }
                self.complete_punch(conn);
            }
            return;
        }

        match self.state {
            ClientState::ConnectingToPunchServer => {
                self.set_state(ClientState::WaitingForPunch);
                if self.role == Some(DeclaredRole::Host) {
                    info!("Host connected to punch server, waiting for clients");
                }
            }
            ClientState::Punching => {
                self.direct_links.insert(conn, endpoint);
                self.complete_punch(conn);
            }
            ClientState::ConnectingToRelay => {
                // Connected only once the relay has assigned an id
                info!("Connected to relay {}, waiting for id", endpoint);
            }
            _ => trace!("Ignoring connect of {} in state {}", conn, self.state),
        }
    }

    fn on_disconnected(&mut self, conn: ConnectionId, reason: DisconnectReason, now: Instant) {
        self.direct_links.remove(&conn);
        if self.current != Some(conn) {
            trace!("{} closed ({}), not the current connection", conn, reason);
            return;
        }
        self.current = None;
        info!("Current connection closed: {}", reason);

        match self.state {
            ClientState::Punching => {
                info!("NAT punch failed, falling back to relay");
                self.fallback(FallbackReason::TransportDisconnect(reason), now);
            }
            ClientState::ConnectingToRelay => self.schedule_relay_retry(now),
            ClientState::Connected if self.path == Some(PathKind::Direct) => {
                match self.direct_links.keys().next().copied() {
                    Some(spare) => {
                        debug!("Switching direct path to {}", spare);
                        self.current = Some(spare);
                    }
                    None => self.enter_disconnected(DisconnectCause::TransportDisconnect(reason)),
                }
            }
            ClientState::Disconnected => {}
            _ => self.enter_disconnected(DisconnectCause::TransportDisconnect(reason)),
        }
    }

    fn on_receive(&mut self, conn: ConnectionId, data: &[u8], delivery: DeliveryMethod, now: Instant) {
        let from_current = self.current == Some(conn);
        if !from_current && !self.direct_links.contains_key(&conn) {
            trace!("Dropping data from unknown {}", conn);
            return;
        }

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed message from {}: {}", conn, e);
                return;
            }
        };

        match packet.kind() {
            PacketType::Data => self.events.push_back(SessionEvent::Data {
                sender: packet.sender(),
                delivery,
                payload: packet.into_payload(),
            }),
            PacketType::IdAssign if from_current => {
                self.on_id_assign(conn, packet.recipient(), now)
            }
            PacketType::PunchInfo if from_current => self.on_punch_info(&packet, now),
            PacketType::NotifyJoin => self.events.push_back(SessionEvent::PeerJoined(packet.sender())),
            PacketType::NotifyLeave => self.events.push_back(SessionEvent::PeerLeft(packet.sender())),
            other => debug!("Ignoring {:?} from {}", other, conn),
        }
    }

    fn on_id_assign(&mut self, conn: ConnectionId, id: SessionId, now: Instant) {
        info!("Received ID assignment: {}", id);
        self.local_id = Some(id);
        self.events.push_back(SessionEvent::IdAssigned(id));

        match self.state {
            ClientState::WaitingForPunch if self.role == Some(DeclaredRole::Client) => {
                let request = Packet::new(PacketType::PunchRequest, Role::Client)
                    .with_sender(id)
                    .with_recipient(HOST_ID);
                send_packet(&mut self.transport, conn, &request, DeliveryMethod::ReliableOrdered);
                // The coordinator never answers a request for a missing host
                self.punch_started = Some(now);
                debug!("Sent punch request to host");
            }
            ClientState::ConnectingToRelay => {
                self.relay_attempts = 0;
                self.path = Some(PathKind::Relayed);
                self.set_state(ClientState::Connected);
                self.events.push_back(SessionEvent::Connected {
                    path: PathKind::Relayed,
                });
            }
            _ => {}
        }
    }

    fn on_punch_info(&mut self, packet: &Packet, now: Instant) {
        if self.state != ClientState::WaitingForPunch {
            debug!("Ignoring punch info in state {}", self.state);
            return;
        }
        let endpoint = match decode_endpoint(packet.payload()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("Dropping punch info: {}", e);
                return;
            }
        };
        let target_id = packet.recipient();
        info!("Received punch info for {} @ {}", target_id, endpoint);
        self.target = Some((endpoint, target_id));

        if let Some(coordinator) = self.current.take() {
            self.transport.disconnect(coordinator);
        }
        self.punch_started = Some(now);
        self.set_state(ClientState::Punching);

        let early = self
            .direct_links
            .iter()
            .find(|(_, addr)| **addr == endpoint)
            .map(|(conn, _)| *conn);
        if let Some(conn) = early {
            self.complete_punch(conn);
            return;
        }

        match self.transport.connect(endpoint, &self.config.base_key) {
            Ok(conn) => self.current = Some(conn),
            Err(e) => {
                warn!("Direct connect to {} failed: {}", endpoint, e);
                self.fallback(FallbackReason::TransportDisconnect(DisconnectReason::ConnectionFailed), now);
            }
        }
    }

    fn is_target(&self, endpoint: SocketAddr) -> bool {
        self.target.map_or(false, |(addr, _)| addr == endpoint)
    }

    fn complete_punch(&mut self, conn: ConnectionId) {
        info!("NAT punch successful");
        self.current = Some(conn);
        self.punch_started = None;
        self.path = Some(PathKind::Direct);
        self.set_state(ClientState::Connected);
        self.events.push_back(SessionEvent::Connected {
            path: PathKind::Direct,
        });
    }

    fn fallback(&mut self, reason: FallbackReason, now: Instant) {
        if let Some(attempt) = self.current.take() {
            self.transport.disconnect(attempt);
        }
        self.punch_started = None;
        self.relay_attempts = 0;
        // Ids are per server; the relay assigns a fresh one
        self.local_id = None;
        self.events.push_back(SessionEvent::FallbackToRelay { reason });
        self.set_state(ClientState::ConnectingToRelay);
        self.connect_relay(now);
    }

    fn connect_relay(&mut self, now: Instant) {
        let Some(role) = self.role else {
            return;
        };
        self.relay_attempts += 1;
        let token = RoleToken::new(self.config.relay_key.as_str(), role);
        info!(
            "Connecting to relay {} (attempt {}/{})",
            self.config.relay_server, self.relay_attempts, self.config.relay_retry.max_attempts
        );

        match self.transport.connect(self.config.relay_server, &token.to_string()) {
            Ok(conn) => self.current = Some(conn),
            Err(e) => {
                warn!("Relay connect failed: {}", e);
                self.schedule_relay_retry(now);
            }
        }
    }

    fn schedule_relay_retry(&mut self, now: Instant) {
        if self.relay_attempts >= self.config.relay_retry.max_attempts {
            warn!("Relay unreachable after {} attempts", self.relay_attempts);
            self.enter_disconnected(DisconnectCause::RelayUnavailable);
            return;
        }
        self.retry_at = Some(now + self.config.relay_retry.delay);
    }

    fn enter_disconnected(&mut self, cause: DisconnectCause) {
        self.transport.disconnect_all();
        self.role = None;
        self.local_id = None;
        self.current = None;
        self.path = None;
        self.target = None;
        self.punch_started = None;
        self.retry_at = None;
        self.relay_attempts = 0;
        self.direct_links.clear();
        self.set_state(ClientState::Disconnected);
        self.events.push_back(SessionEvent::Disconnected { cause });
    }

    fn set_state(&mut self, to: ClientState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("State {} -> {}", from, to);
        self.state = to;
        self.events.push_back(SessionEvent::StateChanged { from, to });
    }
}
