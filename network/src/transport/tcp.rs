// SPDX-License-Identifier: MIT OR Apache-2.0

//! Real-socket transport built on tokio
//!
//! Connected traffic runs over TCP streams, unconnected datagrams over a UDP
//! socket bound to the same port. Outgoing streams are opened from the listen
//! port (SO_REUSEADDR/SO_REUSEPORT) so a NAT sees one mapping for everything
//! the transport sends, which is what hole punching relies on.
//!
//! Stream frames: `[len: u32 BE][kind: u8][body]`. `Data` bodies start with
//! the delivery method byte. Datagrams: `[kind: u8][data]`.
//!
//! Socket work happens on background tasks; the owner only sees it through
//! [`Transport::poll_event`], which never blocks.

use bytes::{BufMut, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    ConnectionId, DeliveryMethod, DisconnectReason, Transport, TransportEvent, UnconnectedKind,
};
use crate::error::{NetworkError, NetworkResult};
use punchrelay_core::encode_endpoint;

/// Largest frame accepted from a stream
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const MAX_DATAGRAM_LEN: usize = 65_535;

const FRAME_CONNECT_REQUEST: u8 = 1;
const FRAME_ACCEPT: u8 = 2;
const FRAME_REJECT: u8 = 3;
const FRAME_DATA: u8 = 4;
const FRAME_DISCONNECT: u8 = 5;

/// Settings for [`TcpTransport::bind`]
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Listen address; port 0 picks an ephemeral port
    pub bind: SocketAddr,
    /// Open outgoing streams from the listen port
    pub reuse_port: bool,
    /// Time allowed for the connect handshake
    pub handshake_timeout: Duration,
}

impl TcpTransportConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            reuse_port: true,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    ConnectRequest(String),
    Accept,
    Reject,
    Data(DeliveryMethod, Vec<u8>),
    Disconnect,
}

const EMPTY: &[u8] = &[];

impl Frame {
    fn encode(&self) -> Vec<u8> {
        let (kind, body): (u8, &[u8]) = match self {
            Frame::ConnectRequest(token) => (FRAME_CONNECT_REQUEST, token.as_bytes()),
            Frame::Accept => (FRAME_ACCEPT, EMPTY),
            Frame::Reject => (FRAME_REJECT, EMPTY),
            Frame::Data(_, data) => (FRAME_DATA, data.as_slice()),
            Frame::Disconnect => (FRAME_DISCONNECT, EMPTY),
        };
        let extra = usize::from(matches!(self, Frame::Data(..)));
        let len = 1 + extra + body.len();

        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_u32(len as u32);
        buf.put_u8(kind);
        if let Frame::Data(delivery, _) = self {
            buf.put_u8(*delivery as u8);
        }
        buf.put_slice(body);
        buf.to_vec()
    }

    fn decode(frame: &[u8]) -> io::Result<Frame> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
        let (&kind, body) = frame.split_first().ok_or_else(|| invalid("empty frame"))?;
        match kind {
            FRAME_CONNECT_REQUEST => {
                let token = String::from_utf8(body.to_vec())
                    .map_err(|_| invalid("connect token is not UTF-8"))?;
                Ok(Frame::ConnectRequest(token))
            }
            FRAME_ACCEPT => Ok(Frame::Accept),
            FRAME_REJECT => Ok(Frame::Reject),
            FRAME_DATA => {
                let (&delivery, data) =
                    body.split_first().ok_or_else(|| invalid("data frame without delivery"))?;
                let delivery = DeliveryMethod::from_u8(delivery)
                    .ok_or_else(|| invalid("unknown delivery method"))?;
                Ok(Frame::Data(delivery, data.to_vec()))
            }
            FRAME_DISCONNECT => Ok(Frame::Disconnect),
            _ => Err(invalid("unknown frame kind")),
        }
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} out of range", len),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Frame::decode(&buf).map(Some)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    writer.write_all(&frame.encode()).await
}

/// Socket with SO_REUSEADDR and, where the platform has it, SO_REUSEPORT
fn reusable_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    if let Err(e) = socket.set_reuse_port(true) {
        warn!("Failed to set SO_REUSEPORT: {}", e);
    }

    Ok(socket)
}

fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = reusable_socket(addr)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

async fn open_stream(local: SocketAddr, remote: SocketAddr, reuse_port: bool) -> io::Result<TcpStream> {
    if reuse_port && local.is_ipv4() == remote.is_ipv4() {
        let attempt = async {
            let socket = reusable_socket(local)?;
            socket.bind(&local.into())?;
            socket.set_nonblocking(true)?;
            let socket = TcpSocket::from_std_stream(socket.into());
            socket.connect(remote).await
        };
        match attempt.await {
            Ok(stream) => return Ok(stream),
            Err(e) => debug!("Connecting from listen port {} failed ({}), using ephemeral", local, e),
        }
    }
    TcpStream::connect(remote).await
}

enum Internal {
    Request {
        conn: ConnectionId,
        endpoint: SocketAddr,
        token: String,
        decision: oneshot::Sender<bool>,
        outbound: mpsc::UnboundedSender<Frame>,
    },
    Event(TransportEvent),
}

struct Link {
    remote: SocketAddr,
    outbound: mpsc::UnboundedSender<Frame>,
    connected: bool,
}

struct PendingRequest {
    remote: SocketAddr,
    decision: oneshot::Sender<bool>,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// [`Transport`] over TCP streams and a UDP socket
pub struct TcpTransport {
    config: TcpTransportConfig,
    local_addr: SocketAddr,
    runtime: Handle,
    next_conn: Arc<AtomicU64>,
    udp: Arc<UdpSocket>,
    links: HashMap<ConnectionId, Link>,
    pending: HashMap<ConnectionId, PendingRequest>,
    queued: VecDeque<TransportEvent>,
    events_tx: mpsc::UnboundedSender<Internal>,
    events_rx: mpsc::UnboundedReceiver<Internal>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpTransport {
    /// Bind the listener and datagram socket and start the background tasks
    pub async fn bind(config: TcpTransportConfig) -> NetworkResult<Self> {
        let bind_error = |source| NetworkError::Bind {
            addr: config.bind,
            source,
        };

        let listener = bind_listener(config.bind)
            .and_then(TcpListener::from_std)
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        let udp = UdpSocket::bind(local_addr).await.map_err(|source| NetworkError::Bind {
            addr: local_addr,
            source,
        })?;
        let udp = Arc::new(udp);

        info!("Transport listening on {} (tcp+udp)", local_addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let next_conn = Arc::new(AtomicU64::new(1));
        let runtime = Handle::current();

        let tasks = vec![
            runtime.spawn(accept_loop(
                listener,
                Arc::clone(&next_conn),
                events_tx.clone(),
                config.handshake_timeout,
            )),
            runtime.spawn(datagram_loop(Arc::clone(&udp), events_tx.clone())),
        ];

        Ok(Self {
            config,
            local_addr,
            runtime,
            next_conn,
            udp,
            links: HashMap::new(),
            pending: HashMap::new(),
            queued: VecDeque::new(),
            events_tx,
            events_rx,
            tasks,
        })
    }

    fn alloc(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Track link state; drops events for connections already closed locally
    fn admit_event(&mut self, event: TransportEvent) -> Option<TransportEvent> {
        match &event {
            TransportEvent::PeerConnected { conn, .. } => {
                self.links.get_mut(conn)?.connected = true;
            }
            TransportEvent::PeerDisconnected { conn, .. } => {
                self.links.remove(conn)?;
            }
            TransportEvent::Receive { conn, .. } => {
                if !self.links.get(conn)?.connected {
                    return None;
                }
            }
            _ => {}
        }
        Some(event)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Transport for TcpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn connect(&mut self, addr: SocketAddr, token: &str) -> NetworkResult<ConnectionId> {
        let conn = self.alloc();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.links.insert(
            conn,
            Link {
                remote: addr,
                outbound,
                connected: false,
            },
        );

        self.runtime.spawn(dial(
            conn,
            self.local_addr,
            addr,
            token.to_string(),
            self.config.clone(),
            outbound_rx,
            self.events_tx.clone(),
        ));
        debug!("{} dialing {}", conn, addr);
        Ok(conn)
    }

    fn accept(&mut self, conn: ConnectionId) {
        if let Some(request) = self.pending.remove(&conn) {
            self.links.insert(
                conn,
                Link {
                    remote: request.remote,
                    outbound: request.outbound,
                    connected: false,
                },
            );
            let _ = request.decision.send(true);
        }
    }

    fn reject(&mut self, conn: ConnectionId) {
        if let Some(request) = self.pending.remove(&conn) {
            let _ = request.decision.send(false);
        }
    }

    fn send(&mut self, conn: ConnectionId, data: Vec<u8>, delivery: DeliveryMethod) {
        match self.links.get(&conn) {
            Some(link) => {
                if link.outbound.send(Frame::Data(delivery, data)).is_err() {
                    trace!("{} writer already closed", conn);
                }
            }
            None => trace!("Dropping send on unknown {}", conn),
        }
    }

    fn send_unconnected(&mut self, addr: SocketAddr, data: Vec<u8>, kind: UnconnectedKind) {
        let mut datagram = Vec::with_capacity(1 + data.len());
        datagram.push(kind as u8);
        datagram.extend_from_slice(&data);
        if let Err(e) = self.udp.try_send_to(&datagram, addr) {
            warn!("Unconnected send to {} failed: {}", addr, e);
        }
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        if let Some(link) = self.links.remove(&conn) {
            let _ = link.outbound.send(Frame::Disconnect);
            self.queued.push_back(TransportEvent::PeerDisconnected {
                conn,
                reason: DisconnectReason::LocalDisconnect,
            });
        } else if let Some(request) = self.pending.remove(&conn) {
            let _ = request.decision.send(false);
        }
    }

    fn disconnect_all(&mut self) {
        let conns: Vec<ConnectionId> = self.links.keys().chain(self.pending.keys()).copied().collect();
        for conn in conns {
            self.disconnect(conn);
        }
    }

    fn remote_endpoint(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.links
            .get(&conn)
            .map(|link| link.remote)
            .or_else(|| self.pending.get(&conn).map(|request| request.remote))
    }

    /// Answers with the endpoint the datagram was observed from, so the
    /// sender learns its external mapping.
    fn process_nat_message(&mut self, from: SocketAddr, data: &[u8]) {
        debug!("NAT message from {} ({} bytes)", from, data.len());
        self.send_unconnected(from, encode_endpoint(from), UnconnectedKind::NatMessage);
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }
        loop {
            match self.events_rx.try_recv() {
                Ok(Internal::Request {
                    conn,
                    endpoint,
                    token,
                    decision,
                    outbound,
                }) => {
                    self.pending.insert(
                        conn,
                        PendingRequest {
                            remote: endpoint,
                            decision,
                            outbound,
                        },
                    );
                    return Some(TransportEvent::ConnectionRequest {
                        conn,
                        endpoint,
                        token,
                    });
                }
                Ok(Internal::Event(event)) => {
                    if let Some(event) = self.admit_event(event) {
                        return Some(event);
                    }
                }
                Err(_) => return None,
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    next_conn: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<Internal>,
    handshake_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let conn = ConnectionId(next_conn.fetch_add(1, Ordering::Relaxed));
                trace!("{} inbound stream from {}", conn, remote);
                tokio::spawn(answer(conn, stream, remote, events.clone(), handshake_timeout));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                let event = TransportEvent::NetworkError {
                    endpoint: None,
                    message: e.to_string(),
                };
                if events.send(Internal::Event(event)).is_err() {
                    return;
                }
            }
        }
    }
}

async fn datagram_loop(udp: Arc<UdpSocket>, events: mpsc::UnboundedSender<Internal>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let event = match udp.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let kind = buf[..len].first().copied().and_then(UnconnectedKind::from_u8);
                match kind {
                    Some(kind) => TransportEvent::ReceiveUnconnected {
                        from,
                        data: buf[1..len].to_vec(),
                        kind,
                    },
                    None => {
                        trace!("Ignoring datagram from {} without a known kind", from);
                        continue;
                    }
                }
            }
            Err(e) => TransportEvent::NetworkError {
                endpoint: None,
                message: e.to_string(),
            },
        };
        if events.send(Internal::Event(event)).is_err() {
            return;
        }
    }
}

/// Inbound handshake: wait for the request token and the owner's decision
async fn answer(
    conn: ConnectionId,
    mut stream: TcpStream,
    remote: SocketAddr,
    events: mpsc::UnboundedSender<Internal>,
    handshake_timeout: Duration,
) {
    let token = match tokio::time::timeout(handshake_timeout, read_frame(&mut stream)).await {
        Ok(Ok(Some(Frame::ConnectRequest(token)))) => token,
        other => {
            debug!("{} from {}: no connect request ({:?})", conn, remote, other.map(|r| r.ok()));
            return;
        }
    };

    let (decision_tx, decision_rx) = oneshot::channel();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let request = Internal::Request {
        conn,
        endpoint: remote,
        token,
        decision: decision_tx,
        outbound,
    };
    if events.send(request).is_err() {
        return;
    }

    if !decision_rx.await.unwrap_or(false) {
        let _ = write_frame(&mut stream, &Frame::Reject).await;
        let _ = stream.shutdown().await;
        return;
    }
    if let Err(e) = write_frame(&mut stream, &Frame::Accept).await {
        let _ = events.send(Internal::Event(TransportEvent::PeerDisconnected {
            conn,
            reason: DisconnectReason::NetworkError,
        }));
        debug!("{} accept write failed: {}", conn, e);
        return;
    }

    let connected = TransportEvent::PeerConnected {
        conn,
        endpoint: remote,
    };
    if events.send(Internal::Event(connected)).is_ok() {
        run_link(conn, stream, outbound_rx, events).await;
    }
}

/// Outbound handshake: open the stream, send the token and wait for the answer
async fn dial(
    conn: ConnectionId,
    local: SocketAddr,
    remote: SocketAddr,
    token: String,
    config: TcpTransportConfig,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<Internal>,
) {
    let handshake = async {
        let mut stream = open_stream(local, remote, config.reuse_port).await?;
        write_frame(&mut stream, &Frame::ConnectRequest(token)).await?;
        let mut reply = read_frame(&mut stream).await?;
        if let Some(Frame::ConnectRequest(_)) = reply {
            // Simultaneous open: both sides dialed, each accepts the other
            debug!("{} simultaneous open with {}", conn, remote);
            write_frame(&mut stream, &Frame::Accept).await?;
            reply = read_frame(&mut stream).await?;
        }
        Ok::<_, io::Error>((stream, reply))
    };

    let outcome = tokio::time::timeout(config.handshake_timeout, handshake).await;
    let event = match outcome {
        Ok(Ok((stream, Some(Frame::Accept)))) => {
            let connected = TransportEvent::PeerConnected {
                conn,
                endpoint: remote,
            };
            if events.send(Internal::Event(connected)).is_ok() {
                run_link(conn, stream, outbound_rx, events).await;
            }
            return;
        }
        Ok(Ok((_, Some(Frame::Reject)))) => TransportEvent::PeerDisconnected {
            conn,
            reason: DisconnectReason::ConnectionRejected,
        },
        Ok(Ok(_)) => TransportEvent::PeerDisconnected {
            conn,
            reason: DisconnectReason::ConnectionFailed,
        },
        Ok(Err(e)) => {
            debug!("{} to {} failed: {}", conn, remote, e);
            TransportEvent::PeerDisconnected {
                conn,
                reason: DisconnectReason::ConnectionFailed,
            }
        }
        Err(_) => TransportEvent::PeerDisconnected {
            conn,
            reason: DisconnectReason::Timeout,
        },
    };
    let _ = events.send(Internal::Event(event));
}

/// Pump an established stream until either side closes it
async fn run_link(
    conn: ConnectionId,
    stream: TcpStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<Internal>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let last = frame == Frame::Disconnect;
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("{} write failed: {}", conn, e);
                break;
            }
            if last {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Data(delivery, data))) => {
                let event = TransportEvent::Receive {
                    conn,
                    data,
                    delivery,
                };
                if events.send(Internal::Event(event)).is_err() {
                    break DisconnectReason::LocalDisconnect;
                }
            }
            Ok(Some(Frame::Disconnect)) | Ok(None) => break DisconnectReason::RemoteClose,
            Ok(Some(other)) => trace!("{} ignoring {:?} after handshake", conn, other),
            Err(e) => {
                debug!("{} read failed: {}", conn, e);
                break DisconnectReason::NetworkError;
            }
        }
    };

    writer_task.abort();
    let _ = events.send(Internal::Event(TransportEvent::PeerDisconnected { conn, reason }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = Frame::Data(DeliveryMethod::ReliableOrdered, vec![9, 8]);
        let bytes = frame.encode();
        assert_eq!(&bytes[..4], &4u32.to_be_bytes());
        assert_eq!(bytes[4], FRAME_DATA);
        assert_eq!(bytes[5], DeliveryMethod::ReliableOrdered as u8);
        assert_eq!(Frame::decode(&bytes[4..]).unwrap(), frame);

        let request = Frame::ConnectRequest("relay|I_AM_HOST".into());
        assert_eq!(Frame::decode(&request.encode()[4..]).unwrap(), request);
    }

    #[test]
    fn test_bad_frames() {
        assert!(Frame::decode(&[]).is_err());
        assert!(Frame::decode(&[99]).is_err());
        assert!(Frame::decode(&[FRAME_DATA]).is_err());
        assert!(Frame::decode(&[FRAME_DATA, 3, 1]).is_err());
    }

    async fn next_event(transport: &mut TcpTransport) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(event) = transport.poll_event() {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no transport event")
    }

    #[tokio::test]
    async fn test_simultaneous_open_connects() {
        let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
        let remote = TcpListener::bind(loopback).await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        let mut transport = TcpTransport::bind(TcpTransportConfig::new(loopback)).await.unwrap();

        let conn = transport.connect(remote_addr, "game").unwrap();
        let (mut stream, _) = remote.accept().await.unwrap();

        // The other side dialed too: its request crosses ours on one stream
        assert_eq!(
            read_frame(&mut stream).await.unwrap(),
            Some(Frame::ConnectRequest("game".into()))
        );
        write_frame(&mut stream, &Frame::ConnectRequest("game".into())).await.unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap(), Some(Frame::Accept));
        write_frame(&mut stream, &Frame::Accept).await.unwrap();

        assert_eq!(
            next_event(&mut transport).await,
            TransportEvent::PeerConnected {
                conn,
                endpoint: remote_addr
            }
        );

        write_frame(&mut stream, &Frame::Data(DeliveryMethod::Sequenced, vec![7]))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut transport).await,
            TransportEvent::Receive {
                conn,
                data: vec![7],
                delivery: DeliveryMethod::Sequenced
            }
        );
    }

    #[tokio::test]
    async fn test_read_frame_stops_at_eof() {
        let mut input: &[u8] = &[];
        assert!(read_frame(&mut input).await.unwrap().is_none());

        let bytes = Frame::Accept.encode();
        let mut input: &[u8] = &bytes;
        assert_eq!(read_frame(&mut input).await.unwrap(), Some(Frame::Accept));
    }
}
