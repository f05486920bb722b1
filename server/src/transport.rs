//! UDP transport: socket tasks on the network side, session-aware send
//! primitives on the simulation side
//!
//! [`UdpServer`] owns the socket. Its receive task turns datagrams into
//! [`PendingPacket`]s and hands them to the simulation; its send task drains
//! outgoing datagrams produced by the simulation. [`Transport`] lives on the
//! simulation thread, owns the [`SessionRegistry`] and resolves unicast and
//! broadcast sends into per-endpoint datagrams handed to a [`PacketSink`].

use crate::error::ServerError;
use crate::queue::{MessageQueue, PendingPacket};
use crate::session::{SessionId, SessionRegistry};
use log::{debug, error, info, warn};
use shared::codec::{encode, PacketParser, HEADER_SIZE};
use shared::protocol::{SystemMessage, WireStruct};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Destination for datagrams produced by the simulation.
pub trait PacketSink: Send {
    fn send_to(&self, addr: SocketAddr, data: &[u8]);
}

/// One datagram waiting for the send task.
#[derive(Debug)]
pub struct OutboundPacket {
    pub addr: SocketAddr,
    pub data: Vec<u8>,
}

/// Forwards datagrams to the socket's send task.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundPacket>,
}

impl PacketSink for ChannelSink {
    fn send_to(&self, addr: SocketAddr, data: &[u8]) {
        if let Err(e) = self.tx.send(OutboundPacket {
            addr,
            data: data.to_vec(),
        }) {
            error!("Failed to queue packet for {}: {}", addr, e);
        }
    }
}

/// Discards everything.
pub struct NullSink;

impl PacketSink for NullSink {
    fn send_to(&self, _addr: SocketAddr, _data: &[u8]) {}
}

/// Keeps every datagram in memory; used to observe handler output without a
/// socket.
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PacketSink for RecordingSink {
    fn send_to(&self, addr: SocketAddr, data: &[u8]) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((addr, data.to_vec()));
    }
}

/// Result of matching an inbound packet against the session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Existing,
    Created,
    /// Unknown endpoint and no session was created for it.
    Unknown,
}

/// Session table plus best-effort send primitives.
pub struct Transport {
    sessions: SessionRegistry,
    sink: Box<dyn PacketSink>,
    accepting_new_sessions: bool,
}

impl Transport {
    pub fn new(sessions: SessionRegistry, sink: Box<dyn PacketSink>) -> Self {
        Self {
            sessions,
            sink,
            accepting_new_sessions: true,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionRegistry {
        &mut self.sessions
    }

    /// Whether datagrams from unknown endpoints open new sessions.
    pub fn set_accepting_new_sessions(&mut self, accepting: bool) {
        self.accepting_new_sessions = accepting;
    }

    pub fn is_accepting_new_sessions(&self) -> bool {
        self.accepting_new_sessions
    }

    /// Swaps the outgoing sink, returning the previous one.
    pub fn replace_sink(&mut self, sink: Box<dyn PacketSink>) -> Box<dyn PacketSink> {
        std::mem::replace(&mut self.sink, sink)
    }

    /// Resolves the packet's endpoint to a session, creating one when allowed,
    /// and refreshes its activity timestamp. Disconnect notices never create
    /// sessions.
    pub fn ingest(&mut self, packet: &PendingPacket) -> IngestOutcome {
        if let Some(session) = self.sessions.get_mut(&packet.session_id) {
            session.touch();
            return IngestOutcome::Existing;
        }
        let is_disconnect = packet.message_type() == SystemMessage::ClientDisconnect as u8;
        if !self.accepting_new_sessions || is_disconnect {
            return IngestOutcome::Unknown;
        }
        self.sessions.get_or_create(&packet.session_id, packet.addr);
        IngestOutcome::Created
    }

    /// Sends raw bytes to an endpoint that may not have a session.
    pub fn send_raw(&self, addr: SocketAddr, data: &[u8]) {
        self.sink.send_to(addr, data);
    }

    pub fn send_to_client(&self, id: &SessionId, data: &[u8]) -> bool {
        match self.sessions.get(id) {
            Some(session) if session.is_connected() => {
                self.sink.send_to(session.addr, data);
                true
            }
            _ => {
                debug!("Dropping send to unknown or disconnected session {}", id);
                false
            }
        }
    }

    pub fn broadcast(&self, data: &[u8]) {
        for (_, addr) in self.sessions.connected_addrs() {
            self.sink.send_to(addr, data);
        }
    }

    pub fn broadcast_except(&self, exclude: &SessionId, data: &[u8]) {
        for (id, addr) in self.sessions.connected_addrs() {
            if &id != exclude {
                self.sink.send_to(addr, data);
            }
        }
    }

    /// Encodes and unicasts one payload struct.
    pub fn send_struct<T: WireStruct>(
        &self,
        id: &SessionId,
        message_type: impl Into<u8>,
        flags: u8,
        value: &T,
    ) -> bool {
        match encode(message_type, flags, value) {
            Ok(bytes) => self.send_to_client(id, &bytes),
            Err(e) => {
                error!("Failed to encode packet for {}: {}", id, e);
                false
            }
        }
    }

    pub fn broadcast_struct<T: WireStruct>(
        &self,
        message_type: impl Into<u8>,
        flags: u8,
        value: &T,
    ) {
        match encode(message_type, flags, value) {
            Ok(bytes) => self.broadcast(&bytes),
            Err(e) => error!("Failed to encode broadcast: {}", e),
        }
    }

    pub fn broadcast_struct_except<T: WireStruct>(
        &self,
        exclude: &SessionId,
        message_type: impl Into<u8>,
        flags: u8,
        value: &T,
    ) {
        match encode(message_type, flags, value) {
            Ok(bytes) => self.broadcast_except(exclude, &bytes),
            Err(e) => error!("Failed to encode broadcast: {}", e),
        }
    }

    /// Drops the session for good.
    pub fn disconnect_client(&mut self, id: &SessionId) -> bool {
        self.sessions.mark_disconnected(id);
        self.sessions.remove(id).is_some()
    }

    pub fn cleanup_disconnected_clients(&mut self) -> Vec<SessionId> {
        self.sessions.cleanup_disconnected_clients()
    }
}

/// Where the receive task delivers datagrams.
#[derive(Clone)]
pub enum InboundRoute {
    Queue(Arc<MessageQueue>),
    /// Invoked on the receive task itself, bypassing the queue.
    Direct(Arc<dyn Fn(PendingPacket) + Send + Sync>),
}

impl InboundRoute {
    fn deliver(&self, packet: PendingPacket) {
        match self {
            InboundRoute::Queue(queue) => queue.push(packet),
            InboundRoute::Direct(handler) => handler(packet),
        }
    }
}

/// Converts one raw datagram into the packet handed to the simulation.
///
/// Datagrams shorter than a header become a disconnect notice for the sender;
/// malformed ones are dropped.
pub fn decode_datagram(data: &[u8], addr: SocketAddr) -> Option<PendingPacket> {
    if data.len() < HEADER_SIZE {
        info!("Short datagram from {}, treating as disconnect", addr);
        return Some(PendingPacket::new(
            addr,
            SystemMessage::ClientDisconnect as u8,
            &[],
        ));
    }

    let parser = PacketParser::new(data);
    match (parser.header(), parser.error()) {
        (Some(header), _) => Some(PendingPacket::new(
            addr,
            header.message_type,
            parser.payload(),
        )),
        (None, Some(e)) => {
            warn!("Dropping malformed packet from {}: {}", addr, e);
            None
        }
        (None, None) => None,
    }
}

/// The listening socket and its receive/send tasks.
pub struct UdpServer {
    local_addr: SocketAddr,
    receive_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl UdpServer {
    /// Binds the socket and starts the receive and send tasks. Returns the
    /// server handle and the sink the simulation sends through.
    pub async fn start(addr: &str, route: InboundRoute) -> Result<(Self, ChannelSink), ServerError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| {
            error!("Failed to bind {}: {}", addr, source);
            ServerError::Bind {
                addr: addr.to_string(),
                source,
            }
        })?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (tx, rx) = mpsc::unbounded_channel();
        let receive_task = Self::spawn_network_receiver(Arc::clone(&socket), route);
        let send_task = Self::spawn_network_sender(socket, rx);

        Ok((
            Self {
                local_addr,
                receive_task,
                send_task,
            },
            ChannelSink { tx },
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn spawn_network_receiver(socket: Arc<UdpSocket>, route: InboundRoute) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Some(packet) = decode_datagram(&buffer[..len], addr) {
                            route.deliver(packet);
                        }
                    }
                    // ICMP port-unreachable from a vanished client surfaces here
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                        debug!("Receive reset: {}", e);
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    fn spawn_network_sender(
        socket: Arc<UdpSocket>,
        mut rx: mpsc::UnboundedReceiver<OutboundPacket>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = socket.send_to(&packet.data, packet.addr).await {
                    error!("Failed to send packet to {}: {}", packet.addr, e);
                }
            }
        })
    }

    /// Stops receiving and waits briefly for queued sends to flush. The sink
    /// returned by [`start`](Self::start) must be dropped first for the flush
    /// to finish early.
    pub async fn shutdown(self) {
        self.receive_task.abort();
        if tokio::time::timeout(Duration::from_secs(1), self.send_task)
            .await
            .is_err()
        {
            debug!("Send task still busy at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::{ClientReady, GameMessage, PlayerLeave};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn transport() -> (Transport, RecordingSink) {
        let sink = RecordingSink::new();
        let transport = Transport::new(
            SessionRegistry::new(Duration::from_secs(300)),
            Box::new(sink.clone()),
        );
        (transport, sink)
    }

    #[test]
    fn test_decode_short_datagram_is_disconnect() {
        let packet = decode_datagram(&[0x01], addr(9000)).unwrap();
        assert_eq!(packet.message_type(), SystemMessage::ClientDisconnect as u8);
        assert!(packet.payload().is_empty());

        let empty = decode_datagram(&[], addr(9000)).unwrap();
        assert_eq!(empty.message_type(), SystemMessage::ClientDisconnect as u8);
    }

    #[test]
    fn test_decode_valid_and_malformed() {
        let bytes = encode(
            SystemMessage::ClientReady,
            0,
            &ClientReady {
                player_id: 1,
                ready_state: 1,
            },
        )
        .unwrap();
        let packet = decode_datagram(&bytes, addr(9000)).unwrap();
        assert_eq!(packet.message_type(), SystemMessage::ClientReady as u8);
        assert_eq!(packet.payload().len(), ClientReady::SIZE);

        let mut broken = bytes.clone();
        broken[2] = 0x40;
        assert!(decode_datagram(&broken, addr(9000)).is_none());
    }

    #[test]
    fn test_ingest_creates_then_reuses() {
        let (mut transport, _) = transport();
        let packet = PendingPacket::new(addr(9000), SystemMessage::Ping as u8, &[0; 4]);
        assert_eq!(transport.ingest(&packet), IngestOutcome::Created);
        assert_eq!(transport.ingest(&packet), IngestOutcome::Existing);
        assert_eq!(transport.sessions().len(), 1);
    }

    #[test]
    fn test_ingest_respects_accepting_flag_and_disconnects() {
        let (mut transport, _) = transport();
        let notice = PendingPacket::new(addr(9000), SystemMessage::ClientDisconnect as u8, &[]);
        assert_eq!(transport.ingest(&notice), IngestOutcome::Unknown);

        transport.set_accepting_new_sessions(false);
        let connect = PendingPacket::new(addr(9001), SystemMessage::ClientConnect as u8, &[]);
        assert_eq!(transport.ingest(&connect), IngestOutcome::Unknown);
        assert!(transport.sessions().is_empty());
    }

    #[test]
    fn test_broadcast_except_skips_excluded_and_disconnected() {
        let (mut transport, sink) = transport();
        for port in [9000, 9001, 9002] {
            transport.ingest(&PendingPacket::new(addr(port), SystemMessage::Ping as u8, &[]));
        }
        let excluded = SessionId::from_addr(addr(9000));
        transport
            .sessions_mut()
            .mark_disconnected(&SessionId::from_addr(addr(9002)));

        transport.broadcast_struct_except(
            &excluded,
            GameMessage::PlayerLeave,
            0,
            &PlayerLeave { token: 4 },
        );

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(9001));
        let parser = PacketParser::new(&sent[0].1);
        assert_eq!(parser.get_struct::<PlayerLeave>().unwrap().token, 4);
    }

    #[test]
    fn test_send_to_unknown_client_is_dropped() {
        let (transport, sink) = transport();
        assert!(!transport.send_to_client(&SessionId::from_addr(addr(1)), &[1, 2, 3, 4]));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_disconnect_client_removes_session() {
        let (mut transport, _) = transport();
        let packet = PendingPacket::new(addr(9000), SystemMessage::Ping as u8, &[]);
        transport.ingest(&packet);
        assert!(transport.disconnect_client(&packet.session_id));
        assert!(!transport.disconnect_client(&packet.session_id));
        assert!(transport.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_udp_server_routes_datagrams() {
        let queue = Arc::new(MessageQueue::new());
        let (server, sink) = UdpServer::start("127.0.0.1:0", InboundRoute::Queue(Arc::clone(&queue)))
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = encode(
            SystemMessage::ClientReady,
            0,
            &ClientReady {
                player_id: 2,
                ready_state: 1,
            },
        )
        .unwrap();
        client.send_to(&bytes, server.local_addr()).await.unwrap();
        client.send_to(&[], server.local_addr()).await.unwrap();

        let mut drained = Vec::new();
        for _ in 0..100 {
            drained.extend(queue.drain());
            if drained.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message_type(), SystemMessage::ClientReady as u8);
        assert_eq!(drained[1].message_type(), SystemMessage::ClientDisconnect as u8);
        assert_eq!(drained[0].addr, client.local_addr().unwrap());

        // outbound path
        sink.send_to(client.local_addr().unwrap(), &bytes);
        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, server.local_addr());
        assert_eq!(&buf[..len], &bytes[..]);

        drop(sink);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let result = UdpServer::start(&addr, InboundRoute::Queue(Arc::new(MessageQueue::new()))).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }
}
