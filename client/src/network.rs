//! Client side of the UDP transport
//!
//! The connect handshake is blocking: it resends `CLIENT_CONNECT` every
//! 250 ms until a `SERVER_ACCEPT` arrives or the timeout runs out. After
//! that a dedicated thread polls the socket and hands every datagram to the
//! registered handler.

use crate::error::ClientError;
use log::{debug, error, info, warn};
use shared::codec::{encode, encode_empty, read_struct, PacketParser};
use shared::protocol::{
    encode_name, ClientConnect, ClientDisconnect, ClientReady, GameMessage, Ping, PlayerInput,
    PlayerShoot, PlayerUnshoot, ServerAccept, SystemMessage, WireStruct, DISCONNECT_REASON_QUIT,
    FLAG_RELIABLE,
};
use shared::wire_timestamp;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Interval between handshake resends.
pub const CONNECT_RESEND_INTERVAL: Duration = Duration::from_millis(250);
/// Pause between empty polls of the non-blocking socket.
const POLL_SLEEP: Duration = Duration::from_millis(2);

/// Called on the receive thread with `(message_type, payload)`.
pub type ReceiveHandler = Arc<dyn Fn(u8, &[u8]) + Send + Sync>;

pub struct UdpClient {
    socket: Option<Arc<UdpSocket>>,
    server_addr: Option<SocketAddr>,
    accept: Option<ServerAccept>,
    handler: Option<ReceiveHandler>,
    running: Arc<AtomicBool>,
    receive_thread: Option<JoinHandle<()>>,
    input_sequence: u32,
}

impl Default for UdpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpClient {
    pub fn new() -> Self {
        Self {
            socket: None,
            server_addr: None,
            accept: None,
            handler: None,
            running: Arc::new(AtomicBool::new(false)),
            receive_thread: None,
            input_sequence: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some() && self.accept.is_some()
    }

    /// Token the server assigned in its accept.
    pub fn token(&self) -> Option<u32> {
        self.accept.map(|a| a.player_id)
    }

    pub fn accept(&self) -> Option<&ServerAccept> {
        self.accept.as_ref()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn is_receiving(&self) -> bool {
        self.receive_thread.is_some()
    }

    /// Performs the handshake, blocking the calling thread for at most
    /// `timeout`. On success the receive loop is (re)started if a handler
    /// was registered.
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        name: &str,
        version: u32,
        timeout: Duration,
    ) -> Result<ServerAccept, ClientError> {
        self.stop_receive_loop(true);

        let target = format!("{}:{}", host, port);
        let server_addr = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ClientError::Resolve(target.clone()))?;
        let bind_addr = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;

        let request = encode(
            SystemMessage::ClientConnect,
            FLAG_RELIABLE,
            &ClientConnect {
                name: encode_name(name),
                version,
            },
        )?;

        info!("Connecting to {} as '{}'", server_addr, name);
        let accept = Self::handshake(&socket, server_addr, &request, timeout)?;
        info!(
            "Accepted by {}: token {}, spawn ({}, {})",
            server_addr, accept.player_id, accept.spawn_x, accept.spawn_y
        );

        self.socket = Some(Arc::new(socket));
        self.server_addr = Some(server_addr);
        self.accept = Some(accept);
        self.input_sequence = 0;

        if let Some(handler) = self.handler.clone() {
            self.spawn_receive_thread(handler);
        }
        Ok(accept)
    }

    fn handshake(
        socket: &UdpSocket,
        server_addr: SocketAddr,
        request: &[u8],
        timeout: Duration,
    ) -> Result<ServerAccept, ClientError> {
        let started = Instant::now();
        let mut last_send: Option<Instant> = None;
        let mut buffer = [0u8; 2048];

        while started.elapsed() < timeout {
            if last_send.map_or(true, |t| t.elapsed() >= CONNECT_RESEND_INTERVAL) {
                if let Err(e) = socket.send_to(request, server_addr) {
                    warn!("Failed to send connect request: {}", e);
                }
                last_send = Some(Instant::now());
            }

            match socket.recv_from(&mut buffer) {
                Ok((len, from)) if from == server_addr => {
                    let parser = PacketParser::new(&buffer[..len]);
                    let message_type = parser.message_type();
                    if message_type == Some(SystemMessage::ServerAccept as u8)
                        && parser.payload().len() == ServerAccept::SIZE
                    {
                        if let Some(accept) = parser.get_struct::<ServerAccept>() {
                            return Ok(accept);
                        }
                    } else if message_type == Some(SystemMessage::ClientDisconnect as u8) {
                        let reason = read_struct::<ClientDisconnect>(parser.payload())
                            .map(|d| d.reason)
                            .unwrap_or(0);
                        warn!("Server refused connection, reason {}", reason);
                        return Err(ClientError::Rejected { reason });
                    } else {
                        debug!("Ignoring {:?} during handshake", message_type);
                    }
                }
                Ok((_, from)) => debug!("Ignoring datagram from {}", from),
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_SLEEP),
                Err(e) => {
                    debug!("Handshake receive error: {}", e);
                    thread::sleep(POLL_SLEEP);
                }
            }
        }

        warn!("No answer from {} within {:?}", server_addr, timeout);
        Err(ClientError::Timeout(timeout))
    }

    /// Registers the handler and starts the receive thread if connected.
    pub fn start_receive_loop(&mut self, handler: ReceiveHandler) {
        self.handler = Some(Arc::clone(&handler));
        if self.socket.is_some() {
            self.stop_receive_loop(false);
            self.spawn_receive_thread(handler);
        }
    }

    fn spawn_receive_thread(&mut self, handler: ReceiveHandler) {
        let (Some(socket), Some(server_addr)) = (self.socket.clone(), self.server_addr) else {
            return;
        };
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("client-receive".to_string())
            .spawn(move || Self::receive_loop(socket, server_addr, running, handler));
        match spawned {
            Ok(handle) => self.receive_thread = Some(handle),
            Err(e) => {
                error!("Failed to start receive thread: {}", e);
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn receive_loop(
        socket: Arc<UdpSocket>,
        server_addr: SocketAddr,
        running: Arc<AtomicBool>,
        handler: ReceiveHandler,
    ) {
        let mut buffer = [0u8; 2048];
        debug!("Receive loop started");

        while running.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buffer) {
                Ok((len, from)) => {
                    if from != server_addr {
                        debug!("Ignoring datagram from {}", from);
                        continue;
                    }
                    let parser = PacketParser::new(&buffer[..len]);
                    let Some(message_type) = parser.message_type() else {
                        if let Some(e) = parser.error() {
                            warn!("Dropping malformed packet: {}", e);
                        }
                        continue;
                    };
                    let payload = parser.payload();
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| handler(message_type, payload)));
                    if outcome.is_err() {
                        error!("Handler panicked on message 0x{:02X}", message_type);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_SLEEP),
                Err(e) => {
                    warn!("Receive error: {}", e);
                    thread::sleep(POLL_SLEEP);
                }
            }
        }
        debug!("Receive loop stopped");
    }

    /// Stops and joins the receive thread. With `close_socket` the
    /// connection is forgotten as well.
    pub fn stop_receive_loop(&mut self, close_socket: bool) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.receive_thread.take() {
            if handle.join().is_err() {
                error!("Receive thread panicked");
            }
        }
        if close_socket {
            self.socket = None;
            self.accept = None;
        }
    }

    pub fn send_raw(&self, data: &[u8]) -> Result<(), ClientError> {
        let (Some(socket), Some(addr)) = (self.socket.as_ref(), self.server_addr) else {
            return Err(ClientError::NotConnected);
        };
        socket.send_to(data, addr)?;
        Ok(())
    }

    pub fn send_struct<T: WireStruct>(
        &self,
        message_type: impl Into<u8>,
        flags: u8,
        value: &T,
    ) -> Result<(), ClientError> {
        let bytes = encode(message_type, flags, value)?;
        self.send_raw(&bytes)
    }

    /// Best-effort goodbye.
    pub fn send_disconnect(&self, token: u32) -> Result<(), ClientError> {
        self.send_struct(
            SystemMessage::ClientDisconnect,
            FLAG_RELIABLE,
            &ClientDisconnect {
                player_id: token,
                reason: DISCONNECT_REASON_QUIT,
            },
        )
    }

    pub fn send_ready(&self, ready: bool) -> Result<(), ClientError> {
        let player_id = self.token().ok_or(ClientError::NotConnected)?;
        self.send_struct(
            SystemMessage::ClientReady,
            FLAG_RELIABLE,
            &ClientReady {
                player_id,
                ready_state: ready as u8,
            },
        )
    }

    /// Sends the current directional flags; returns the sequence number used.
    pub fn send_input(&mut self, input_flags: u8) -> Result<u32, ClientError> {
        let token = self.token().ok_or(ClientError::NotConnected)?;
        self.input_sequence = self.input_sequence.wrapping_add(1);
        let sequence = self.input_sequence;
        self.send_struct(
            GameMessage::PlayerInput,
            0,
            &PlayerInput {
                token,
                input_flags,
                sequence,
            },
        )?;
        Ok(sequence)
    }

    pub fn send_shoot(&self, firing: bool) -> Result<(), ClientError> {
        let token = self.token().ok_or(ClientError::NotConnected)?;
        if firing {
            self.send_struct(GameMessage::PlayerShoot, 0, &PlayerShoot { token })
        } else {
            self.send_struct(GameMessage::PlayerUnshoot, 0, &PlayerUnshoot { token })
        }
    }

    pub fn send_ping(&self) -> Result<(), ClientError> {
        self.send_struct(
            SystemMessage::Ping,
            0,
            &Ping {
                client_time: wire_timestamp(),
            },
        )
    }

    pub fn request_instance(&self) -> Result<(), ClientError> {
        self.send_raw(&encode_empty(SystemMessage::CreateInstance, FLAG_RELIABLE))
    }

    pub fn request_instance_list(&self) -> Result<(), ClientError> {
        self.send_raw(&encode_empty(SystemMessage::RequestInstanceList, 0))
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.stop_receive_loop(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn fake_server() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn accept_bytes(token: u32) -> Vec<u8> {
        encode(
            SystemMessage::ServerAccept,
            FLAG_RELIABLE,
            &ServerAccept {
                player_id: token,
                session_id: 1,
                spawn_x: 100.0,
                spawn_y: 100.0,
                multi_instance: 0,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_connect_times_out_without_server() {
        let (silent, port) = fake_server();
        let mut client = UdpClient::new();
        let started = Instant::now();
        let result = client.connect("127.0.0.1", port, "Alice", 1, Duration::from_millis(600));
        assert!(matches!(result, Err(ClientError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert!(!client.is_connected());

        // resent at least twice while waiting
        let mut buf = [0u8; 64];
        let mut requests = 0;
        silent
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        while silent.recv_from(&mut buf).is_ok() {
            assert_eq!(buf[0], SystemMessage::ClientConnect as u8);
            requests += 1;
        }
        assert!(requests >= 2, "only {} connect requests", requests);
    }

    #[test]
    fn test_connect_accepts_and_starts_receive_loop() {
        let (server, port) = fake_server();
        let responder = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, client_addr) = server.recv_from(&mut buf).unwrap();
            let request: ClientConnect = PacketParser::new(&buf[..40]).get_struct().unwrap();
            assert_eq!(shared::protocol::decode_name(&request.name), "Alice");
            server.send_to(&accept_bytes(7), client_addr).unwrap();
            // drain resends, then push one game packet
            thread::sleep(Duration::from_millis(100));
            let pong = encode(
                SystemMessage::Pong,
                0,
                &shared::protocol::Pong {
                    client_time: 1,
                    server_time: 2,
                },
            )
            .unwrap();
            server.send_to(&pong, client_addr).unwrap();
        });

        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let mut client = UdpClient::new();
        client.start_receive_loop(Arc::new(move |message_type, _payload: &[u8]| {
            sink.lock().unwrap().push(message_type);
        }));
        assert!(!client.is_receiving());

        let accept = client
            .connect("127.0.0.1", port, "Alice", 1, Duration::from_secs(2))
            .unwrap();
        assert_eq!(accept.player_id, 7);
        assert_eq!(client.token(), Some(7));
        assert!(client.is_receiving());

        responder.join().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if received.lock().unwrap().contains(&(SystemMessage::Pong as u8)) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(received.lock().unwrap().contains(&(SystemMessage::Pong as u8)));

        client.stop_receive_loop(true);
        assert!(!client.is_receiving());
        assert!(!client.is_connected());
    }

    #[test]
    fn test_rejection_is_reported() {
        let (server, port) = fake_server();
        let responder = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, client_addr) = server.recv_from(&mut buf).unwrap();
            let notice = encode(
                SystemMessage::ClientDisconnect,
                FLAG_RELIABLE,
                &ClientDisconnect {
                    player_id: 0,
                    reason: shared::protocol::DISCONNECT_REASON_GAME_STARTED,
                },
            )
            .unwrap();
            server.send_to(&notice, client_addr).unwrap();
        });

        let mut client = UdpClient::new();
        let result = client.connect("127.0.0.1", port, "Late", 1, Duration::from_secs(2));
        responder.join().unwrap();
        assert!(matches!(
            result,
            Err(ClientError::Rejected {
                reason: shared::protocol::DISCONNECT_REASON_GAME_STARTED
            })
        ));
    }

    #[test]
    fn test_handler_panic_does_not_stop_loop() {
        let (server, port) = fake_server();
        let responder = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, client_addr) = server.recv_from(&mut buf).unwrap();
            server.send_to(&accept_bytes(1), client_addr).unwrap();
            thread::sleep(Duration::from_millis(100));
            for _ in 0..2 {
                server
                    .send_to(&encode_empty(SystemMessage::StartGame, 0), client_addr)
                    .unwrap();
                thread::sleep(Duration::from_millis(20));
            }
        });

        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let mut client = UdpClient::new();
        client.start_receive_loop(Arc::new(move |message_type, _payload: &[u8]| {
            if message_type != SystemMessage::StartGame as u8 {
                return;
            }
            let mut calls = counter.lock().unwrap_or_else(|e| e.into_inner());
            *calls += 1;
            if *calls == 1 {
                drop(calls);
                panic!("first start packet");
            }
        }));
        client
            .connect("127.0.0.1", port, "Bob", 1, Duration::from_secs(2))
            .unwrap();
        responder.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while *calls.lock().unwrap_or_else(|e| e.into_inner()) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*calls.lock().unwrap_or_else(|e| e.into_inner()), 2);
    }

    #[test]
    fn test_sends_require_connection() {
        let mut client = UdpClient::new();
        assert!(matches!(client.send_ready(true), Err(ClientError::NotConnected)));
        assert!(matches!(client.send_input(1), Err(ClientError::NotConnected)));
        assert!(matches!(client.send_ping(), Err(ClientError::NotConnected)));
    }
}
