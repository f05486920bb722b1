//! Pre-game message handling: connect, ready/unready, disconnect
//!
//! Nothing here spawns entities. Players get a token, a provisional spawn
//! position and a place on the roster; the handler reports when every
//! connected player is ready so the caller can start the game.

use crate::context::ServerContext;
use crate::queue::PendingPacket;
use crate::session::SessionId;
use crate::spawn::SpawnGrid;
use log::{debug, info, warn};
use shared::codec::read_struct;
use shared::protocol::{
    decode_name, encode_name, ClientConnect, ClientDisconnect, ClientReady, GameMessage,
    PlayerJoin, ServerAccept, StartGame, SystemMessage, DISCONNECT_REASON_GAME_STARTED,
    DISCONNECT_REASON_SERVER_FULL, FLAG_RELIABLE,
};
use shared::{wire_timestamp, PROTOCOL_VERSION};
use std::net::SocketAddr;

pub struct LobbyHandler {
    spawn_grid: SpawnGrid,
    start_broadcast_sent: bool,
    multi_instance: bool,
}

impl LobbyHandler {
    pub fn new(spawn_grid: SpawnGrid, multi_instance: bool) -> Self {
        Self {
            spawn_grid,
            start_broadcast_sent: false,
            multi_instance,
        }
    }

    pub fn start_broadcast_sent(&self) -> bool {
        self.start_broadcast_sent
    }

    /// Readies the handler for another round after a finished game.
    pub fn reset(&mut self) {
        self.start_broadcast_sent = false;
        self.spawn_grid.clear();
    }

    /// Tells an endpoint its connect was refused.
    pub fn reject_connect(&self, ctx: &ServerContext, addr: SocketAddr, reason: u8) {
        let notice = ClientDisconnect {
            player_id: 0,
            reason,
        };
        match shared::codec::encode(SystemMessage::ClientDisconnect, FLAG_RELIABLE, &notice) {
            Ok(bytes) => ctx.transport.send_raw(addr, &bytes),
            Err(e) => warn!("Failed to encode rejection for {}: {}", addr, e),
        }
    }

    pub fn handle_client_connect(&mut self, ctx: &mut ServerContext, packet: &PendingPacket) {
        let id = &packet.session_id;

        // Retried connect from the handshake resend loop
        if let Some(token) = ctx.players.token_of(id) {
            debug!("Duplicate connect from {}, re-sending token {}", id, token);
            self.send_accept(ctx, id, token);
            return;
        }

        if ctx.game_started() || ctx.transport.sessions().should_run_game_logic() {
            info!("Rejecting connect from {}: game already started", id);
            self.reject_connect(ctx, packet.addr, DISCONNECT_REASON_GAME_STARTED);
            ctx.transport.disconnect_client(id);
            return;
        }

        if ctx.transport.sessions().authenticated_count() >= ctx.config.max_players {
            info!("Rejecting connect from {}: server full", id);
            self.reject_connect(ctx, packet.addr, DISCONNECT_REASON_SERVER_FULL);
            ctx.transport.disconnect_client(id);
            return;
        }

        let request = read_struct::<ClientConnect>(packet.payload()).ok();
        if let Some(request) = &request {
            if request.version != PROTOCOL_VERSION {
                warn!(
                    "Client {} uses protocol version {} (server {})",
                    id, request.version, PROTOCOL_VERSION
                );
            }
        }

        let token = ctx.players.allocate_token(id);
        let name = request
            .map(|r| decode_name(&r.name))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Player{}", token));

        let authenticated = ctx
            .transport
            .sessions_mut()
            .get_mut(id)
            .map(|session| session.authenticate(token, &name))
            .unwrap_or(false);
        if !authenticated {
            warn!("Connect from {} without a live session", id);
            ctx.players.remove(id);
            return;
        }

        let (x, y) = self.spawn_grid.choose(id);
        info!(
            "Player {} '{}' connected from {}, spawn ({}, {})",
            token, name, id, x, y
        );
        self.send_accept(ctx, id, token);

        ctx.transport.broadcast_struct_except(
            id,
            GameMessage::PlayerJoin,
            0,
            &PlayerJoin {
                token,
                name: encode_name(&name),
            },
        );
        self.broadcast_player_list(ctx);
    }

    fn send_accept(&mut self, ctx: &ServerContext, id: &SessionId, token: u32) {
        let (spawn_x, spawn_y) = self.spawn_grid.choose(id);
        let serial = ctx
            .transport
            .sessions()
            .get(id)
            .map(|s| s.serial)
            .unwrap_or(0);
        ctx.transport.send_struct(
            id,
            SystemMessage::ServerAccept,
            FLAG_RELIABLE,
            &ServerAccept {
                player_id: token,
                session_id: serial,
                spawn_x,
                spawn_y,
                multi_instance: self.multi_instance as u8,
            },
        );
    }

    /// Routes `CLIENT_READY`; a zero `ready_state` means unready. Returns true
    /// when this message made everyone ready and the start-of-game broadcast
    /// went out.
    pub fn handle_ready_message(&mut self, ctx: &mut ServerContext, packet: &PendingPacket) -> bool {
        match read_struct::<ClientReady>(packet.payload()) {
            Ok(ready) if ready.ready_state == 0 => {
                self.handle_client_unready(ctx, &packet.session_id);
                false
            }
            Ok(_) => self.handle_client_ready(ctx, &packet.session_id),
            Err(e) => {
                warn!("Bad ready packet from {}: {}", packet.session_id, e);
                false
            }
        }
    }

    pub fn handle_client_ready(&mut self, ctx: &mut ServerContext, id: &SessionId) -> bool {
        if !self.set_ready(ctx, id, true) {
            return false;
        }
        self.broadcast_player_list(ctx);

        if self.start_broadcast_sent || !ctx.transport.sessions().should_run_game_logic() {
            return false;
        }

        self.start_broadcast_sent = true;
        let player_count = ctx.transport.sessions().authenticated_count() as u8;
        info!("All {} players ready, starting game", player_count);
        ctx.transport.broadcast_struct(
            SystemMessage::StartGame,
            FLAG_RELIABLE,
            &StartGame {
                player_count,
                server_time: wire_timestamp(),
            },
        );
        true
    }

    pub fn handle_client_unready(&mut self, ctx: &mut ServerContext, id: &SessionId) {
        if self.set_ready(ctx, id, false) {
            self.broadcast_player_list(ctx);
        }
    }

    fn set_ready(&self, ctx: &mut ServerContext, id: &SessionId, ready: bool) -> bool {
        match ctx.transport.sessions_mut().get_mut(id) {
            Some(session) => {
                if !session.set_ready(ready) {
                    warn!("Ready toggle from unauthenticated session {}", id);
                    return false;
                }
                info!(
                    "Player {:?} ({}) is {}",
                    session.player_id(),
                    id,
                    if ready { "ready" } else { "not ready" }
                );
                true
            }
            None => {
                debug!("Ready toggle from unknown session {}", id);
                false
            }
        }
    }

    pub fn handle_client_disconnect(&mut self, ctx: &mut ServerContext, packet: &PendingPacket) {
        let payload_token = read_struct::<ClientDisconnect>(packet.payload())
            .ok()
            .map(|d| d.player_id);
        let leaving = ctx.resolve_leaving_session(&packet.session_id, payload_token);

        self.spawn_grid.release(&leaving);
        ctx.release_player(&leaving);
        self.broadcast_player_list(ctx);
    }

    /// Forgets per-session lobby state for a session dropped elsewhere.
    pub fn forget(&mut self, id: &SessionId) {
        self.spawn_grid.release(id);
    }

    pub fn broadcast_player_list(&self, ctx: &ServerContext) {
        let list = ctx.transport.sessions().generate_player_list();
        ctx.transport
            .broadcast_struct(SystemMessage::ClientListUpdate, 0, &list);
    }

    pub fn spawn_position(&self, id: &SessionId) -> Option<(f32, f32)> {
        self.spawn_grid.position_of(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, SpawnGridConfig};
    use crate::transport::RecordingSink;
    use shared::codec::PacketParser;
    use shared::protocol::{ClientListUpdate, PlayerInfo};

    fn setup() -> (ServerContext, LobbyHandler, RecordingSink) {
        let sink = RecordingSink::new();
        let ctx = ServerContext::new(ServerConfig::default(), Box::new(sink.clone()));
        let lobby = LobbyHandler::new(SpawnGrid::new(SpawnGridConfig::default()), false);
        (ctx, lobby, sink)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn connect_packet(port: u16, name: &str) -> PendingPacket {
        let payload = bincode::serialize(&ClientConnect {
            name: encode_name(name),
            version: PROTOCOL_VERSION,
        })
        .unwrap();
        PendingPacket::new(addr(port), SystemMessage::ClientConnect as u8, &payload)
    }

    fn connect(ctx: &mut ServerContext, lobby: &mut LobbyHandler, port: u16, name: &str) -> SessionId {
        let packet = connect_packet(port, name);
        ctx.transport.ingest(&packet);
        lobby.handle_client_connect(ctx, &packet);
        packet.session_id
    }

    fn of_type(sent: &[(SocketAddr, Vec<u8>)], message_type: u8) -> Vec<(SocketAddr, Vec<u8>)> {
        sent.iter()
            .filter(|(_, bytes)| bytes[0] == message_type)
            .cloned()
            .collect()
    }

    #[test]
    fn test_connect_assigns_token_and_spawn() {
        let (mut ctx, mut lobby, sink) = setup();
        let id = connect(&mut ctx, &mut lobby, 9000, "Alice");

        let sent = sink.take();
        let accepts = of_type(&sent, SystemMessage::ServerAccept as u8);
        assert_eq!(accepts.len(), 1);
        let accept: ServerAccept = PacketParser::new(&accepts[0].1).get_struct().unwrap();
        assert_eq!(accept.player_id, 1);
        assert_eq!((accept.spawn_x, accept.spawn_y), (100.0, 100.0));

        let session = ctx.transport.sessions().get(&id).unwrap();
        assert!(session.is_authenticated());
        assert_eq!(session.name(), "Alice");
        assert_eq!(of_type(&sent, SystemMessage::ClientListUpdate as u8).len(), 1);
        assert!(ctx.registry.is_empty());
    }

    #[test]
    fn test_duplicate_connect_is_idempotent() {
        let (mut ctx, mut lobby, sink) = setup();
        connect(&mut ctx, &mut lobby, 9000, "Alice");
        connect(&mut ctx, &mut lobby, 9000, "Alice");

        let accepts = of_type(&sink.take(), SystemMessage::ServerAccept as u8);
        assert_eq!(accepts.len(), 2);
        for (_, bytes) in accepts {
            let accept: ServerAccept = PacketParser::new(&bytes).get_struct().unwrap();
            assert_eq!(accept.player_id, 1);
            assert_eq!((accept.spawn_x, accept.spawn_y), (100.0, 100.0));
        }
        assert_eq!(ctx.transport.sessions().len(), 1);
        assert_eq!(ctx.players.len(), 1);
    }

    #[test]
    fn test_connect_without_payload_gets_default_name() {
        let (mut ctx, mut lobby, _) = setup();
        let packet = PendingPacket::new(addr(9000), SystemMessage::ClientConnect as u8, &[]);
        ctx.transport.ingest(&packet);
        lobby.handle_client_connect(&mut ctx, &packet);
        let session = ctx.transport.sessions().get(&packet.session_id).unwrap();
        assert_eq!(session.name(), "Player1");
    }

    #[test]
    fn test_second_player_gets_distinct_spawn_and_join_notice() {
        let (mut ctx, mut lobby, sink) = setup();
        connect(&mut ctx, &mut lobby, 9000, "Alice");
        sink.take();
        let bob = connect(&mut ctx, &mut lobby, 9001, "Bob");

        let sent = sink.take();
        let joins = of_type(&sent, GameMessage::PlayerJoin as u8);
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].0, addr(9000));
        assert_eq!(lobby.spawn_position(&bob), Some((200.0, 100.0)));
    }

    #[test]
    fn test_all_ready_starts_once() {
        let (mut ctx, mut lobby, sink) = setup();
        let a = connect(&mut ctx, &mut lobby, 9000, "Alice");
        let b = connect(&mut ctx, &mut lobby, 9001, "Bob");
        sink.take();

        assert!(!lobby.handle_client_ready(&mut ctx, &a));
        assert!(lobby.handle_client_ready(&mut ctx, &b));
        assert!(!lobby.handle_client_ready(&mut ctx, &b));

        let sent = sink.take();
        assert_eq!(of_type(&sent, SystemMessage::StartGame as u8).len(), 2);

        let lists = of_type(&sent, SystemMessage::ClientListUpdate as u8);
        let last: ClientListUpdate = PacketParser::new(&lists.last().unwrap().1)
            .get_struct()
            .unwrap();
        let ready: Vec<u8> = last.entries().iter().map(|p: &PlayerInfo| p.ready_state).collect();
        assert_eq!(ready, vec![1, 1]);
    }

    #[test]
    fn test_unready_blocks_start() {
        let (mut ctx, mut lobby, _) = setup();
        let a = connect(&mut ctx, &mut lobby, 9000, "Alice");
        let b = connect(&mut ctx, &mut lobby, 9001, "Bob");

        lobby.handle_client_ready(&mut ctx, &a);
        lobby.handle_client_unready(&mut ctx, &a);
        assert!(!lobby.handle_client_ready(&mut ctx, &b));
        assert!(!lobby.start_broadcast_sent());
        assert!(lobby.handle_client_ready(&mut ctx, &a));
    }

    #[test]
    fn test_ready_from_unauthenticated_session_ignored() {
        let (mut ctx, mut lobby, _) = setup();
        let packet = PendingPacket::new(addr(9000), SystemMessage::Ping as u8, &[]);
        ctx.transport.ingest(&packet);
        assert!(!lobby.handle_client_ready(&mut ctx, &packet.session_id));
    }

    #[test]
    fn test_connect_rejected_once_everyone_ready() {
        let (mut ctx, mut lobby, sink) = setup();
        let a = connect(&mut ctx, &mut lobby, 9000, "Alice");
        lobby.handle_client_ready(&mut ctx, &a);
        sink.take();

        let late = connect(&mut ctx, &mut lobby, 9005, "Late");
        let sent = sink.take();
        let rejections = of_type(&sent, SystemMessage::ClientDisconnect as u8);
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].0, addr(9005));
        let notice: ClientDisconnect = PacketParser::new(&rejections[0].1).get_struct().unwrap();
        assert_eq!(notice.reason, DISCONNECT_REASON_GAME_STARTED);
        assert!(!ctx.transport.sessions().contains(&late));
        assert!(ctx.players.token_of(&late).is_none());
    }

    #[test]
    fn test_server_full() {
        let (mut ctx, mut lobby, sink) = setup();
        ctx.config.max_players = 1;
        connect(&mut ctx, &mut lobby, 9000, "Alice");
        sink.take();
        let second = connect(&mut ctx, &mut lobby, 9001, "Bob");

        let rejections = of_type(&sink.take(), SystemMessage::ClientDisconnect as u8);
        let notice: ClientDisconnect = PacketParser::new(&rejections[0].1).get_struct().unwrap();
        assert_eq!(notice.reason, DISCONNECT_REASON_SERVER_FULL);
        assert!(!ctx.transport.sessions().contains(&second));
    }

    #[test]
    fn test_disconnect_cannot_evict_another_player() {
        let (mut ctx, mut lobby, sink) = setup();
        let alice = connect(&mut ctx, &mut lobby, 9000, "Alice");
        let alice_token = ctx.players.token_of(&alice).unwrap();

        let ping = PendingPacket::new(addr(6666), SystemMessage::Ping as u8, &[0; 8]);
        ctx.transport.ingest(&ping);
        sink.take();

        let payload = bincode::serialize(&ClientDisconnect {
            player_id: alice_token,
            reason: 0,
        })
        .unwrap();
        let spoof = PendingPacket::new(addr(6666), SystemMessage::ClientDisconnect as u8, &payload);
        lobby.handle_client_disconnect(&mut ctx, &spoof);

        assert!(ctx.transport.sessions().contains(&alice));
        assert_eq!(ctx.players.token_of(&alice), Some(alice_token));
        assert!(lobby.spawn_position(&alice).is_some());
        assert!(!ctx.transport.sessions().contains(&spoof.session_id));
        assert!(of_type(&sink.take(), GameMessage::PlayerLeave as u8).is_empty());
    }

    #[test]
    fn test_disconnect_infers_token_and_notifies_others() {
        let (mut ctx, mut lobby, sink) = setup();
        let a = connect(&mut ctx, &mut lobby, 9000, "Alice");
        connect(&mut ctx, &mut lobby, 9001, "Bob");
        sink.take();

        let notice = PendingPacket::new(addr(9000), SystemMessage::ClientDisconnect as u8, &[]);
        lobby.handle_client_disconnect(&mut ctx, &notice);

        let sent = sink.take();
        let leaves = of_type(&sent, GameMessage::PlayerLeave as u8);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].0, addr(9001));
        assert!(!ctx.transport.sessions().contains(&a));
        assert!(ctx.players.token_of(&a).is_none());
        assert_eq!(lobby.spawn_position(&a), None);

        let lists = of_type(&sent, SystemMessage::ClientListUpdate as u8);
        let list: ClientListUpdate = PacketParser::new(&lists[0].1).get_struct().unwrap();
        assert_eq!(list.count, 1);
    }
}
