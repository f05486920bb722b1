//! The simulation side of the server
//!
//! [`ServerEcs`] owns the session table, the entity registry and both message
//! handlers. Everything here runs on one task; the only thing it shares with
//! the network side is the inbound [`MessageQueue`].

use crate::config::ServerConfig;
use crate::context::{GamePhase, ServerContext};
use crate::game::GameHandler;
use crate::instance::InstanceManager;
use crate::lobby::LobbyHandler;
use crate::queue::{MessageQueue, PendingPacket};
use crate::spawn::SpawnGrid;
use crate::transport::{IngestOutcome, PacketSink};
use log::{debug, info, warn};
use shared::clamp_to_world;
use shared::codec::read_struct;
use shared::ecs::ComponentKind;
use shared::protocol::{
    ClientDisconnect, GameMessage, InstanceCreated, MessageKind, Ping, Pong, SystemMessage,
    DISCONNECT_REASON_GAME_STARTED, DISCONNECT_REASON_SHUTDOWN, FLAG_RELIABLE, INSTANCE_STOPPED,
};
use shared::wire_timestamp;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

pub struct ServerEcs {
    ctx: ServerContext,
    lobby: LobbyHandler,
    game: GameHandler,
    instances: InstanceManager,
    queue: Arc<MessageQueue>,
    scratch: Vec<PendingPacket>,
    tick: u64,
    idle_since: Option<Instant>,
}

impl ServerEcs {
    pub fn new(config: ServerConfig, sink: Box<dyn PacketSink>, instances: InstanceManager) -> Self {
        let lobby = LobbyHandler::new(SpawnGrid::new(config.spawn.clone()), instances.is_enabled());
        Self {
            ctx: ServerContext::new(config, sink),
            lobby,
            game: GameHandler::new(),
            instances,
            queue: Arc::new(MessageQueue::new()),
            scratch: Vec::new(),
            tick: 0,
            idle_since: None,
        }
    }

    /// The queue the network receive task feeds.
    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue)
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ServerContext {
        &mut self.ctx
    }

    /// Handler and context together, for gameplay systems that spawn enemies
    /// or award points.
    pub fn gameplay(&mut self) -> (&mut GameHandler, &mut ServerContext) {
        (&mut self.game, &mut self.ctx)
    }

    pub fn lobby(&self) -> &LobbyHandler {
        &self.lobby
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    pub fn phase(&self) -> GamePhase {
        self.ctx.phase
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// One simulation step: handle everything queued since the last tick,
    /// then move players and broadcast their state.
    pub fn tick(&mut self, dt: f32) {
        let mut packets = mem::take(&mut self.scratch);
        self.queue.drain_into(&mut packets);
        for packet in &packets {
            self.process_packet(packet);
        }
        packets.clear();
        self.scratch = packets;

        self.return_to_lobby_if_empty();
        if self.ctx.game_started() {
            self.step_movement(dt);
            let sent = self.game.broadcast_loop(&mut self.ctx);
            if self.tick % 600 == 0 {
                debug!("Tick {}: {} position updates", self.tick, sent);
            }
        }
        self.tick += 1;
    }

    /// Routes one inbound packet to the handler for the current phase.
    pub fn process_packet(&mut self, packet: &PendingPacket) {
        let message_type = packet.message_type();
        let outcome = self.ctx.transport.ingest(packet);

        if outcome == IngestOutcome::Unknown {
            if message_type == SystemMessage::ClientConnect as u8 && self.ctx.game_started() {
                info!("Rejecting connect from {}: game in progress", packet.addr);
                self.lobby
                    .reject_connect(&self.ctx, packet.addr, DISCONNECT_REASON_GAME_STARTED);
            } else {
                debug!(
                    "Ignoring message 0x{:02X} from unknown endpoint {}",
                    message_type, packet.addr
                );
            }
            return;
        }

        match MessageKind::from_byte(message_type) {
            Some(MessageKind::System(message)) => self.handle_system_message(message, packet),
            Some(MessageKind::Game(message)) => self.handle_game_message(message, packet),
            None => warn!(
                "Unknown message type 0x{:02X} from {}",
                message_type, packet.session_id
            ),
        }
    }

    fn handle_system_message(&mut self, message: SystemMessage, packet: &PendingPacket) {
        match message {
            SystemMessage::ClientConnect => self.lobby.handle_client_connect(&mut self.ctx, packet),
            SystemMessage::ClientReady => {
                if self.ctx.game_started() {
                    debug!("Ready toggle from {} after start ignored", packet.session_id);
                } else if self.lobby.handle_ready_message(&mut self.ctx, packet) {
                    self.start_game();
                }
            }
            SystemMessage::ClientDisconnect => {
                if self.ctx.game_started() {
                    self.game.handle_client_disconnect(&mut self.ctx, packet);
                } else {
                    self.lobby.handle_client_disconnect(&mut self.ctx, packet);
                }
            }
            SystemMessage::Ping => self.handle_ping(packet),
            SystemMessage::CreateInstance => self.handle_create_instance(packet),
            SystemMessage::RequestInstanceList => {
                let list = self.instances.list();
                self.ctx.transport.send_struct(
                    &packet.session_id,
                    SystemMessage::InstanceList,
                    0,
                    &list,
                );
            }
            other => warn!(
                "Unexpected {:?} from {}, dropping",
                other, packet.session_id
            ),
        }
    }

    fn handle_game_message(&mut self, message: GameMessage, packet: &PendingPacket) {
        if !self.ctx.game_started() {
            debug!(
                "{:?} from {} before game start ignored",
                message, packet.session_id
            );
            return;
        }
        match message {
            GameMessage::PlayerInput => self.game.handle_player_input(&mut self.ctx, packet),
            GameMessage::PlayerShoot => self.game.handle_player_shoot(&mut self.ctx, packet, true),
            GameMessage::PlayerUnshoot => {
                self.game.handle_player_shoot(&mut self.ctx, packet, false)
            }
            _ => self.game.handle_game_message(&mut self.ctx, packet),
        }
    }

    fn handle_ping(&self, packet: &PendingPacket) {
        let client_time = read_struct::<Ping>(packet.payload())
            .map(|p| p.client_time)
            .unwrap_or(0);
        self.ctx.transport.send_struct(
            &packet.session_id,
            SystemMessage::Pong,
            0,
            &Pong {
                client_time,
                server_time: wire_timestamp(),
            },
        );
    }

    fn handle_create_instance(&mut self, packet: &PendingPacket) {
        match self.instances.create() {
            Ok(instance) => {
                self.ctx.transport.send_struct(
                    &packet.session_id,
                    SystemMessage::InstanceCreated,
                    FLAG_RELIABLE,
                    &InstanceCreated {
                        port: instance.port,
                        status: instance.status,
                    },
                );
                let list = self.instances.list();
                self.ctx
                    .transport
                    .broadcast_struct(SystemMessage::InstanceList, 0, &list);
            }
            Err(e) => {
                warn!("Instance request from {} failed: {}", packet.session_id, e);
                self.ctx.transport.send_struct(
                    &packet.session_id,
                    SystemMessage::InstanceCreated,
                    FLAG_RELIABLE,
                    &InstanceCreated {
                        port: 0,
                        status: INSTANCE_STOPPED,
                    },
                );
            }
        }
    }

    /// Lobby → in-game: stop accepting sessions, spawn everyone, share a seed.
    pub fn start_game(&mut self) {
        info!(
            "Game starting with {} players",
            self.ctx.transport.sessions().authenticated_count()
        );
        self.ctx.phase = GamePhase::InGame;
        self.ctx.transport.set_accepting_new_sessions(false);
        self.game.spawn_all_players(&mut self.ctx);
        self.game.broadcast_seed(&self.ctx, rand::random::<u32>());
    }

    /// In-game → lobby once nobody is left.
    pub fn reset_to_lobby(&mut self) {
        info!("Returning to lobby");
        let entities: Vec<_> = self.ctx.registry.entities().collect();
        for entity in entities {
            self.ctx.registry.kill(entity);
        }
        self.ctx.players.clear_entities();
        self.ctx.phase = GamePhase::Lobby;
        self.ctx.transport.set_accepting_new_sessions(true);
        self.lobby.reset();
        self.game.reset();
    }

    fn return_to_lobby_if_empty(&mut self) {
        if self.ctx.game_started() && self.ctx.transport.sessions().authenticated_count() == 0 {
            self.reset_to_lobby();
        }
    }

    /// Integrates velocity into position for every moving entity, keeping
    /// it inside the world.
    pub fn step_movement(&mut self, dt: f32) {
        for entity in self.ctx.registry.entities_with(ComponentKind::Velocity) {
            let Some(velocity) = self.ctx.registry.velocity(entity).copied() else {
                continue;
            };
            if let Some(position) = self.ctx.registry.position_mut(entity) {
                let (x, y) = clamp_to_world(
                    position.x + velocity.x * dt,
                    position.y + velocity.y * dt,
                );
                position.x = x;
                position.y = y;
            }
        }
    }

    /// Periodic sweep: drops dead sessions (tearing down their players) and
    /// forgets exited instances.
    pub fn cleanup(&mut self) {
        let removed = self.ctx.transport.cleanup_disconnected_clients();
        for id in &removed {
            self.ctx.release_player(id);
            self.lobby.forget(id);
        }
        if !removed.is_empty() && !self.ctx.game_started() {
            self.lobby.broadcast_player_list(&self.ctx);
        }

        let reaped = self.instances.reap();
        if !reaped.is_empty() {
            let list = self.instances.list();
            self.ctx
                .transport
                .broadcast_struct(SystemMessage::InstanceList, 0, &list);
        }
        self.return_to_lobby_if_empty();
    }

    /// True once an instance-mode server has had no sessions for the idle
    /// timeout. Front-end servers never idle out.
    pub fn idle_expired(&mut self, now: Instant) -> bool {
        if !self.ctx.config.instance_mode || !self.ctx.transport.sessions().is_empty() {
            self.idle_since = None;
            return false;
        }
        let since = *self.idle_since.get_or_insert(now);
        now.duration_since(since) >= self.ctx.config.instance_idle_timeout
    }

    /// Tells every session the server is going away and stops child
    /// instances.
    pub fn shutdown(&mut self) {
        let sessions: Vec<_> = self
            .ctx
            .transport
            .sessions()
            .iter()
            .map(|s| (s.id.clone(), s.player_id().unwrap_or(0)))
            .collect();
        for (id, player_id) in sessions {
            self.ctx.transport.send_struct(
                &id,
                SystemMessage::ClientDisconnect,
                FLAG_RELIABLE,
                &ClientDisconnect {
                    player_id,
                    reason: DISCONNECT_REASON_SHUTDOWN,
                },
            );
        }
        self.instances.shutdown_all();
        info!("Server shut down after {} ticks", self.tick);
    }
}
