//! State shared by the lobby and in-game handlers
//!
//! One [`ServerContext`] is built at start-up and passed by reference into
//! every handler, so handlers can be driven in tests without sockets.

use crate::config::ServerConfig;
use crate::players::PlayerDirectory;
use crate::session::{SessionId, SessionRegistry};
use crate::transport::{PacketSink, Transport};
use log::{info, warn};
use shared::ecs::{ComponentFactory, Registry};
use shared::protocol::{GameMessage, PlayerLeave};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    Lobby,
    InGame,
}

pub struct ServerContext {
    pub config: ServerConfig,
    pub transport: Transport,
    pub players: PlayerDirectory,
    pub registry: Registry,
    pub factory: ComponentFactory,
    pub phase: GamePhase,
}

impl ServerContext {
    pub fn new(config: ServerConfig, sink: Box<dyn PacketSink>) -> Self {
        let sessions = SessionRegistry::new(config.session_timeout);
        Self {
            transport: Transport::new(sessions, sink),
            players: PlayerDirectory::new(),
            registry: Registry::new(),
            factory: ComponentFactory::default(),
            phase: GamePhase::Lobby,
            config,
        }
    }

    pub fn game_started(&self) -> bool {
        self.phase == GamePhase::InGame
    }

    /// Resolves whose disconnect this is. A datagram can only end its own
    /// session; a payload token belonging to another player is ignored.
    pub fn resolve_leaving_session(
        &self,
        sender: &SessionId,
        payload_token: Option<u32>,
    ) -> SessionId {
        let claimed = payload_token
            .filter(|&token| token != 0)
            .and_then(|token| self.players.session_of_token(token));
        if let Some(owner) = claimed {
            if owner != sender {
                warn!(
                    "Session {} sent a disconnect for {}; ignoring the payload token",
                    sender, owner
                );
            }
        }
        sender.clone()
    }

    /// Tears a player down: tells everyone else they left, kills their entity,
    /// forgets their mappings and drops the session. Returns the token the
    /// player held, if any.
    pub fn release_player(&mut self, id: &SessionId) -> Option<u32> {
        let token = self.players.token_of(id);
        if let Some(token) = token {
            self.transport.broadcast_struct_except(
                id,
                GameMessage::PlayerLeave,
                0,
                &PlayerLeave { token },
            );
        }

        let removed = self.players.remove(id);
        if let Some(entity) = removed.entity {
            if self.registry.kill(entity) {
                info!("Removed entity {:?} of session {}", entity, id);
            }
        }
        self.transport.disconnect_client(id);

        if let Some(token) = token {
            info!("Player {} ({}) left", token, id);
        }
        token
    }
}
