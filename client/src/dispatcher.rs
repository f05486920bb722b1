//! Message-type to handler routing for inbound server packets

use crate::world::ClientWorld;
use log::{debug, warn};
use shared::codec::read_struct;
use shared::protocol::{
    ClientDisconnect, ClientListUpdate, EntityCreate, EntityDestroy, EntityUpdate, GameMessage,
    GameSeed, InstanceCreated, InstanceList, PlayerJoin, PlayerLeave, PlayerShoot, PlayerSpawn,
    PlayerUnshoot, PositionUpdate, Pong, ScoreUpdate, SystemMessage, WireStruct,
};
use std::collections::HashMap;

pub type Handler = Box<dyn Fn(&mut ClientWorld, &[u8]) + Send + Sync>;

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<u8, Handler>,
}

/// Wraps a world method taking a decoded payload. Short or malformed
/// payloads are logged and dropped.
fn decoded<T, F>(apply: F) -> Handler
where
    T: WireStruct + 'static,
    F: Fn(&mut ClientWorld, T) + Send + Sync + 'static,
{
    Box::new(move |world: &mut ClientWorld, payload: &[u8]| {
        match read_struct::<T>(payload) {
            Ok(value) => apply(world, value),
            Err(e) => warn!("Dropping malformed payload: {}", e),
        }
    })
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher wired to every server message [`ClientWorld`] reacts to.
    pub fn with_default_handlers() -> Self {
        let mut d = Self::new();
        d.register(
            GameMessage::EntityCreate,
            decoded(|w, m: EntityCreate| w.on_entity_create(m)),
        );
        d.register(
            GameMessage::EntityUpdate,
            decoded(|w, m: EntityUpdate| w.on_entity_update(m)),
        );
        d.register(
            GameMessage::EntityDestroy,
            decoded(|w, m: EntityDestroy| w.on_entity_destroy(m)),
        );
        d.register(
            GameMessage::PlayerSpawn,
            decoded(|w, m: PlayerSpawn| w.on_player_spawn(m, true)),
        );
        d.register(
            GameMessage::PlayerRemoteSpawn,
            decoded(|w, m: PlayerSpawn| w.on_player_spawn(m, false)),
        );
        d.register(
            GameMessage::PlayerJoin,
            decoded(|w, m: PlayerJoin| w.on_player_join(m)),
        );
        d.register(
            GameMessage::PlayerLeave,
            decoded(|w, m: PlayerLeave| w.on_player_leave(m.token)),
        );
        d.register(
            GameMessage::PositionUpdate,
            decoded(|w, m: PositionUpdate| {
                w.on_position_update(m);
            }),
        );
        d.register(
            GameMessage::PlayerShoot,
            decoded(|w, m: PlayerShoot| w.on_shoot(m.token, true)),
        );
        d.register(
            GameMessage::PlayerUnshoot,
            decoded(|w, m: PlayerUnshoot| w.on_shoot(m.token, false)),
        );
        d.register(
            GameMessage::ScoreUpdate,
            decoded(|w, m: ScoreUpdate| w.on_score(m)),
        );
        d.register(
            GameMessage::GameSeed,
            decoded(|w, m: GameSeed| w.on_seed(m.seed)),
        );
        d.register(
            SystemMessage::ClientListUpdate,
            decoded(|w, m: ClientListUpdate| w.on_client_list(m)),
        );
        d.register(
            SystemMessage::StartGame,
            Box::new(|w: &mut ClientWorld, _: &[u8]| w.on_start_game()),
        );
        d.register(
            SystemMessage::ClientDisconnect,
            decoded(|w, m: ClientDisconnect| w.on_disconnect(m)),
        );
        d.register(SystemMessage::Pong, decoded(|w, m: Pong| w.on_pong(m)));
        d.register(
            SystemMessage::InstanceCreated,
            decoded(|w, m: InstanceCreated| w.on_instance_created(m)),
        );
        d.register(
            SystemMessage::InstanceList,
            decoded(|w, m: InstanceList| w.on_instance_list(m)),
        );
        d
    }

    /// Installs `handler` for `message_type`, replacing any previous one.
    pub fn register(&mut self, message_type: impl Into<u8>, handler: Handler) {
        self.handlers.insert(message_type.into(), handler);
    }

    pub fn handles(&self, message_type: u8) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Runs the handler for `message_type`. Returns false when none is
    /// registered.
    pub fn dispatch(&self, world: &mut ClientWorld, message_type: u8, payload: &[u8]) -> bool {
        match self.handlers.get(&message_type) {
            Some(handler) => {
                handler(world, payload);
                true
            }
            None => {
                debug!("No handler for message type 0x{:02X}", message_type);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::ENTITY_TYPE_ENEMY;

    fn payload<T: WireStruct>(value: &T) -> Vec<u8> {
        bincode::serialize(value).unwrap()
    }

    #[test]
    fn test_default_handlers_update_world() {
        let dispatcher = Dispatcher::with_default_handlers();
        let mut world = ClientWorld::new();
        world.set_token(1);

        let spawn = PlayerSpawn {
            token: 1,
            server_entity: 5,
            x: 64.0,
            y: 64.0,
            health: 100.0,
        };
        assert!(dispatcher.dispatch(
            &mut world,
            GameMessage::PlayerSpawn.into(),
            &payload(&spawn)
        ));
        assert!(world.local_player().is_some());

        let create = EntityCreate {
            entity_id: 9,
            entity_type: ENTITY_TYPE_ENEMY,
            x: 1.0,
            y: 2.0,
            health: 10.0,
        };
        dispatcher.dispatch(&mut world, GameMessage::EntityCreate.into(), &payload(&create));
        assert!(world.entity_for_server_entity(9).is_some());

        dispatcher.dispatch(&mut world, SystemMessage::StartGame.into(), &[]);
        assert_eq!(world.phase(), crate::world::ClientPhase::InGame);
    }

    #[test]
    fn test_short_payload_is_dropped() {
        let dispatcher = Dispatcher::with_default_handlers();
        let mut world = ClientWorld::new();
        world.set_token(1);
        assert!(dispatcher.dispatch(&mut world, GameMessage::EntityCreate.into(), &[1, 2]));
        assert!(world.registry.is_empty());
    }

    #[test]
    fn test_unknown_type_and_override() {
        let mut dispatcher = Dispatcher::new();
        let mut world = ClientWorld::new();
        assert!(!dispatcher.dispatch(&mut world, 0x7F, &[]));

        dispatcher.register(0x7F, Box::new(|w: &mut ClientWorld, _: &[u8]| w.on_seed(7)));
        assert!(dispatcher.handles(0x7F));
        assert!(dispatcher.dispatch(&mut world, 0x7F, &[]));
        assert_eq!(world.seed(), Some(7));
    }
}
