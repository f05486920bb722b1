//! In-game message handling and the per-tick state broadcast
//!
//! Once the game starts every tokened session gets a player entity. Movement
//! is authoritative: inputs only set velocity, the tick integrates it, and
//! [`GameHandler::broadcast_loop`] pushes every player's state to every
//! client each tick.

use crate::context::ServerContext;
use crate::queue::PendingPacket;
use crate::session::SessionId;
use log::{debug, info, warn};
use shared::codec::read_struct;
use shared::ecs::{
    Component, EnemyTag, Entity, InputRecord, PlayerTag, Position, Velocity, PLAYER_COMPONENTS,
    REMOTE_ENTITY_COMPONENTS,
};
use shared::protocol::{
    velocity_from_flags, ClientDisconnect, EntityCreate, EntityDestroy, GameMessage, GameSeed,
    PlayerInput, PlayerShoot, PlayerSpawn, PlayerUnshoot, PositionUpdate, ScoreUpdate,
    ENTITY_TYPE_ENEMY, FLAG_RELIABLE,
};
use shared::{timestamp_millis, wire_timestamp, PLAYER_SIZE, WORLD_HEIGHT};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct GameHandler {
    scores: HashMap<u32, u32>,
}

impl GameHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.scores.clear();
    }

    /// Start position of the `index`-th player. Slots run down a column and
    /// wrap into the next one before leaving the world.
    pub fn slot_position(ctx: &ServerContext, index: usize) -> (f32, f32) {
        let origin_x = ctx.config.spawn.origin_x;
        let origin_y = ctx.config.spawn.origin_y;
        let spacing = ctx.config.slot_spacing.max(1.0);
        let rows = (((WORLD_HEIGHT - PLAYER_SIZE - origin_y) / spacing).floor() as usize + 1).max(1);
        let column = index / rows;
        let row = index % rows;
        (
            origin_x + column as f32 * spacing,
            origin_y + row as f32 * spacing,
        )
    }

    /// Creates (or repositions) one entity per tokened session and announces
    /// it: reliably to its owner, best-effort to everyone else.
    pub fn spawn_all_players(&mut self, ctx: &mut ServerContext) {
        let players: Vec<(SessionId, u32)> = ctx
            .players
            .players()
            .into_iter()
            .filter(|(id, _)| ctx.transport.sessions().contains(id))
            .collect();

        for (index, (id, token)) in players.iter().enumerate() {
            let (x, y) = Self::slot_position(ctx, index);
            let entity = match ctx.players.entity_of(id) {
                Some(entity) if ctx.registry.is_alive(entity) => {
                    debug!("Player {} already has entity {:?}, repositioning", token, entity);
                    entity
                }
                _ => {
                    let entity = ctx.registry.spawn();
                    let unknown = ctx
                        .registry
                        .attach_named(entity, PLAYER_COMPONENTS, &ctx.factory);
                    if !unknown.is_empty() {
                        warn!("Unknown player components skipped: {:?}", unknown);
                    }
                    ctx.registry
                        .attach(entity, Component::PlayerTag(PlayerTag { token: *token }));
                    ctx.players.bind_entity(id, entity);
                    info!("Spawned entity {:?} for player {}", entity, token);
                    entity
                }
            };

            ctx.registry.attach(entity, Component::Position(Position { x, y }));
            ctx.registry
                .attach(entity, Component::Velocity(Velocity::default()));
            let health = ctx
                .registry
                .health(entity)
                .map(|h| h.current)
                .unwrap_or(ctx.factory.max_health);

            let spawn = PlayerSpawn {
                token: *token,
                server_entity: entity.id(),
                x,
                y,
                health,
            };
            ctx.transport
                .send_struct(id, GameMessage::PlayerSpawn, FLAG_RELIABLE, &spawn);
            ctx.transport
                .broadcast_struct_except(id, GameMessage::PlayerRemoteSpawn, 0, &spawn);
        }
    }

    pub fn handle_player_input(&mut self, ctx: &mut ServerContext, packet: &PendingPacket) {
        let input = match read_struct::<PlayerInput>(packet.payload()) {
            Ok(input) => input,
            Err(e) => {
                warn!("Bad input packet from {}: {}", packet.session_id, e);
                return;
            }
        };
        let Some(entity) = ctx.players.entity_of(&packet.session_id) else {
            debug!("Input from {} without an entity", packet.session_id);
            return;
        };

        let (vx, vy) = velocity_from_flags(input.input_flags, ctx.config.player_speed);
        if let Some(velocity) = ctx.registry.velocity_mut(entity) {
            velocity.x = vx;
            velocity.y = vy;
        }
    }

    /// Toggles fire intent and relays it to the other clients.
    pub fn handle_player_shoot(&mut self, ctx: &mut ServerContext, packet: &PendingPacket, firing: bool) {
        let id = &packet.session_id;
        let Some(token) = ctx.players.token_of(id) else {
            debug!("Shoot toggle from unknown player {}", id);
            return;
        };
        ctx.players.set_firing(id, firing);

        if firing {
            ctx.transport.broadcast_struct_except(
                id,
                GameMessage::PlayerShoot,
                0,
                &PlayerShoot { token },
            );
        } else {
            if let Some(weapon) = ctx
                .players
                .entity_of(id)
                .and_then(|entity| ctx.registry.weapon_mut(entity))
            {
                weapon.wants_to_fire = false;
            }
            ctx.transport.broadcast_struct_except(
                id,
                GameMessage::PlayerUnshoot,
                0,
                &PlayerUnshoot { token },
            );
        }
    }

    /// Queues any other game message on the sender's input buffer for
    /// gameplay systems.
    pub fn handle_game_message(&mut self, ctx: &mut ServerContext, packet: &PendingPacket) {
        let Some(entity) = ctx.players.entity_of(&packet.session_id) else {
            debug!(
                "Game message 0x{:02X} from {} without an entity",
                packet.message_type(),
                packet.session_id
            );
            return;
        };
        if let Some(buffer) = ctx.registry.input_buffer_mut(entity) {
            buffer.push(InputRecord {
                message_type: packet.message_type(),
                payload: packet.payload().to_vec(),
                received_at: timestamp_millis(),
            });
        }
    }

    /// Pushes fire intent into the weapons and broadcasts every player's
    /// position. Returns how many updates went out.
    pub fn broadcast_loop(&mut self, ctx: &mut ServerContext) -> usize {
        let timestamp = wire_timestamp();
        let mut sent = 0;

        for (id, token, entity) in ctx.players.with_entities() {
            if !ctx.registry.is_alive(entity) {
                continue;
            }
            if ctx.players.is_firing(&id) {
                if let Some(weapon) = ctx.registry.weapon_mut(entity) {
                    weapon.wants_to_fire = true;
                }
            }

            let position = ctx.registry.position(entity).copied().unwrap_or_default();
            let velocity = ctx.registry.velocity(entity).copied().unwrap_or_default();
            ctx.transport.broadcast_struct(
                GameMessage::PositionUpdate,
                0,
                &PositionUpdate {
                    entity_id: token,
                    x: position.x,
                    y: position.y,
                    vx: velocity.x,
                    vy: velocity.y,
                    timestamp,
                },
            );
            sent += 1;
        }
        sent
    }

    /// Spawns a server-owned enemy and announces it.
    pub fn spawn_enemy(&mut self, ctx: &mut ServerContext, kind: u8, x: f32, y: f32) -> Entity {
        let entity = ctx.registry.spawn();
        ctx.registry
            .attach_named(entity, REMOTE_ENTITY_COMPONENTS, &ctx.factory);
        ctx.registry.attach(entity, Component::EnemyTag(EnemyTag { kind }));
        ctx.registry.attach(entity, Component::Position(Position { x, y }));
        self.broadcast_enemy_spawn(ctx, entity);
        entity
    }

    pub fn broadcast_enemy_spawn(&self, ctx: &ServerContext, entity: Entity) {
        let position = ctx.registry.position(entity).copied().unwrap_or_default();
        let health = ctx.registry.health(entity).map(|h| h.current).unwrap_or(0.0);
        ctx.transport.broadcast_struct(
            GameMessage::EntityCreate,
            FLAG_RELIABLE,
            &EntityCreate {
                entity_id: entity.id(),
                entity_type: ENTITY_TYPE_ENEMY,
                x: position.x,
                y: position.y,
                health,
            },
        );
    }

    pub fn broadcast_entity_destroy(&self, ctx: &ServerContext, entity: Entity) {
        ctx.transport.broadcast_struct(
            GameMessage::EntityDestroy,
            0,
            &EntityDestroy {
                entity_id: entity.id(),
            },
        );
    }

    /// Kills a server-owned entity and tells every client.
    pub fn destroy_entity(&mut self, ctx: &mut ServerContext, entity: Entity) -> bool {
        if !ctx.registry.kill(entity) {
            return false;
        }
        self.broadcast_entity_destroy(ctx, entity);
        true
    }

    /// Adds to a player's score and broadcasts the new total.
    pub fn award_points(&mut self, ctx: &ServerContext, token: u32, points: u32) -> u32 {
        let score = self.scores.entry(token).or_insert(0);
        *score = score.saturating_add(points);
        let score = *score;
        self.broadcast_score(ctx, token, score);
        score
    }

    pub fn score_of(&self, token: u32) -> u32 {
        self.scores.get(&token).copied().unwrap_or(0)
    }

    pub fn broadcast_score(&self, ctx: &ServerContext, token: u32, score: u32) {
        ctx.transport.broadcast_struct(
            GameMessage::ScoreUpdate,
            0,
            &ScoreUpdate { token, score },
        );
    }

    pub fn broadcast_seed(&self, ctx: &ServerContext, seed: u32) {
        ctx.transport
            .broadcast_struct(GameMessage::GameSeed, FLAG_RELIABLE, &GameSeed { seed });
    }

    pub fn handle_client_disconnect(&mut self, ctx: &mut ServerContext, packet: &PendingPacket) {
        let payload_token = read_struct::<ClientDisconnect>(packet.payload())
            .ok()
            .map(|d| d.player_id);
        let leaving = ctx.resolve_leaving_session(&packet.session_id, payload_token);
        if let Some(token) = ctx.release_player(&leaving) {
            self.scores.remove(&token);
        }
    }
}
