//! Client copy of the world, kept in line with the server
//!
//! Every inbound server message ends up as a call on [`ClientWorld`] on the
//! thread that owns it. Creation handlers reuse before they create: an
//! existing mapping wins, then an unmapped local player entity is adopted
//! (one pre-spawned by an offline preview, for instance), and only then is a
//! new entity spawned.

use log::{debug, info, warn};
use shared::ecs::{
    Component, ComponentFactory, ComponentKind, EnemyTag, Entity, Health, PlayerTag, Position,
    Registry, Velocity, PLAYER_COMPONENTS, REMOTE_ENTITY_COMPONENTS,
};
use shared::protocol::{
    decode_name, ClientDisconnect, ClientListUpdate, EntityCreate, EntityDestroy, EntityUpdate,
    InstanceCreated, InstanceInfo, InstanceList, PlayerJoin, PlayerSpawn, PositionUpdate, Pong,
    ScoreUpdate, ENTITY_TYPE_PLAYER,
};
use shared::wire_timestamp;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Lobby,
    InGame,
    Disconnected,
}

/// One line of the lobby roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub token: u32,
    pub ready: bool,
    pub name: String,
}

pub struct ClientWorld {
    pub registry: Registry,
    factory: ComponentFactory,
    token: Option<u32>,
    phase: ClientPhase,
    by_token: HashMap<u32, Entity>,
    by_server_entity: HashMap<u32, Entity>,
    pending_creates: Vec<EntityCreate>,
    roster: Vec<RosterEntry>,
    firing: HashSet<u32>,
    scores: HashMap<u32, u32>,
    instances: Vec<InstanceInfo>,
    last_instance_created: Option<InstanceCreated>,
    seed: Option<u32>,
    rtt_ms: Option<u32>,
    disconnect_reason: Option<u8>,
}

impl Default for ClientWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientWorld {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            factory: ComponentFactory::default(),
            token: None,
            phase: ClientPhase::Lobby,
            by_token: HashMap::new(),
            by_server_entity: HashMap::new(),
            pending_creates: Vec::new(),
            roster: Vec::new(),
            firing: HashSet::new(),
            scores: HashMap::new(),
            instances: Vec::new(),
            last_instance_created: None,
            seed: None,
            rtt_ms: None,
            disconnect_reason: None,
        }
    }

    pub fn token(&self) -> Option<u32> {
        self.token
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn entity_for_token(&self, token: u32) -> Option<Entity> {
        self.by_token.get(&token).copied()
    }

    pub fn entity_for_server_entity(&self, server_entity: u32) -> Option<Entity> {
        self.by_server_entity.get(&server_entity).copied()
    }

    /// The entity this client controls, once the server spawned it.
    pub fn local_player(&self) -> Option<Entity> {
        self.token.and_then(|t| self.entity_for_token(t))
    }

    pub fn pending_creates(&self) -> usize {
        self.pending_creates.len()
    }

    pub fn is_firing(&self, token: u32) -> bool {
        self.firing.contains(&token)
    }

    pub fn score(&self, token: u32) -> u32 {
        self.scores.get(&token).copied().unwrap_or(0)
    }

    pub fn instances(&self) -> &[InstanceInfo] {
        &self.instances
    }

    pub fn last_instance_created(&self) -> Option<InstanceCreated> {
        self.last_instance_created
    }

    pub fn seed(&self) -> Option<u32> {
        self.seed
    }

    pub fn rtt_ms(&self) -> Option<u32> {
        self.rtt_ms
    }

    pub fn disconnect_reason(&self) -> Option<u8> {
        self.disconnect_reason
    }

    /// Records the handshake token and replays entity creations that
    /// arrived before it.
    pub fn set_token(&mut self, token: u32) {
        if self.token == Some(token) {
            return;
        }
        if let Some(previous) = self.token {
            warn!("Token changed from {} to {}", previous, token);
        }
        self.token = Some(token);

        let pending = std::mem::take(&mut self.pending_creates);
        if !pending.is_empty() {
            debug!("Replaying {} queued entity creations", pending.len());
        }
        for create in pending {
            self.on_entity_create(create);
        }
    }

    /// Spawns an unmapped local player, as an offline preview does before a
    /// session exists.
    pub fn spawn_local_preview(&mut self, x: f32, y: f32) -> Entity {
        let entity = self.registry.spawn();
        self.registry
            .attach_named(entity, PLAYER_COMPONENTS, &self.factory);
        self.registry
            .attach(entity, Component::Position(Position { x, y }));
        entity
    }

    fn is_mapped(&self, entity: Entity) -> bool {
        self.by_token.values().any(|&e| e == entity)
            || self.by_server_entity.values().any(|&e| e == entity)
    }

    /// An alive player-tagged entity no mapping points at. With `token`, only
    /// one already tagged with that token qualifies.
    fn adoptable_player(&self, token: Option<u32>) -> Option<Entity> {
        self.registry
            .entities_with(ComponentKind::PlayerTag)
            .into_iter()
            .filter(|&e| !self.is_mapped(e))
            .find(|&e| match token {
                Some(token) => self.registry.player_tag(e).map(|t| t.token) == Some(token),
                None => true,
            })
    }

    fn place(&mut self, entity: Entity, x: f32, y: f32, health: f32) {
        self.registry
            .attach(entity, Component::Position(Position { x, y }));
        match self.registry.health_mut(entity) {
            Some(h) => h.current = health,
            None => {
                self.registry.attach(
                    entity,
                    Component::Health(Health {
                        current: health,
                        max: health.max(self.factory.max_health),
                    }),
                );
            }
        }
    }

    /// Live mapping for `key` in the given table, dropping it if the entity
    /// died underneath.
    fn live_mapping(&mut self, by_token: bool, key: u32) -> Option<Entity> {
        let table = if by_token {
            &mut self.by_token
        } else {
            &mut self.by_server_entity
        };
        match table.get(&key).copied() {
            Some(entity) if self.registry.is_alive(entity) => Some(entity),
            Some(_) => {
                table.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn on_entity_create(&mut self, create: EntityCreate) {
        if self.token.is_none() {
            debug!("Queueing creation of entity {} until handshake completes", create.entity_id);
            self.pending_creates.push(create);
            return;
        }

        let is_player = create.entity_type == ENTITY_TYPE_PLAYER;
        let entity = match self.live_mapping(false, create.entity_id) {
            Some(entity) => entity,
            None => {
                let adopted = if is_player {
                    self.adoptable_player(None)
                } else {
                    None
                };
                let entity = match adopted {
                    Some(entity) => {
                        debug!("Adopting {:?} for server entity {}", entity, create.entity_id);
                        entity
                    }
                    None => {
                        let entity = self.registry.spawn();
                        let components = if is_player {
                            PLAYER_COMPONENTS
                        } else {
                            REMOTE_ENTITY_COMPONENTS
                        };
                        self.registry
                            .attach_named(entity, components, &self.factory);
                        if !is_player {
                            self.registry.attach(
                                entity,
                                Component::EnemyTag(EnemyTag {
                                    kind: create.entity_type,
                                }),
                            );
                        }
                        entity
                    }
                };
                self.by_server_entity.insert(create.entity_id, entity);
                entity
            }
        };
        self.place(entity, create.x, create.y, create.health);
    }

    /// Handles `PLAYER_SPAWN` (`own == true`) and `PLAYER_REMOTE_SPAWN`.
    pub fn on_player_spawn(&mut self, spawn: PlayerSpawn, own: bool) {
        if own && self.token.is_none() {
            self.set_token(spawn.token);
        }

        let entity = match self.live_mapping(true, spawn.token) {
            Some(entity) => entity,
            None => {
                let adopted = if own {
                    self.adoptable_player(None)
                } else {
                    self.adoptable_player(Some(spawn.token))
                };
                match adopted {
                    Some(entity) => {
                        info!("Adopting local {:?} for player {}", entity, spawn.token);
                        entity
                    }
                    None => {
                        let entity = self.registry.spawn();
                        let components = if own {
                            PLAYER_COMPONENTS
                        } else {
                            REMOTE_ENTITY_COMPONENTS
                        };
                        self.registry
                            .attach_named(entity, components, &self.factory);
                        entity
                    }
                }
            }
        };

        self.registry.attach(
            entity,
            Component::PlayerTag(PlayerTag { token: spawn.token }),
        );
        self.place(entity, spawn.x, spawn.y, spawn.health);
        self.by_token.insert(spawn.token, entity);
        self.by_server_entity.insert(spawn.server_entity, entity);
        self.phase = ClientPhase::InGame;
    }

    /// Overwrites the position and velocity of the player the update names.
    /// `entity_id` on the wire is the player token.
    pub fn on_position_update(&mut self, update: PositionUpdate) -> bool {
        let Some(entity) = self.live_mapping(true, update.entity_id) else {
            debug!("Position update for unknown player {}", update.entity_id);
            return false;
        };
        self.registry.attach(
            entity,
            Component::Position(Position {
                x: update.x,
                y: update.y,
            }),
        );
        self.registry.attach(
            entity,
            Component::Velocity(Velocity {
                x: update.vx,
                y: update.vy,
            }),
        );
        true
    }

    pub fn on_entity_update(&mut self, update: EntityUpdate) {
        match self.live_mapping(false, update.entity_id) {
            Some(entity) => self.place(entity, update.x, update.y, update.health),
            None => debug!("Update for unknown entity {}", update.entity_id),
        }
    }

    pub fn on_entity_destroy(&mut self, destroy: EntityDestroy) {
        self.pending_creates
            .retain(|c| c.entity_id != destroy.entity_id);
        if let Some(entity) = self.by_server_entity.remove(&destroy.entity_id) {
            self.by_token.retain(|_, e| *e != entity);
            self.registry.kill(entity);
        }
    }

    pub fn on_player_join(&mut self, join: PlayerJoin) {
        let name = decode_name(&join.name);
        info!("Player {} '{}' joined", join.token, name);
        match self.roster.iter_mut().find(|r| r.token == join.token) {
            Some(entry) => entry.name = name,
            None => {
                self.roster.push(RosterEntry {
                    token: join.token,
                    ready: false,
                    name,
                });
                self.roster.sort_by_key(|r| r.token);
            }
        }
    }

    pub fn on_player_leave(&mut self, token: u32) {
        info!("Player {} left", token);
        self.roster.retain(|r| r.token != token);
        self.firing.remove(&token);
        self.scores.remove(&token);
        if let Some(entity) = self.by_token.remove(&token) {
            self.by_server_entity.retain(|_, e| *e != entity);
            self.registry.kill(entity);
        }
    }

    pub fn on_client_list(&mut self, list: ClientListUpdate) {
        self.roster = list
            .entries()
            .iter()
            .map(|p| RosterEntry {
                token: p.id,
                ready: p.ready_state != 0,
                name: decode_name(&p.name),
            })
            .collect();
    }

    pub fn on_start_game(&mut self) {
        info!("Game started");
        self.phase = ClientPhase::InGame;
    }

    pub fn on_shoot(&mut self, token: u32, firing: bool) {
        if firing {
            self.firing.insert(token);
        } else {
            self.firing.remove(&token);
        }
        if let Some(weapon) = self
            .entity_for_token(token)
            .and_then(|e| self.registry.weapon_mut(e))
        {
            weapon.wants_to_fire = firing;
        }
    }

    pub fn on_score(&mut self, score: ScoreUpdate) {
        self.scores.insert(score.token, score.score);
    }

    pub fn on_seed(&mut self, seed: u32) {
        self.seed = Some(seed);
    }

    pub fn on_instance_list(&mut self, list: InstanceList) {
        self.instances = list.entries().to_vec();
    }

    pub fn on_instance_created(&mut self, created: InstanceCreated) {
        info!("Instance created on port {} (status {})", created.port, created.status);
        self.last_instance_created = Some(created);
    }

    pub fn on_pong(&mut self, pong: Pong) {
        self.rtt_ms = Some(wire_timestamp().wrapping_sub(pong.client_time));
    }

    pub fn on_disconnect(&mut self, notice: ClientDisconnect) {
        warn!("Disconnected by server, reason {}", notice.reason);
        self.phase = ClientPhase::Disconnected;
        self.disconnect_reason = Some(notice.reason);
    }
}
