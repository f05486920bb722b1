//! Minimal entity/component store written into by the network layer
//!
//! The networking core only needs to spawn and kill entities, attach a closed
//! set of components, and read or overwrite a handful of them. Storage is one
//! map per component kind, keyed by entity.

use std::collections::{BTreeSet, HashMap, VecDeque};

/// Opaque entity handle. Ids are issued monotonically and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(pub u32);

impl Entity {
    pub fn id(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Velocity {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Animation {
    pub clip: String,
    pub frame: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Collider {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Weapon {
    pub cooldown: f32,
    /// Set by the network layer while the owner holds fire; consumed by
    /// whatever system spawns projectiles.
    pub wants_to_fire: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Health {
    pub current: f32,
    pub max: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerTag {
    pub token: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnemyTag {
    pub kind: u8,
}

/// One raw message queued for gameplay systems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRecord {
    pub message_type: u8,
    pub payload: Vec<u8>,
    /// Server receipt time in milliseconds since the Unix epoch.
    pub received_at: u64,
}

/// Bounded FIFO of raw input records for one entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputBuffer {
    pub records: VecDeque<InputRecord>,
}

impl InputBuffer {
    pub const CAPACITY: usize = 256;

    /// Appends a record, dropping the oldest one when full.
    pub fn push(&mut self, record: InputRecord) {
        if self.records.len() >= Self::CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn drain(&mut self) -> Vec<InputRecord> {
        self.records.drain(..).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Position,
    Velocity,
    Animation,
    Collider,
    Weapon,
    Health,
    PlayerTag,
    EnemyTag,
    InputBuffer,
}

impl ComponentKind {
    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Position => "position",
            ComponentKind::Velocity => "velocity",
            ComponentKind::Animation => "animation",
            ComponentKind::Collider => "collider",
            ComponentKind::Weapon => "weapon",
            ComponentKind::Health => "health",
            ComponentKind::PlayerTag => "player",
            ComponentKind::EnemyTag => "enemy",
            ComponentKind::InputBuffer => "input_buffer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "position" => ComponentKind::Position,
            "velocity" => ComponentKind::Velocity,
            "animation" => ComponentKind::Animation,
            "collider" => ComponentKind::Collider,
            "weapon" => ComponentKind::Weapon,
            "health" => ComponentKind::Health,
            "player" => ComponentKind::PlayerTag,
            "enemy" => ComponentKind::EnemyTag,
            "input_buffer" => ComponentKind::InputBuffer,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    Position(Position),
    Velocity(Velocity),
    Animation(Animation),
    Collider(Collider),
    Weapon(Weapon),
    Health(Health),
    PlayerTag(PlayerTag),
    EnemyTag(EnemyTag),
    InputBuffer(InputBuffer),
}

impl Component {
    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Position(_) => ComponentKind::Position,
            Component::Velocity(_) => ComponentKind::Velocity,
            Component::Animation(_) => ComponentKind::Animation,
            Component::Collider(_) => ComponentKind::Collider,
            Component::Weapon(_) => ComponentKind::Weapon,
            Component::Health(_) => ComponentKind::Health,
            Component::PlayerTag(_) => ComponentKind::PlayerTag,
            Component::EnemyTag(_) => ComponentKind::EnemyTag,
            Component::InputBuffer(_) => ComponentKind::InputBuffer,
        }
    }
}

/// Component sets attached by the network layer.
pub const PLAYER_COMPONENTS: &[&str] = &[
    "position",
    "velocity",
    "animation",
    "collider",
    "weapon",
    "health",
    "player",
    "input_buffer",
];
pub const REMOTE_ENTITY_COMPONENTS: &[&str] = &["position", "velocity", "health"];

/// Builds default-valued components from their names so callers can attach
/// component sets without naming concrete types.
#[derive(Debug, Clone)]
pub struct ComponentFactory {
    pub collider_size: f32,
    pub max_health: f32,
}

impl Default for ComponentFactory {
    fn default() -> Self {
        Self {
            collider_size: crate::PLAYER_SIZE,
            max_health: crate::PLAYER_MAX_HEALTH,
        }
    }
}

impl ComponentFactory {
    pub fn create(&self, name: &str) -> Option<Component> {
        let component = match ComponentKind::from_name(name)? {
            ComponentKind::Position => Component::Position(Position::default()),
            ComponentKind::Velocity => Component::Velocity(Velocity::default()),
            ComponentKind::Animation => Component::Animation(Animation {
                clip: "idle".to_string(),
                frame: 0,
            }),
            ComponentKind::Collider => Component::Collider(Collider {
                width: self.collider_size,
                height: self.collider_size,
            }),
            ComponentKind::Weapon => Component::Weapon(Weapon {
                cooldown: 0.25,
                wants_to_fire: false,
            }),
            ComponentKind::Health => Component::Health(Health {
                current: self.max_health,
                max: self.max_health,
            }),
            ComponentKind::PlayerTag => Component::PlayerTag(PlayerTag::default()),
            ComponentKind::EnemyTag => Component::EnemyTag(EnemyTag::default()),
            ComponentKind::InputBuffer => Component::InputBuffer(InputBuffer::default()),
        };
        Some(component)
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    next_id: u32,
    alive: BTreeSet<Entity>,
    positions: HashMap<Entity, Position>,
    velocities: HashMap<Entity, Velocity>,
    animations: HashMap<Entity, Animation>,
    colliders: HashMap<Entity, Collider>,
    weapons: HashMap<Entity, Weapon>,
    healths: HashMap<Entity, Health>,
    players: HashMap<Entity, PlayerTag>,
    enemies: HashMap<Entity, EnemyTag>,
    input_buffers: HashMap<Entity, InputBuffer>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self) -> Entity {
        self.next_id += 1;
        let entity = Entity(self.next_id);
        self.alive.insert(entity);
        entity
    }

    /// Removes the entity and every component it owns.
    pub fn kill(&mut self, entity: Entity) -> bool {
        if !self.alive.remove(&entity) {
            return false;
        }
        self.positions.remove(&entity);
        self.velocities.remove(&entity);
        self.animations.remove(&entity);
        self.colliders.remove(&entity);
        self.weapons.remove(&entity);
        self.healths.remove(&entity);
        self.players.remove(&entity);
        self.enemies.remove(&entity);
        self.input_buffers.remove(&entity);
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.alive.contains(&entity)
    }

    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.alive.iter().copied()
    }

    /// Attaches or replaces a component. Returns false for dead entities.
    pub fn attach(&mut self, entity: Entity, component: Component) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        match component {
            Component::Position(c) => {
                self.positions.insert(entity, c);
            }
            Component::Velocity(c) => {
                self.velocities.insert(entity, c);
            }
            Component::Animation(c) => {
                self.animations.insert(entity, c);
            }
            Component::Collider(c) => {
                self.colliders.insert(entity, c);
            }
            Component::Weapon(c) => {
                self.weapons.insert(entity, c);
            }
            Component::Health(c) => {
                self.healths.insert(entity, c);
            }
            Component::PlayerTag(c) => {
                self.players.insert(entity, c);
            }
            Component::EnemyTag(c) => {
                self.enemies.insert(entity, c);
            }
            Component::InputBuffer(c) => {
                self.input_buffers.insert(entity, c);
            }
        }
        true
    }

    /// Attaches each named component built by `factory`. Unknown names are
    /// skipped and returned.
    pub fn attach_named<'n>(
        &mut self,
        entity: Entity,
        names: &[&'n str],
        factory: &ComponentFactory,
    ) -> Vec<&'n str> {
        let mut unknown = Vec::new();
        for &name in names {
            match factory.create(name) {
                Some(component) => {
                    self.attach(entity, component);
                }
                None => unknown.push(name),
            }
        }
        unknown
    }

    pub fn has(&self, entity: Entity, kind: ComponentKind) -> bool {
        match kind {
            ComponentKind::Position => self.positions.contains_key(&entity),
            ComponentKind::Velocity => self.velocities.contains_key(&entity),
            ComponentKind::Animation => self.animations.contains_key(&entity),
            ComponentKind::Collider => self.colliders.contains_key(&entity),
            ComponentKind::Weapon => self.weapons.contains_key(&entity),
            ComponentKind::Health => self.healths.contains_key(&entity),
            ComponentKind::PlayerTag => self.players.contains_key(&entity),
            ComponentKind::EnemyTag => self.enemies.contains_key(&entity),
            ComponentKind::InputBuffer => self.input_buffers.contains_key(&entity),
        }
    }

    /// Live entities carrying `kind`, in id order.
    pub fn entities_with(&self, kind: ComponentKind) -> Vec<Entity> {
        self.alive
            .iter()
            .copied()
            .filter(|&e| self.has(e, kind))
            .collect()
    }

    /// First live entity tagged as a player, if any.
    pub fn find_player(&self) -> Option<Entity> {
        self.alive
            .iter()
            .copied()
            .find(|e| self.players.contains_key(e))
    }

    pub fn position(&self, entity: Entity) -> Option<&Position> {
        self.positions.get(&entity)
    }

    pub fn position_mut(&mut self, entity: Entity) -> Option<&mut Position> {
        self.positions.get_mut(&entity)
    }

    pub fn velocity(&self, entity: Entity) -> Option<&Velocity> {
        self.velocities.get(&entity)
    }

    pub fn velocity_mut(&mut self, entity: Entity) -> Option<&mut Velocity> {
        self.velocities.get_mut(&entity)
    }

    pub fn animation(&self, entity: Entity) -> Option<&Animation> {
        self.animations.get(&entity)
    }

    pub fn collider(&self, entity: Entity) -> Option<&Collider> {
        self.colliders.get(&entity)
    }

    pub fn weapon(&self, entity: Entity) -> Option<&Weapon> {
        self.weapons.get(&entity)
    }

    pub fn weapon_mut(&mut self, entity: Entity) -> Option<&mut Weapon> {
        self.weapons.get_mut(&entity)
    }

    pub fn health(&self, entity: Entity) -> Option<&Health> {
        self.healths.get(&entity)
    }

    pub fn health_mut(&mut self, entity: Entity) -> Option<&mut Health> {
        self.healths.get_mut(&entity)
    }

    pub fn player_tag(&self, entity: Entity) -> Option<&PlayerTag> {
        self.players.get(&entity)
    }

    pub fn player_tag_mut(&mut self, entity: Entity) -> Option<&mut PlayerTag> {
        self.players.get_mut(&entity)
    }

    pub fn enemy_tag(&self, entity: Entity) -> Option<&EnemyTag> {
        self.enemies.get(&entity)
    }

    pub fn input_buffer(&self, entity: Entity) -> Option<&InputBuffer> {
        self.input_buffers.get(&entity)
    }

    pub fn input_buffer_mut(&mut self, entity: Entity) -> Option<&mut InputBuffer> {
        self.input_buffers.get_mut(&entity)
    }
}
