//! Message types and fixed-layout payload structs exchanged over UDP
//!
//! Every payload struct here is encoded with bincode's default options, which
//! writes fields in declaration order, little-endian, fixed-width, and with no
//! length prefix for fixed arrays. The encoded size of each struct is therefore
//! exactly its packed C layout, recorded in [`WireStruct::SIZE`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Length of the fixed name fields carried in several payloads.
pub const NAME_LEN: usize = 32;
/// Maximum number of roster entries carried by [`ClientListUpdate`].
pub const MAX_LIST_PLAYERS: usize = 8;
/// Maximum number of instance entries carried by [`InstanceList`].
pub const MAX_LIST_INSTANCES: usize = 8;

/// Header flag: sender considers this message important. Informational only,
/// nothing retransmits on its behalf.
pub const FLAG_RELIABLE: u8 = 0x01;

pub const INPUT_UP: u8 = 0x01;
pub const INPUT_DOWN: u8 = 0x02;
pub const INPUT_LEFT: u8 = 0x04;
pub const INPUT_RIGHT: u8 = 0x08;

/// Reasons carried by [`ClientDisconnect`].
pub const DISCONNECT_REASON_QUIT: u8 = 0;
pub const DISCONNECT_REASON_TIMEOUT: u8 = 1;
pub const DISCONNECT_REASON_GAME_STARTED: u8 = 2;
pub const DISCONNECT_REASON_SERVER_FULL: u8 = 3;
pub const DISCONNECT_REASON_SHUTDOWN: u8 = 4;

/// Connection lifecycle, roster and instance discovery messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SystemMessage {
    ClientConnect = 0x01,
    ServerAccept = 0x02,
    ClientDisconnect = 0x03,
    ClientReady = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    ClientListUpdate = 0x07,
    StartGame = 0x08,
    InstanceCreated = 0x09,
    InstanceList = 0x0A,
    CreateInstance = 0x0B,
    RequestInstanceList = 0x0C,
}

/// Entity, player and simulation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GameMessage {
    EntityCreate = 0x20,
    EntityUpdate = 0x21,
    EntityDestroy = 0x22,
    PlayerSpawn = 0x23,
    PlayerRemoteSpawn = 0x24,
    PlayerJoin = 0x25,
    PlayerLeave = 0x26,
    PositionUpdate = 0x27,
    PlayerInput = 0x28,
    PlayerShoot = 0x29,
    PlayerUnshoot = 0x2A,
    ScoreUpdate = 0x2B,
    GameSeed = 0x2C,
}

impl SystemMessage {
    pub fn from_byte(byte: u8) -> Option<Self> {
        use SystemMessage::*;
        Some(match byte {
            0x01 => ClientConnect,
            0x02 => ServerAccept,
            0x03 => ClientDisconnect,
            0x04 => ClientReady,
            0x05 => Ping,
            0x06 => Pong,
            0x07 => ClientListUpdate,
            0x08 => StartGame,
            0x09 => InstanceCreated,
            0x0A => InstanceList,
            0x0B => CreateInstance,
            0x0C => RequestInstanceList,
            _ => return None,
        })
    }
}

impl GameMessage {
    pub fn from_byte(byte: u8) -> Option<Self> {
        use GameMessage::*;
        Some(match byte {
            0x20 => EntityCreate,
            0x21 => EntityUpdate,
            0x22 => EntityDestroy,
            0x23 => PlayerSpawn,
            0x24 => PlayerRemoteSpawn,
            0x25 => PlayerJoin,
            0x26 => PlayerLeave,
            0x27 => PositionUpdate,
            0x28 => PlayerInput,
            0x29 => PlayerShoot,
            0x2A => PlayerUnshoot,
            0x2B => ScoreUpdate,
            0x2C => GameSeed,
            _ => return None,
        })
    }
}

impl From<SystemMessage> for u8 {
    fn from(message: SystemMessage) -> u8 {
        message as u8
    }
}

impl From<GameMessage> for u8 {
    fn from(message: GameMessage) -> u8 {
        message as u8
    }
}

/// A message-type byte resolved into its namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    System(SystemMessage),
    Game(GameMessage),
}

impl MessageKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        SystemMessage::from_byte(byte)
            .map(MessageKind::System)
            .or_else(|| GameMessage::from_byte(byte).map(MessageKind::Game))
    }
}

/// A payload struct whose bincode encoding has a fixed, known size.
pub trait WireStruct: Serialize + DeserializeOwned {
    const SIZE: usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientConnect {
    pub name: [u8; NAME_LEN],
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerAccept {
    pub player_id: u32,
    pub session_id: u32,
    pub spawn_x: f32,
    pub spawn_y: f32,
    /// Non-zero when the server can host additional instances.
    pub multi_instance: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReady {
    pub player_id: u32,
    pub ready_state: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDisconnect {
    pub player_id: u32,
    pub reason: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub client_time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub client_time: u32,
    pub server_time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: u32,
    pub ready_state: u8,
    pub name: [u8; NAME_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientListUpdate {
    pub count: u8,
    pub players: [PlayerInfo; MAX_LIST_PLAYERS],
}

impl ClientListUpdate {
    /// Entries actually in use, clamped to the array length.
    pub fn entries(&self) -> &[PlayerInfo] {
        let count = (self.count as usize).min(MAX_LIST_PLAYERS);
        &self.players[..count]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartGame {
    pub player_count: u8,
    pub server_time: u32,
}

/// Instance status values used in [`InstanceInfo`] and [`InstanceCreated`].
pub const INSTANCE_STARTING: u8 = 0;
pub const INSTANCE_RUNNING: u8 = 1;
pub const INSTANCE_STOPPED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCreated {
    pub port: u16,
    pub status: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub port: u16,
    pub status: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceList {
    pub count: u8,
    pub instances: [InstanceInfo; MAX_LIST_INSTANCES],
}

impl InstanceList {
    pub fn entries(&self) -> &[InstanceInfo] {
        let count = (self.count as usize).min(MAX_LIST_INSTANCES);
        &self.instances[..count]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityCreate {
    pub entity_id: u32,
    pub entity_type: u8,
    pub x: f32,
    pub y: f32,
    pub health: f32,
}

/// Entity type values carried by [`EntityCreate`].
pub const ENTITY_TYPE_PLAYER: u8 = 0;
pub const ENTITY_TYPE_ENEMY: u8 = 1;
pub const ENTITY_TYPE_PROJECTILE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub entity_id: u32,
    pub x: f32,
    pub y: f32,
    pub health: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDestroy {
    pub entity_id: u32,
}

/// Shared by `PLAYER_SPAWN` (owner) and `PLAYER_REMOTE_SPAWN` (everyone else).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerSpawn {
    pub token: u32,
    pub server_entity: u32,
    pub x: f32,
    pub y: f32,
    pub health: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerJoin {
    pub token: u32,
    pub name: [u8; NAME_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLeave {
    pub token: u32,
}

/// `entity_id` carries the player token for player entities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub entity_id: u32,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub timestamp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInput {
    pub token: u32,
    pub input_flags: u8,
    pub sequence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerShoot {
    pub token: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerUnshoot {
    pub token: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub token: u32,
    pub score: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSeed {
    pub seed: u32,
}

impl WireStruct for ClientConnect {
    const SIZE: usize = NAME_LEN + 4;
}
impl WireStruct for ServerAccept {
    const SIZE: usize = 17;
}
impl WireStruct for ClientReady {
    const SIZE: usize = 5;
}
impl WireStruct for ClientDisconnect {
    const SIZE: usize = 5;
}
impl WireStruct for Ping {
    const SIZE: usize = 4;
}
impl WireStruct for Pong {
    const SIZE: usize = 8;
}
impl WireStruct for PlayerInfo {
    const SIZE: usize = 5 + NAME_LEN;
}
impl WireStruct for ClientListUpdate {
    const SIZE: usize = 1 + MAX_LIST_PLAYERS * PlayerInfo::SIZE;
}
impl WireStruct for StartGame {
    const SIZE: usize = 5;
}
impl WireStruct for InstanceCreated {
    const SIZE: usize = 3;
}
impl WireStruct for InstanceInfo {
    const SIZE: usize = 3;
}
impl WireStruct for InstanceList {
    const SIZE: usize = 1 + MAX_LIST_INSTANCES * InstanceInfo::SIZE;
}
impl WireStruct for EntityCreate {
    const SIZE: usize = 17;
}
impl WireStruct for EntityUpdate {
    const SIZE: usize = 16;
}
impl WireStruct for EntityDestroy {
    const SIZE: usize = 4;
}
impl WireStruct for PlayerSpawn {
    const SIZE: usize = 20;
}
impl WireStruct for PlayerJoin {
    const SIZE: usize = 4 + NAME_LEN;
}
impl WireStruct for PlayerLeave {
    const SIZE: usize = 4;
}
impl WireStruct for PositionUpdate {
    const SIZE: usize = 24;
}
impl WireStruct for PlayerInput {
    const SIZE: usize = 9;
}
impl WireStruct for PlayerShoot {
    const SIZE: usize = 4;
}
impl WireStruct for PlayerUnshoot {
    const SIZE: usize = 4;
}
impl WireStruct for ScoreUpdate {
    const SIZE: usize = 8;
}
impl WireStruct for GameSeed {
    const SIZE: usize = 4;
}

/// Packs a display name into a NUL-padded fixed field.
///
/// Names longer than 31 bytes are cut on a character boundary so the field
/// always keeps a terminating NUL.
pub fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut field = [0u8; NAME_LEN];
    let mut end = name.len().min(NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&name.as_bytes()[..end]);
    field
}

/// Reads a NUL-padded name field, replacing invalid UTF-8.
pub fn decode_name(field: &[u8; NAME_LEN]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Turns directional input flags into a velocity of magnitude `speed` per axis.
pub fn velocity_from_flags(flags: u8, speed: f32) -> (f32, f32) {
    let mut vx = 0.0;
    let mut vy = 0.0;
    if flags & INPUT_LEFT != 0 {
        vx -= speed;
    }
    if flags & INPUT_RIGHT != 0 {
        vx += speed;
    }
    if flags & INPUT_UP != 0 {
        vy -= speed;
    }
    if flags & INPUT_DOWN != 0 {
        vy += speed;
    }
    (vx, vy)
}
