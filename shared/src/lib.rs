//! Types shared by the arena server and client: wire protocol, packet codec,
//! gameplay constants and the entity store both sides write into.

pub mod codec;
pub mod ecs;
pub mod protocol;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 8080;
pub const MAX_PLAYERS: usize = protocol::MAX_LIST_PLAYERS;

pub const PLAYER_SPEED: f32 = 300.0;
pub const PLAYER_SIZE: f32 = 32.0;
pub const PLAYER_MAX_HEALTH: f32 = 100.0;
pub const WORLD_WIDTH: f32 = 1920.0;
pub const WORLD_HEIGHT: f32 = 1080.0;

/// Milliseconds since the Unix epoch.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Millisecond timestamp truncated to the 32-bit wire field.
pub fn wire_timestamp() -> u32 {
    timestamp_millis() as u32
}

/// Keeps a position inside the playable area.
pub fn clamp_to_world(x: f32, y: f32) -> (f32, f32) {
    (
        x.clamp(0.0, WORLD_WIDTH - PLAYER_SIZE),
        y.clamp(0.0, WORLD_HEIGHT - PLAYER_SIZE),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_to_world() {
        assert_eq!(clamp_to_world(-10.0, -5.0), (0.0, 0.0));
        assert_eq!(
            clamp_to_world(WORLD_WIDTH + 1.0, WORLD_HEIGHT + 1.0),
            (WORLD_WIDTH - PLAYER_SIZE, WORLD_HEIGHT - PLAYER_SIZE)
        );
        assert_eq!(clamp_to_world(100.0, 200.0), (100.0, 200.0));
    }

    #[test]
    fn test_timestamp_generation() {
        let first = timestamp_millis();
        std::thread::sleep(Duration::from_millis(2));
        let second = timestamp_millis();
        assert!(second > first);
    }
}
