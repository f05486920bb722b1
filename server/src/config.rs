//! Server configuration assembled from command-line flags

use shared::{DEFAULT_PORT, MAX_PLAYERS, PLAYER_SPEED};
use std::time::Duration;

/// Parameters of the lobby spawn-position search.
#[derive(Debug, Clone)]
pub struct SpawnGridConfig {
    pub origin_x: f32,
    pub origin_y: f32,
    pub spacing: f32,
    pub columns: u32,
    pub min_distance: f32,
    pub max_attempts: u32,
}

impl Default for SpawnGridConfig {
    fn default() -> Self {
        Self {
            origin_x: 100.0,
            origin_y: 100.0,
            spacing: 100.0,
            columns: 8,
            min_distance: 64.0,
            max_attempts: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,
    pub tick_rate: u32,
    /// Sessions idle for longer than this are swept.
    pub session_timeout: Duration,
    pub cleanup_interval: Duration,
    pub max_players: usize,
    pub player_speed: f32,
    pub spawn: SpawnGridConfig,
    /// Vertical distance between in-game spawn slots.
    pub slot_spacing: f32,
    /// Set on secondary servers launched by a front-end.
    pub instance_mode: bool,
    pub instance_idle_timeout: Duration,
    pub instance_port_base: u16,
    pub max_instances: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            tick_rate: 60,
            session_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(30),
            max_players: MAX_PLAYERS,
            player_speed: PLAYER_SPEED,
            spawn: SpawnGridConfig::default(),
            slot_spacing: 100.0,
            instance_mode: false,
            instance_idle_timeout: Duration::from_secs(60),
            instance_port_base: DEFAULT_PORT + 1,
            max_instances: shared::protocol::MAX_LIST_INSTANCES,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}
