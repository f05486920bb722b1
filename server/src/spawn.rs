//! Lobby spawn-position search
//!
//! Candidates are walked row by row on a grid anchored at the configured
//! origin; the first one farther than `min_distance` from every occupied
//! position wins. After `max_attempts` candidates the origin is used.

use crate::config::SpawnGridConfig;
use crate::session::SessionId;
use log::warn;
use std::collections::HashMap;

#[derive(Debug)]
pub struct SpawnGrid {
    config: SpawnGridConfig,
    occupied: HashMap<SessionId, (f32, f32)>,
}

impl SpawnGrid {
    pub fn new(config: SpawnGridConfig) -> Self {
        Self {
            config,
            occupied: HashMap::new(),
        }
    }

    fn candidate(&self, attempt: u32) -> (f32, f32) {
        let columns = self.config.columns.max(1);
        let col = attempt % columns;
        let row = attempt / columns;
        (
            self.config.origin_x + col as f32 * self.config.spacing,
            self.config.origin_y + row as f32 * self.config.spacing,
        )
    }

    fn is_free(&self, (x, y): (f32, f32)) -> bool {
        let min_sq = self.config.min_distance * self.config.min_distance;
        self.occupied.values().all(|&(ox, oy)| {
            let dx = ox - x;
            let dy = oy - y;
            dx * dx + dy * dy >= min_sq
        })
    }

    /// Picks and records a position for the session. A session that already
    /// holds a position keeps it.
    pub fn choose(&mut self, id: &SessionId) -> (f32, f32) {
        if let Some(&position) = self.occupied.get(id) {
            return position;
        }
        let position = (0..self.config.max_attempts)
            .map(|attempt| self.candidate(attempt))
            .find(|&candidate| self.is_free(candidate))
            .unwrap_or_else(|| {
                warn!("No free spawn slot for {}, using default", id);
                (self.config.origin_x, self.config.origin_y)
            });
        self.occupied.insert(id.clone(), position);
        position
    }

    pub fn position_of(&self, id: &SessionId) -> Option<(f32, f32)> {
        self.occupied.get(id).copied()
    }

    pub fn release(&mut self, id: &SessionId) {
        self.occupied.remove(id);
    }

    pub fn clear(&mut self) {
        self.occupied.clear();
    }
}
