//! Session ↔ token ↔ entity associations
//!
//! Tokens are issued on the first successful connect of a session, increase
//! monotonically and are never handed out twice by one server process. An
//! entity is bound to a session only once the game starts.

use crate::session::SessionId;
use shared::ecs::Entity;
use std::collections::{HashMap, HashSet};

/// What [`PlayerDirectory::remove`] tore down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedPlayer {
    pub token: Option<u32>,
    pub entity: Option<Entity>,
}

#[derive(Debug)]
pub struct PlayerDirectory {
    tokens: HashMap<SessionId, u32>,
    sessions_by_token: HashMap<u32, SessionId>,
    entities: HashMap<SessionId, Entity>,
    firing: HashSet<SessionId>,
    next_token: u32,
}

impl Default for PlayerDirectory {
    fn default() -> Self {
        Self {
            tokens: HashMap::new(),
            sessions_by_token: HashMap::new(),
            entities: HashMap::new(),
            firing: HashSet::new(),
            next_token: 1,
        }
    }
}

impl PlayerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session's token, issuing a fresh one on first call.
    pub fn allocate_token(&mut self, id: &SessionId) -> u32 {
        if let Some(&token) = self.tokens.get(id) {
            return token;
        }
        let token = self.next_token;
        self.next_token += 1;
        self.tokens.insert(id.clone(), token);
        self.sessions_by_token.insert(token, id.clone());
        token
    }

    pub fn token_of(&self, id: &SessionId) -> Option<u32> {
        self.tokens.get(id).copied()
    }

    pub fn session_of_token(&self, token: u32) -> Option<&SessionId> {
        self.sessions_by_token.get(&token)
    }

    pub fn entity_of(&self, id: &SessionId) -> Option<Entity> {
        self.entities.get(id).copied()
    }

    pub fn session_of_entity(&self, entity: Entity) -> Option<&SessionId> {
        self.entities
            .iter()
            .find(|(_, &e)| e == entity)
            .map(|(id, _)| id)
    }

    /// Binds `entity` to the session, replacing any previous binding.
    pub fn bind_entity(&mut self, id: &SessionId, entity: Entity) -> Option<Entity> {
        self.entities.insert(id.clone(), entity)
    }

    pub fn unbind_entity(&mut self, id: &SessionId) -> Option<Entity> {
        self.firing.remove(id);
        self.entities.remove(id)
    }

    /// Forgets everything about the session.
    pub fn remove(&mut self, id: &SessionId) -> RemovedPlayer {
        let token = self.tokens.remove(id);
        if let Some(token) = token {
            self.sessions_by_token.remove(&token);
        }
        self.firing.remove(id);
        RemovedPlayer {
            token,
            entity: self.entities.remove(id),
        }
    }

    pub fn set_firing(&mut self, id: &SessionId, firing: bool) {
        if firing {
            self.firing.insert(id.clone());
        } else {
            self.firing.remove(id);
        }
    }

    pub fn is_firing(&self, id: &SessionId) -> bool {
        self.firing.contains(id)
    }

    /// Every tokened session, ordered by token.
    pub fn players(&self) -> Vec<(SessionId, u32)> {
        let mut players: Vec<(SessionId, u32)> = self
            .tokens
            .iter()
            .map(|(id, &token)| (id.clone(), token))
            .collect();
        players.sort_by_key(|(_, token)| *token);
        players
    }

    /// Sessions with a bound entity, ordered by token.
    pub fn with_entities(&self) -> Vec<(SessionId, u32, Entity)> {
        self.players()
            .into_iter()
            .filter_map(|(id, token)| self.entity_of(&id).map(|entity| (id, token, entity)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Drops entity bindings and fire flags, keeping tokens.
    pub fn clear_entities(&mut self) {
        self.entities.clear();
        self.firing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn session(port: u16) -> SessionId {
        SessionId::from_addr(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_tokens_are_monotonic_and_idempotent() {
        let mut directory = PlayerDirectory::new();
        let a = session(1);
        let b = session(2);

        assert_eq!(directory.allocate_token(&a), 1);
        assert_eq!(directory.allocate_token(&a), 1);
        assert_eq!(directory.allocate_token(&b), 2);
        assert_eq!(directory.session_of_token(2), Some(&b));
    }

    #[test]
    fn test_tokens_never_reused_after_removal() {
        let mut directory = PlayerDirectory::new();
        let a = session(1);
        directory.allocate_token(&a);
        directory.remove(&a);
        assert_eq!(directory.allocate_token(&a), 2);
        assert_eq!(directory.session_of_token(1), None);
    }

    #[test]
    fn test_remove_returns_bindings() {
        let mut directory = PlayerDirectory::new();
        let a = session(1);
        directory.allocate_token(&a);
        directory.bind_entity(&a, Entity(7));
        directory.set_firing(&a, true);

        assert_eq!(directory.session_of_entity(Entity(7)), Some(&a));
        let removed = directory.remove(&a);
        assert_eq!(removed.token, Some(1));
        assert_eq!(removed.entity, Some(Entity(7)));
        assert!(!directory.is_firing(&a));
        assert!(directory.session_of_entity(Entity(7)).is_none());
        assert!(directory.is_empty());
    }

    #[test]
    fn test_bind_entity_replaces() {
        let mut directory = PlayerDirectory::new();
        let a = session(1);
        directory.allocate_token(&a);
        assert_eq!(directory.bind_entity(&a, Entity(1)), None);
        assert_eq!(directory.bind_entity(&a, Entity(2)), Some(Entity(1)));
        assert_eq!(directory.entity_of(&a), Some(Entity(2)));
    }

    #[test]
    fn test_players_sorted_by_token() {
        let mut directory = PlayerDirectory::new();
        let sessions: Vec<SessionId> = (0..5).map(|i| session(9000 - i)).collect();
        for id in &sessions {
            directory.allocate_token(id);
        }
        directory.bind_entity(&sessions[3], Entity(40));

        let tokens: Vec<u32> = directory.players().iter().map(|(_, t)| *t).collect();
        assert_eq!(tokens, vec![1, 2, 3, 4, 5]);
        assert_eq!(
            directory.with_entities(),
            vec![(sessions[3].clone(), 4, Entity(40))]
        );
    }
}
