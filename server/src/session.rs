//! Per-endpoint session tracking for the authoritative server
//!
//! This module keeps the server's record of every remote endpoint:
//! - Lifecycle state (connected, authenticated, ready, disconnected)
//! - Player identity (token and display name) once authenticated
//! - Activity timestamps for inactivity sweeps
//!
//! Sessions are keyed by the endpoint's `ip:port` string, wrapped in
//! [`SessionId`] so it cannot be confused with player tokens.

use log::info;
use shared::protocol::{encode_name, ClientListUpdate, PlayerInfo, MAX_LIST_PLAYERS};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Endpoint key of a session (`"ip:port"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observable lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Datagrams received, no successful connect yet.
    Connected,
    /// Connect accepted, not ready.
    Authenticated,
    Ready,
    /// Terminal.
    Disconnected,
}

/// Server-side record of one remote endpoint
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    /// Small numeric handle echoed in `SERVER_ACCEPT`.
    pub serial: u32,
    connected: bool,
    authenticated: bool,
    ready: bool,
    player_id: Option<u32>,
    name: String,
    /// Last time any datagram arrived from this endpoint
    pub last_activity: Instant,
}

impl Session {
    pub fn new(id: SessionId, addr: SocketAddr, serial: u32) -> Self {
        Self {
            id,
            addr,
            serial,
            connected: true,
            authenticated: false,
            ready: false,
            player_id: None,
            name: String::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        if !self.connected {
            SessionState::Disconnected
        } else if !self.authenticated {
            SessionState::Connected
        } else if self.ready {
            SessionState::Ready
        } else {
            SessionState::Authenticated
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn player_id(&self) -> Option<u32> {
        self.player_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Marks the session authenticated. The first player id assigned sticks
    /// for the session's lifetime; later calls only refresh the name.
    pub fn authenticate(&mut self, player_id: u32, name: &str) -> bool {
        if !self.connected {
            return false;
        }
        if self.player_id.is_none() {
            self.player_id = Some(player_id);
        }
        self.authenticated = true;
        self.name = name.to_string();
        true
    }

    /// Toggles readiness. Only authenticated, connected sessions may change it.
    pub fn set_ready(&mut self, ready: bool) -> bool {
        if !self.connected || !self.authenticated {
            return false;
        }
        self.ready = ready;
        true
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
        self.ready = false;
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }
}

/// Authoritative record of who is connected and in what state.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    timeout: Duration,
    next_serial: u32,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout,
            next_serial: 1,
        }
    }

    /// Returns the session for `id`, creating it on first contact. The flag is
    /// true when a new session was created.
    pub fn get_or_create(&mut self, id: &SessionId, addr: SocketAddr) -> (&mut Session, bool) {
        let next_serial = &mut self.next_serial;
        let mut created = false;
        let session = self.sessions.entry(id.clone()).or_insert_with(|| {
            let serial = *next_serial;
            *next_serial += 1;
            created = true;
            info!("New session {} (serial {})", id, serial);
            Session::new(id.clone(), addr, serial)
        });
        (session, created)
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let removed = self.sessions.remove(id);
        if removed.is_some() {
            info!("Session {} removed", id);
        }
        removed
    }

    pub fn mark_disconnected(&mut self, id: &SessionId) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.mark_disconnected();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Endpoints of every connected session.
    pub fn connected_addrs(&self) -> Vec<(SessionId, SocketAddr)> {
        self.sessions
            .values()
            .filter(|s| s.is_connected())
            .map(|s| (s.id.clone(), s.addr))
            .collect()
    }

    pub fn authenticated_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.is_connected() && s.is_authenticated())
            .count()
    }

    /// True when every connected, authenticated session is ready.
    pub fn are_all_clients_ready(&self) -> bool {
        self.sessions
            .values()
            .filter(|s| s.is_connected() && s.is_authenticated())
            .all(|s| s.is_ready())
    }

    /// True when at least one player is connected and all of them are ready.
    pub fn should_run_game_logic(&self) -> bool {
        self.authenticated_count() > 0 && self.are_all_clients_ready()
    }

    /// Removes sessions that are disconnected or idle past the timeout and
    /// returns their ids.
    pub fn cleanup_disconnected_clients(&mut self) -> Vec<SessionId> {
        let timeout = self.timeout;
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| !s.is_connected() || s.is_timed_out(timeout))
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            info!("Sweeping inactive session {}", id);
            self.sessions.remove(id);
        }
        expired
    }

    /// Roster of authenticated players ordered by player id, at most
    /// [`MAX_LIST_PLAYERS`] entries.
    pub fn generate_player_list(&self) -> ClientListUpdate {
        let mut players: Vec<&Session> = self
            .sessions
            .values()
            .filter(|s| s.is_connected() && s.is_authenticated())
            .collect();
        players.sort_by_key(|s| s.player_id().unwrap_or(u32::MAX));

        let mut list = ClientListUpdate::default();
        for (slot, session) in players.iter().take(MAX_LIST_PLAYERS).enumerate() {
            list.players[slot] = PlayerInfo {
                id: session.player_id().unwrap_or(0),
                ready_state: session.is_ready() as u8,
                name: encode_name(session.name()),
            };
            list.count += 1;
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::decode_name;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(300))
    }

    #[test]
    fn test_session_id_from_addr() {
        let id = SessionId::from_addr(test_addr());
        assert_eq!(id.as_str(), "127.0.0.1:8080");
        assert_eq!(id.to_string(), "127.0.0.1:8080");

        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        assert_eq!(SessionId::from_addr(v6).as_str(), "[::1]:9000");
    }

    #[test]
    fn test_session_state_machine() {
        let addr = test_addr();
        let mut session = Session::new(SessionId::from_addr(addr), addr, 1);
        assert_eq!(session.state(), SessionState::Connected);

        // cannot ready before authentication
        assert!(!session.set_ready(true));
        assert_eq!(session.state(), SessionState::Connected);

        assert!(session.authenticate(5, "Alice"));
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(session.set_ready(true));
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.set_ready(false));
        assert_eq!(session.state(), SessionState::Authenticated);

        session.mark_disconnected();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.set_ready(true));
        assert!(!session.authenticate(6, "Bob"));
    }

    #[test]
    fn test_player_id_is_stable() {
        let addr = test_addr();
        let mut session = Session::new(SessionId::from_addr(addr), addr, 1);
        session.authenticate(3, "Alice");
        session.authenticate(9, "Alicia");
        assert_eq!(session.player_id(), Some(3));
        assert_eq!(session.name(), "Alicia");
    }

    #[test]
    fn test_get_or_create_single_session_per_endpoint() {
        let mut registry = registry();
        let id = SessionId::from_addr(test_addr());

        let (_, created) = registry.get_or_create(&id, test_addr());
        assert!(created);
        let (session, created) = registry.get_or_create(&id, test_addr());
        assert!(!created);
        assert_eq!(session.serial, 1);
        assert_eq!(registry.len(), 1);

        let id2 = SessionId::from_addr(test_addr2());
        let (session2, _) = registry.get_or_create(&id2, test_addr2());
        assert_eq!(session2.serial, 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_should_run_game_logic() {
        let mut registry = registry();
        assert!(!registry.should_run_game_logic());
        assert!(registry.are_all_clients_ready());

        let a = SessionId::from_addr(test_addr());
        let b = SessionId::from_addr(test_addr2());
        registry.get_or_create(&a, test_addr()).0.authenticate(1, "A");
        registry.get_or_create(&b, test_addr2()).0.authenticate(2, "B");

        registry.get_mut(&a).unwrap().set_ready(true);
        assert!(!registry.should_run_game_logic());

        registry.get_mut(&b).unwrap().set_ready(true);
        assert!(registry.should_run_game_logic());

        // unauthenticated sessions do not block the start
        let c_addr: SocketAddr = "127.0.0.1:8082".parse().unwrap();
        registry.get_or_create(&SessionId::from_addr(c_addr), c_addr);
        assert!(registry.should_run_game_logic());

        registry.mark_disconnected(&b);
        assert!(registry.should_run_game_logic());
        assert_eq!(registry.authenticated_count(), 1);
    }

    #[test]
    fn test_cleanup_removes_disconnected_and_timed_out() {
        let mut registry = SessionRegistry::new(Duration::from_secs(1));
        let a = SessionId::from_addr(test_addr());
        let b = SessionId::from_addr(test_addr2());
        let c_addr: SocketAddr = "127.0.0.1:8082".parse().unwrap();
        let c = SessionId::from_addr(c_addr);

        registry.get_or_create(&a, test_addr());
        registry.get_or_create(&b, test_addr2());
        registry.get_or_create(&c, c_addr);

        registry.mark_disconnected(&a);
        registry.get_mut(&b).unwrap().last_activity = Instant::now() - Duration::from_secs(2);

        let mut removed = registry.cleanup_disconnected_clients();
        removed.sort();
        assert_eq!(removed, vec![a, b]);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&c));
    }

    #[test]
    fn test_generate_player_list_is_sorted_and_bounded() {
        let mut registry = registry();
        for i in 0..10u16 {
            let addr: SocketAddr = format!("10.0.0.1:{}", 9000 + i).parse().unwrap();
            let id = SessionId::from_addr(addr);
            let session = registry.get_or_create(&id, addr).0;
            session.authenticate(10 - i as u32, &format!("P{}", i));
            if i % 2 == 0 {
                session.set_ready(true);
            }
        }

        let list = registry.generate_player_list();
        assert_eq!(list.count as usize, MAX_LIST_PLAYERS);
        let ids: Vec<u32> = list.entries().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decode_name(&list.players[0].name), "P9");
        assert_eq!(list.players[0].ready_state, 0);
        assert_eq!(list.players[1].ready_state, 1);
    }
}
