//! Per-connection session lifecycle.
//!
//! Every accepted socket gets a [`Session`] which moves through
//!
//! ```text
//! Connecting --Join--> Active --Leave/read error/timeout--> Disconnecting --> Closed
//!      \______________handshake failure______________________^
//! ```
//!
//! The manager only does bookkeeping. Socket I/O lives in the reader and
//! writer tasks spawned by the network layer; closing a session aborts its
//! reader and drops its outbound queue, which ends the writer and releases the
//! socket.

use log::info;
use shared::{PlayerId, MAX_NAME_LEN};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub type SessionId = u64;

/// An encoded frame, shared between every session it is broadcast to.
pub type Frame = Arc<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Disconnecting,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, Disconnecting)
                | (Active, Disconnecting)
                | (Disconnecting, Closed)
        )
    }
}

/// Why a `Join` was refused. The display text is sent to the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinRejection {
    #[error("Server full")]
    ServerFull,
    #[error("Player id {0} is already in use")]
    IdInUse(PlayerId),
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    /// Set once the handshake assigned a player.
    pub player_id: Option<PlayerId>,
    pub name: String,
    pub state: SessionState,
    pub connected_at: Instant,
    /// Last time we received any message on this session
    pub last_seen: Instant,
    outbound: mpsc::Sender<Frame>,
    reader: Option<AbortHandle>,
}

impl Session {
    fn new(id: SessionId, addr: SocketAddr, outbound: mpsc::Sender<Frame>) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            player_id: None,
            name: String::new(),
            state: SessionState::Connecting,
            connected_at: now,
            last_seen: now,
            outbound,
            reader: None,
        }
    }

    /// Applies a state change if the state machine allows it.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Queues a frame without waiting. Fails if the writer is backed up or gone.
    pub fn try_send(&self, frame: Frame) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    fn is_expired(
        &self,
        now: Instant,
        handshake_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> bool {
        match self.state {
            SessionState::Connecting => now.duration_since(self.connected_at) > handshake_timeout,
            SessionState::Active => {
                idle_timeout.is_some_and(|timeout| now.duration_since(self.last_seen) > timeout)
            }
            SessionState::Disconnecting | SessionState::Closed => false,
        }
    }
}

/// Owns every live session, keyed by a connection-scoped id.
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    next_session_id: SessionId,
    next_player_id: PlayerId,
    max_connections: usize,
    max_players: usize,
}

impl SessionManager {
    pub fn new(max_connections: usize, max_players: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            next_player_id: 1,
            max_connections,
            max_players,
        }
    }

    /// Registers a freshly accepted connection in `Connecting`.
    ///
    /// Returns `None` when the connection limit is reached.
    pub fn open(&mut self, addr: SocketAddr, outbound: mpsc::Sender<Frame>) -> Option<SessionId> {
        if self.sessions.len() >= self.max_connections {
            return None;
        }

        let id = self.next_session_id;
        self.next_session_id += 1;
        self.sessions.insert(id, Session::new(id, addr, outbound));
        info!("Session {} opened from {}", id, addr);
        Some(id)
    }

    /// Hands the session its reader task so closing can stop it. If the
    /// session is already gone the task is aborted right away.
    pub fn attach_reader(&mut self, id: SessionId, reader: AbortHandle) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.reader = Some(reader);
                true
            }
            None => {
                reader.abort();
                false
            }
        }
    }

    /// Picks the player id for a joining session.
    ///
    /// A requested id is honoured when nobody holds it; otherwise the next
    /// free id counting up from 1 is used.
    pub fn allocate_player_id(
        &mut self,
        requested: Option<PlayerId>,
    ) -> Result<PlayerId, JoinRejection> {
        if self.player_count() >= self.max_players {
            return Err(JoinRejection::ServerFull);
        }

        if let Some(requested) = requested {
            if self.is_player_id_taken(requested) {
                return Err(JoinRejection::IdInUse(requested));
            }
            return Ok(requested);
        }

        loop {
            let candidate = self.next_player_id;
            self.next_player_id = self.next_player_id.wrapping_add(1).max(1);
            if !self.is_player_id_taken(candidate) {
                return Ok(candidate);
            }
        }
    }

    fn is_player_id_taken(&self, player_id: PlayerId) -> bool {
        self.sessions
            .values()
            .any(|session| session.player_id == Some(player_id))
    }

    /// Completes the handshake: `Connecting -> Active`.
    pub fn activate(&mut self, id: SessionId, player_id: PlayerId, name: String) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };

        if !session.transition(SessionState::Active) {
            return false;
        }

        session.player_id = Some(player_id);
        session.name = name;
        session.last_seen = Instant::now();
        info!(
            "Session {} is now player {} ({})",
            id, player_id, session.name
        );
        true
    }

    pub fn touch(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_seen = Instant::now();
        }
    }

    /// Marks a session as going away. Only the first call returns true.
    pub fn begin_disconnect(&mut self, id: SessionId) -> bool {
        self.sessions
            .get_mut(&id)
            .is_some_and(|session| session.transition(SessionState::Disconnecting))
    }

    /// Removes the session and stops its reader. Returns it exactly once; later
    /// calls for the same id return `None`.
    pub fn close(&mut self, id: SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;

        session.transition(SessionState::Disconnecting);
        session.transition(SessionState::Closed);
        if let Some(reader) = session.reader.take() {
            reader.abort();
        }

        Some(session)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn state_of(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(|session| session.state)
    }

    pub fn find_by_player(&self, player_id: PlayerId) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|session| session.player_id == Some(player_id))
            .map(|session| session.id)
    }

    /// Queues a frame for one session regardless of its handshake state.
    pub fn send_to(&self, id: SessionId, frame: Frame) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|session| session.try_send(frame))
    }

    pub fn active_sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions
            .values_mut()
            .filter(|session| session.is_active())
    }

    /// Sessions that never finished the handshake in time, plus active
    /// sessions silent for longer than the idle timeout (if one is set).
    pub fn expired(
        &self,
        now: Instant,
        handshake_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|session| session.is_expired(now, handshake_timeout, idle_timeout))
            .map(|session| session.id)
            .collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    fn player_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| session.player_id.is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Trims a requested display name, caps its length and falls back to
/// `Player <id>` for blank names.
pub fn normalize_name(raw: &str, player_id: PlayerId) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return format!("Player {}", player_id);
    }
    trimmed.chars().take(MAX_NAME_LEN).collect()
}
