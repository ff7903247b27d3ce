//! Authoritative per-player state.
//!
//! The registry itself is a plain map; the server shares it as
//! `Arc<RwLock<PlayerRegistry>>` so every mutation happens under the write lock
//! and snapshots are taken under the read lock. A broadcast can therefore never
//! observe a half-applied update.

use shared::{now_millis, PlayerId, PlayerState};
use std::collections::BTreeMap;
use thiserror::Error;

/// Misuse of the registry. Both variants mean the session layer broke its own
/// bookkeeping, never that a peer misbehaved.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("player {0} is already registered")]
    DuplicateId(PlayerId),
    #[error("player {0} is not registered")]
    UnknownId(PlayerId),
}

#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: BTreeMap<PlayerId, PlayerState>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        id: PlayerId,
        name: &str,
        position: (f32, f32),
    ) -> Result<(), RegistryError> {
        if self.players.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }

        self.players
            .insert(id, PlayerState::new(id, name, position.0, position.1));
        Ok(())
    }

    /// Removes a player; absent ids are ignored.
    pub fn remove(&mut self, id: PlayerId) -> Option<PlayerState> {
        self.players.remove(&id)
    }

    /// Last writer wins: the new position replaces the old one outright.
    pub fn update_position(
        &mut self,
        id: PlayerId,
        position: (f32, f32),
    ) -> Result<(), RegistryError> {
        let player = self
            .players
            .get_mut(&id)
            .ok_or(RegistryError::UnknownId(id))?;

        player.x = position.0;
        player.y = position.1;
        player.last_update = now_millis();
        Ok(())
    }

    /// Copy of every player's state, ordered by id.
    pub fn snapshot(&self) -> Vec<PlayerState> {
        self.players.values().cloned().collect()
    }

    pub fn get(&self, id: PlayerId) -> Option<&PlayerState> {
        self.players.get(&id)
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.players.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<PlayerId> {
        self.players.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
