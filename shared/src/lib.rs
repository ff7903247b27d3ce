//! Wire types, world constants and the framing codec shared by server and client.

pub mod codec;

pub use codec::{
    decode, encode, read_message, write_frame, write_message, FrameBuffer, ProtocolError,
    HEADER_LEN, MAX_FRAME_LEN,
};

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const WORLD_WIDTH: f32 = 400.0;
pub const WORLD_HEIGHT: f32 = 300.0;
pub const PLAYER_RADIUS: f32 = 20.0;
/// Distance covered by one input step.
pub const PLAYER_SPEED: f32 = 5.0;
pub const DEFAULT_PORT: u16 = 12345;
pub const MAX_NAME_LEN: usize = 32;

pub type PlayerId = u32;

/// Messages exchanged over a session. The first three are sent by clients,
/// the rest by the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Message {
    Join {
        requested_id: Option<PlayerId>,
        name: String,
    },
    Move {
        player_id: PlayerId,
        x: f32,
        y: f32,
    },
    Leave {
        player_id: PlayerId,
    },

    Assigned {
        player_id: PlayerId,
        x: f32,
        y: f32,
    },
    Rejected {
        reason: String,
    },
    Snapshot(Snapshot),
    PlayerJoined {
        player_id: PlayerId,
        name: String,
    },
    PlayerLeft {
        player_id: PlayerId,
        name: String,
    },
}

impl Message {
    /// Short tag used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "Join",
            Message::Move { .. } => "Move",
            Message::Leave { .. } => "Leave",
            Message::Assigned { .. } => "Assigned",
            Message::Rejected { .. } => "Rejected",
            Message::Snapshot(_) => "Snapshot",
            Message::PlayerJoined { .. } => "PlayerJoined",
            Message::PlayerLeft { .. } => "PlayerLeft",
        }
    }

    /// True for the messages a client is allowed to send.
    pub fn is_client_message(&self) -> bool {
        matches!(
            self,
            Message::Join { .. } | Message::Move { .. } | Message::Leave { .. }
        )
    }

    /// Rejects coordinates that bincode accepts but no sane peer produces.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Message::Move { x, y, .. } | Message::Assigned { x, y, .. } => check_coords(*x, *y),
            Message::Snapshot(snapshot) => snapshot
                .players
                .iter()
                .try_for_each(|player| check_coords(player.x, player.y)),
            _ => Ok(()),
        }
    }
}

fn check_coords(x: f32, y: f32) -> Result<(), ProtocolError> {
    if x.is_finite() && y.is_finite() {
        Ok(())
    } else {
        Err(ProtocolError::MalformedMessage(format!(
            "non-finite coordinates ({}, {})",
            x, y
        )))
    }
}

/// Authoritative state of one player as held by the server registry.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerState {
    pub id: PlayerId,
    pub name: String,
    pub x: f32,
    pub y: f32,
    /// Milliseconds since the UNIX epoch of the last accepted update.
    pub last_update: u64,
}

impl PlayerState {
    pub fn new(id: PlayerId, name: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            id,
            name: name.into(),
            x,
            y,
            last_update: now_millis(),
        }
    }

    pub fn position(&self) -> (f32, f32) {
        (self.x, self.y)
    }
}

/// Copy of every player's state at one broadcast tick, ordered by id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub tick: u32,
    pub timestamp: u64,
    pub players: Vec<PlayerState>,
}

impl Snapshot {
    pub fn player(&self, id: PlayerId) -> Option<&PlayerState> {
        self.players.iter().find(|player| player.id == id)
    }

    pub fn ids(&self) -> Vec<PlayerId> {
        self.players.iter().map(|player| player.id).collect()
    }
}

/// Largest encoded [`PlayerState`]: id, a name of `MAX_NAME_LEN` four-byte
/// chars behind its u64 length, both coordinates and the timestamp.
pub const MAX_PLAYER_STATE_LEN: usize = 4 + (8 + MAX_NAME_LEN * 4) + 4 + 4 + 8;

/// Variant tag, tick, timestamp and list length of an encoded snapshot.
const SNAPSHOT_OVERHEAD_LEN: usize = 4 + 4 + 8 + 8;

/// Most players a snapshot is guaranteed to fit in one frame, whatever their names.
pub const MAX_SNAPSHOT_PLAYERS: usize =
    (MAX_FRAME_LEN - SNAPSHOT_OVERHEAD_LEN) / MAX_PLAYER_STATE_LEN;

/// Keeps a player's centre inside the visible world.
pub fn clamp_to_world(x: f32, y: f32) -> (f32, f32) {
    (
        x.clamp(PLAYER_RADIUS, WORLD_WIDTH - PLAYER_RADIUS),
        y.clamp(PLAYER_RADIUS, WORLD_HEIGHT - PLAYER_RADIUS),
    )
}

/// Where new players appear.
pub fn spawn_position() -> (f32, f32) {
    (WORLD_WIDTH / 2.0, WORLD_HEIGHT / 2.0)
}

/// Current time in milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
