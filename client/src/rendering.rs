//! Presentation seam. The client core only ever talks to a [`Renderer`].

use crate::network::ClientEvent;
use log::{debug, info, warn};
use shared::{PlayerId, Snapshot};

pub trait Renderer {
    /// Shows the world as of `snapshot`. `local_id` is the player this client controls.
    fn render(&mut self, local_id: PlayerId, snapshot: &Snapshot);

    fn notify(&mut self, event: &ClientEvent);

    fn connection_lost(&mut self, reason: &str);
}

/// Headless renderer that writes the world to the log.
#[derive(Debug, Default)]
pub struct LogRenderer {
    frames: u64,
    visible: Vec<PlayerId>,
}

impl LogRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Renderer for LogRenderer {
    fn render(&mut self, local_id: PlayerId, snapshot: &Snapshot) {
        self.frames += 1;

        let ids = snapshot.ids();
        if ids != self.visible {
            info!("Players in view: {:?}", ids);
            self.visible = ids;
        }

        for player in &snapshot.players {
            let marker = if player.id == local_id { "*" } else { " " };
            debug!(
                "[tick {}]{} {} ({}) at ({:.1}, {:.1})",
                snapshot.tick, marker, player.id, player.name, player.x, player.y
            );
        }
    }

    fn notify(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::PlayerJoined { player_id, name } => {
                info!("{} joined as player {}", name, player_id)
            }
            ClientEvent::PlayerLeft { player_id, name } => {
                info!("{} (player {}) left", name, player_id)
            }
            ClientEvent::ConnectionLost(reason) => self.connection_lost(reason),
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        warn!("Connection to server lost: {}", reason);
    }
}
