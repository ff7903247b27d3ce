//! Snapshot composition and best-effort fan-out.

use crate::registry::PlayerRegistry;
use crate::session::{Frame, SessionId, SessionManager, SessionState};
use log::{debug, warn};
use shared::{encode, now_millis, Message, ProtocolError, Snapshot};
use std::sync::Arc;

/// Numbers the snapshots sent to clients.
#[derive(Debug, Default)]
pub struct Broadcaster {
    tick: u32,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// Copies the registry into the next snapshot.
    pub fn compose(&mut self, registry: &PlayerRegistry) -> Message {
        self.tick = self.tick.wrapping_add(1);
        Message::Snapshot(Snapshot {
            tick: self.tick,
            timestamp: now_millis(),
            players: registry.snapshot(),
        })
    }

    /// Composes and encodes a snapshot once for all recipients.
    pub fn snapshot_frame(&mut self, registry: &PlayerRegistry) -> Result<Frame, ProtocolError> {
        let message = self.compose(registry);
        Ok(Arc::new(encode(&message)?))
    }
}

/// Queues `frame` on every active session without waiting on any of them.
///
/// A session whose queue is full or closed is moved to `Disconnecting` and
/// returned so the caller can tear it down; the others still get the frame.
pub fn fan_out(sessions: &mut SessionManager, frame: &Frame) -> Vec<SessionId> {
    let mut failed = Vec::new();
    let mut delivered = 0;

    for session in sessions.active_sessions_mut() {
        if session.try_send(Arc::clone(frame)) {
            delivered += 1;
        } else {
            warn!(
                "Session {} ({}) is not keeping up, dropping it",
                session.id, session.addr
            );
            session.transition(SessionState::Disconnecting);
            failed.push(session.id);
        }
    }

    debug!(
        "Fanned out {} bytes to {} sessions ({} failed)",
        frame.len(),
        delivered,
        failed.len()
    );
    failed
}

/// Encodes a one-off message and fans it out.
pub fn broadcast_message(
    sessions: &mut SessionManager,
    message: &Message,
) -> Result<Vec<SessionId>, ProtocolError> {
    let frame = Arc::new(encode(message)?);
    Ok(fan_out(sessions, &frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::decode;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn active_session(
        manager: &mut SessionManager,
        capacity: usize,
    ) -> (SessionId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = manager.open(addr(), tx).unwrap();
        let player_id = manager.allocate_player_id(None).unwrap();
        manager.activate(id, player_id, "p".to_string());
        (id, rx)
    }

    #[test]
    fn test_compose_increments_tick_and_copies_registry() {
        let mut registry = PlayerRegistry::new();
        registry.add(1, "a", (200.0, 150.0)).unwrap();
        registry.add(2, "b", (200.0, 150.0)).unwrap();

        let mut broadcaster = Broadcaster::new();
        let first = broadcaster.compose(&registry);
        let second = broadcaster.compose(&registry);

        match (first, second) {
            (Message::Snapshot(a), Message::Snapshot(b)) => {
                assert_eq!(a.tick, 1);
                assert_eq!(b.tick, 2);
                assert_eq!(a.ids(), vec![1, 2]);
                assert!(b.timestamp >= a.timestamp);
            }
            _ => panic!("compose must produce snapshots"),
        }
        assert_eq!(broadcaster.tick(), 2);
    }

    #[test]
    fn test_snapshot_frame_decodes() {
        let mut registry = PlayerRegistry::new();
        registry.add(7, "g", (30.0, 40.0)).unwrap();

        let mut broadcaster = Broadcaster::new();
        let frame = broadcaster.snapshot_frame(&registry).unwrap();

        match decode(&frame).unwrap() {
            Message::Snapshot(snapshot) => {
                assert_eq!(snapshot.player(7).unwrap().position(), (30.0, 40.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fan_out_reaches_every_active_session() {
        let mut manager = SessionManager::new(8, 8);
        let (_, mut rx1) = active_session(&mut manager, 4);
        let (_, mut rx2) = active_session(&mut manager, 4);

        let frame: Frame = Arc::new(vec![9, 9]);
        let failed = fan_out(&mut manager, &frame);

        assert!(failed.is_empty());
        assert_eq!(rx1.try_recv().unwrap().as_slice(), &[9, 9]);
        assert_eq!(rx2.try_recv().unwrap().as_slice(), &[9, 9]);
    }

    #[test]
    fn test_fan_out_skips_connecting_sessions() {
        let mut manager = SessionManager::new(8, 8);
        let (tx, mut pending_rx) = mpsc::channel(4);
        manager.open(addr(), tx).unwrap();

        let failed = fan_out(&mut manager, &Arc::new(vec![1]));

        assert!(failed.is_empty());
        assert!(pending_rx.try_recv().is_err());
    }

    #[test]
    fn test_fan_out_isolates_stalled_session() {
        let mut manager = SessionManager::new(8, 8);
        let (slow, _slow_rx) = active_session(&mut manager, 1);
        let (_, mut fast_rx) = active_session(&mut manager, 8);
        let (gone, gone_rx) = active_session(&mut manager, 8);
        drop(gone_rx);

        assert!(fan_out(&mut manager, &Arc::new(vec![1])).contains(&gone));

        // The slow session's single slot is still occupied.
        let failed = fan_out(&mut manager, &Arc::new(vec![2]));
        assert_eq!(failed, vec![slow]);
        assert_eq!(manager.state_of(slow), Some(SessionState::Disconnecting));
        assert_eq!(manager.state_of(gone), Some(SessionState::Disconnecting));

        assert_eq!(fast_rx.try_recv().unwrap().as_slice(), &[1]);
        assert_eq!(fast_rx.try_recv().unwrap().as_slice(), &[2]);

        // Disconnecting sessions are no longer broadcast to.
        assert!(fan_out(&mut manager, &Arc::new(vec![3])).is_empty());
        assert_eq!(fast_rx.try_recv().unwrap().as_slice(), &[3]);
    }

    #[test]
    fn test_broadcast_message_encodes_once() {
        let mut manager = SessionManager::new(8, 8);
        let (_, mut rx) = active_session(&mut manager, 4);

        let message = Message::PlayerLeft {
            player_id: 3,
            name: "c".to_string(),
        };
        let failed = broadcast_message(&mut manager, &message).unwrap();

        assert!(failed.is_empty());
        assert_eq!(decode(&rx.try_recv().unwrap()).unwrap(), message);
    }
}
