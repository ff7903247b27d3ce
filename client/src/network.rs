//! Connection to the server: handshake, background receive task and moves.

use crate::error::ClientError;
use log::{debug, info, warn};
use shared::{clamp_to_world, read_message, write_message, Message, PlayerId, Snapshot};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Things worth showing that are not part of a snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    PlayerJoined { player_id: PlayerId, name: String },
    PlayerLeft { player_id: PlayerId, name: String },
    /// The receive task stopped; no more snapshots will arrive.
    ConnectionLost(String),
}

type Handshake = (BufReader<OwnedReadHalf>, OwnedWriteHalf, PlayerId, (f32, f32));

pub struct NetworkClient {
    player_id: PlayerId,
    position: (f32, f32),
    writer: OwnedWriteHalf,

    snapshots: watch::Receiver<Option<Snapshot>>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    receiver: JoinHandle<()>,
}

impl NetworkClient {
    /// Connects, sends `Join` and waits for the server to assign a player.
    pub async fn connect(
        addr: &str,
        name: &str,
        requested_id: Option<PlayerId>,
    ) -> Result<Self, ClientError> {
        Self::connect_with_timeout(addr, name, requested_id, HANDSHAKE_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        addr: &str,
        name: &str,
        requested_id: Option<PlayerId>,
        handshake_timeout: Duration,
    ) -> Result<Self, ClientError> {
        info!("Connecting to {}...", addr);

        let (reader, writer, player_id, position) =
            timeout(handshake_timeout, handshake(addr, name, requested_id))
                .await
                .map_err(|_| ClientError::HandshakeTimeout)??;

        info!(
            "Joined as player {} at ({}, {})",
            player_id, position.0, position.1
        );

        let (snapshot_tx, snapshots) = watch::channel(None);
        let (event_tx, events) = mpsc::unbounded_channel();
        let receiver = tokio::spawn(receive_loop(reader, snapshot_tx, event_tx));

        Ok(NetworkClient {
            player_id,
            position,
            writer,
            snapshots,
            events,
            receiver,
        })
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// Where this client last put its own player.
    pub fn position(&self) -> (f32, f32) {
        self.position
    }

    /// Latest snapshot not returned before. Older unread snapshots are skipped.
    ///
    /// After the connection drops, the last snapshot received is still handed
    /// out once before `ConnectionLost` is reported.
    pub fn poll_snapshot(&mut self) -> Result<Option<Snapshot>, ClientError> {
        match self.snapshots.has_changed() {
            Ok(true) => Ok((*self.snapshots.borrow_and_update()).clone()),
            Ok(false) => Ok(None),
            Err(_) => {
                let pending = self.snapshots.borrow_and_update();
                if pending.has_changed() {
                    Ok((*pending).clone())
                } else {
                    Err(ClientError::ConnectionLost(
                        "receive task stopped".to_string(),
                    ))
                }
            }
        }
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }

    /// Moves the local player by `(dx, dy)` inside the world bounds and
    /// reports the new position. Returns false when the clamped position did
    /// not change and nothing was sent.
    pub async fn send_move(&mut self, dx: f32, dy: f32) -> Result<bool, ClientError> {
        let (x, y) = clamp_to_world(self.position.0 + dx, self.position.1 + dy);
        if (x, y) == self.position {
            return Ok(false);
        }

        let message = Message::Move {
            player_id: self.player_id,
            x,
            y,
        };
        write_message(&mut self.writer, &message)
            .await
            .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;

        self.position = (x, y);
        Ok(true)
    }

    /// Announces the departure and closes the connection.
    pub async fn leave(mut self) -> Result<(), ClientError> {
        let message = Message::Leave {
            player_id: self.player_id,
        };
        write_message(&mut self.writer, &message)
            .await
            .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;

        if let Err(e) = self.writer.shutdown().await {
            debug!("Shutdown after leave failed: {}", e);
        }
        info!("Left as player {}", self.player_id);
        Ok(())
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn handshake(
    addr: &str,
    name: &str,
    requested_id: Option<PlayerId>,
) -> Result<Handshake, ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle: {}", e);
    }

    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let join = Message::Join {
        requested_id,
        name: name.to_string(),
    };
    write_message(&mut writer, &join).await?;

    loop {
        match read_message(&mut reader).await? {
            Some(Message::Assigned { player_id, x, y }) => {
                return Ok((reader, writer, player_id, (x, y)));
            }
            Some(Message::Rejected { reason }) => return Err(ClientError::Rejected(reason)),
            Some(other) => debug!("Ignoring {} before assignment", other.kind()),
            None => {
                return Err(ClientError::ConnectionLost(
                    "server closed the connection during the handshake".to_string(),
                ))
            }
        }
    }
}

/// Routes everything the server sends until the stream ends.
async fn receive_loop(
    mut reader: BufReader<OwnedReadHalf>,
    snapshot_tx: watch::Sender<Option<Snapshot>>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
) {
    let reason = loop {
        match read_message(&mut reader).await {
            Ok(Some(Message::Snapshot(snapshot))) => {
                snapshot_tx.send_replace(Some(snapshot));
            }
            Ok(Some(Message::PlayerJoined { player_id, name })) => {
                let _ = event_tx.send(ClientEvent::PlayerJoined { player_id, name });
            }
            Ok(Some(Message::PlayerLeft { player_id, name })) => {
                let _ = event_tx.send(ClientEvent::PlayerLeft { player_id, name });
            }
            Ok(Some(Message::Rejected { reason })) => {
                break format!("rejected by server: {}", reason);
            }
            Ok(Some(other)) => warn!("Unexpected {} from server", other.kind()),
            Ok(None) => break "server closed the connection".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    info!("Disconnected: {}", reason);
    drop(snapshot_tx);
    let _ = event_tx.send(ClientEvent::ConnectionLost(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PlayerState;
    use tokio::net::TcpListener;

    /// Accepts one client, reads its Join and answers with `reply`.
    async fn fake_server(reply: Option<Message>) -> (String, JoinHandle<(TcpStream, Message)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let join = read_message(&mut stream).await.unwrap().unwrap();
            if let Some(reply) = reply {
                write_message(&mut stream, &reply).await.unwrap();
            }
            (stream, join)
        });

        (addr, task)
    }

    fn assigned(x: f32, y: f32) -> Option<Message> {
        Some(Message::Assigned {
            player_id: 4,
            x,
            y,
        })
    }

    #[tokio::test]
    async fn test_connect_sends_join_and_reads_assignment() {
        let (addr, server) = fake_server(assigned(200.0, 150.0)).await;

        let client = NetworkClient::connect(&addr, "ali", Some(4)).await.unwrap();
        let (_stream, join) = server.await.unwrap();

        assert_eq!(
            join,
            Message::Join {
                requested_id: Some(4),
                name: "ali".to_string()
            }
        );
        assert_eq!(client.player_id(), 4);
        assert_eq!(client.position(), (200.0, 150.0));
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let reply = Some(Message::Rejected {
            reason: "Server full".to_string(),
        });
        let (addr, _server) = fake_server(reply).await;

        match NetworkClient::connect(&addr, "late", None).await {
            Err(ClientError::Rejected(reason)) => assert_eq!(reason, "Server full"),
            other => panic!("expected rejection, got {:?}", other.map(|c| c.player_id())),
        }
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (addr, _server) = fake_server(None).await;

        let result = NetworkClient::connect_with_timeout(
            &addr,
            "slow",
            None,
            Duration::from_millis(100),
        )
        .await;
        assert!(matches!(result, Err(ClientError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = NetworkClient::connect(&addr, "x", None).await;
        assert!(matches!(result, Err(ClientError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_send_move_clamps_and_skips_no_ops() {
        let (addr, server) = fake_server(assigned(380.0, 150.0)).await;
        let mut client = NetworkClient::connect(&addr, "edge", None).await.unwrap();
        let (mut stream, _) = server.await.unwrap();

        // Already at the right edge.
        assert!(!client.send_move(5.0, 0.0).await.unwrap());
        assert!(client.send_move(-5.0, 0.0).await.unwrap());
        assert_eq!(client.position(), (375.0, 150.0));

        assert_eq!(
            read_message(&mut stream).await.unwrap().unwrap(),
            Message::Move {
                player_id: 4,
                x: 375.0,
                y: 150.0
            }
        );
    }

    #[tokio::test]
    async fn test_snapshots_events_and_connection_loss() {
        let (addr, server) = fake_server(assigned(200.0, 150.0)).await;
        let mut client = NetworkClient::connect(&addr, "a", None).await.unwrap();
        let (mut stream, _) = server.await.unwrap();

        for tick in 1..=2 {
            let snapshot = Snapshot {
                tick,
                timestamp: 0,
                players: vec![PlayerState::new(4, "a", 200.0, 150.0)],
            };
            write_message(&mut stream, &Message::Snapshot(snapshot))
                .await
                .unwrap();
        }
        let joined = Message::PlayerJoined {
            player_id: 5,
            name: "b".to_string(),
        };
        write_message(&mut stream, &joined).await.unwrap();
        drop(stream);

        let mut events = Vec::new();
        while events.len() < 2 {
            match client.poll_event() {
                Some(event) => events.push(event),
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }

        assert_eq!(
            events[0],
            ClientEvent::PlayerJoined {
                player_id: 5,
                name: "b".to_string()
            }
        );
        assert!(matches!(events[1], ClientEvent::ConnectionLost(_)));

        // The newest snapshot survives the disconnect, exactly once.
        let last = client.poll_snapshot().unwrap().unwrap();
        assert_eq!(last.tick, 2);
        assert!(matches!(
            client.poll_snapshot(),
            Err(ClientError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_poll_snapshot_returns_latest_once() {
        let (addr, server) = fake_server(assigned(200.0, 150.0)).await;
        let mut client = NetworkClient::connect(&addr, "a", None).await.unwrap();
        let (mut stream, _) = server.await.unwrap();

        assert!(client.poll_snapshot().unwrap().is_none());

        for tick in 1..=3 {
            let snapshot = Snapshot {
                tick,
                ..Snapshot::default()
            };
            write_message(&mut stream, &Message::Snapshot(snapshot))
                .await
                .unwrap();
        }
        let marker = Message::PlayerLeft {
            player_id: 9,
            name: "z".to_string(),
        };
        write_message(&mut stream, &marker).await.unwrap();

        // The notice is sent after the snapshots, so once it shows up all
        // three snapshots have been routed.
        while client.poll_event().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let latest = client.poll_snapshot().unwrap().unwrap();
        assert_eq!(latest.tick, 3);
        assert!(client.poll_snapshot().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_leave_sends_leave() {
        let (addr, server) = fake_server(assigned(200.0, 150.0)).await;
        let client = NetworkClient::connect(&addr, "a", None).await.unwrap();
        let (mut stream, _) = server.await.unwrap();

        client.leave().await.unwrap();

        assert_eq!(
            read_message(&mut stream).await.unwrap(),
            Some(Message::Leave { player_id: 4 })
        );
        assert_eq!(read_message(&mut stream).await.unwrap(), None);
    }
}
