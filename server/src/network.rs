//! TCP front end and the event loop that ties sessions, registry and
//! broadcasting together.

use crate::broadcast::{broadcast_message, fan_out, Broadcaster};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::PlayerRegistry;
use crate::session::{normalize_name, Frame, SessionId, SessionManager, SessionState};
use log::{debug, error, info, warn};
use shared::{
    clamp_to_world, encode, read_message, spawn_position, write_frame, write_message, Message,
    PlayerId, ProtocolError,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Messages sent from network tasks to the event loop
#[derive(Debug)]
pub enum ServerEvent {
    MessageReceived {
        session_id: SessionId,
        message: Message,
    },
    /// Peer closed the stream between frames.
    ConnectionClosed {
        session_id: SessionId,
    },
    ReadFailed {
        session_id: SessionId,
        error: ProtocolError,
    },
    WriteFailed {
        session_id: SessionId,
        reason: String,
    },
    SessionExpired {
        session_id: SessionId,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Left,
    Closed,
    ReadError,
    WriteError,
    Timeout,
    ProtocolViolation,
    Rejected,
    InternalError,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Left => "left",
            DisconnectReason::Closed => "connection closed by peer",
            DisconnectReason::ReadError => "read error",
            DisconnectReason::WriteError => "write error",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::Rejected => "join rejected",
            DisconnectReason::InternalError => "internal error",
            DisconnectReason::Shutdown => "server shutdown",
        };
        f.write_str(text)
    }
}

/// Stops a running server from another task.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    event_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        if self.event_tx.send(ServerEvent::Shutdown).is_err() {
            debug!("Shutdown requested but the server already stopped");
        }
    }
}

/// Accepts connections, runs the handshake, applies moves and broadcasts snapshots.
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    config: ServerConfig,
    registry: Arc<RwLock<PlayerRegistry>>,
    sessions: Arc<RwLock<SessionManager>>,
    broadcaster: Broadcaster,

    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let sessions = SessionManager::new(config.max_connections, config.max_players);

        Ok(Server {
            listener: Some(listener),
            local_addr,
            config,
            registry: Arc::new(RwLock::new(PlayerRegistry::new())),
            sessions: Arc::new(RwLock::new(sessions)),
            broadcaster: Broadcaster::new(),
            event_tx,
            event_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            event_tx: self.event_tx.clone(),
        }
    }

    pub fn registry(&self) -> Arc<RwLock<PlayerRegistry>> {
        Arc::clone(&self.registry)
    }

    pub fn sessions(&self) -> Arc<RwLock<SessionManager>> {
        Arc::clone(&self.sessions)
    }

    /// Spawns the task that accepts sockets and starts their reader/writer tasks
    fn spawn_acceptor(&self, listener: TcpListener) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let event_tx = self.event_tx.clone();
        let capacity = self.config.outbound_capacity.max(1);
        let write_timeout = self.config.write_timeout;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not disable Nagle for {}: {}", addr, e);
                        }
                        accept_connection(stream, addr, &sessions, &event_tx, capacity, write_timeout)
                            .await;
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }

                if event_tx.is_closed() {
                    break;
                }
            }
        })
    }

    /// Spawns task that reports sessions past their handshake or idle timeout
    fn spawn_timeout_checker(&self) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let event_tx = self.event_tx.clone();
        let handshake_timeout = self.config.handshake_timeout;
        let idle_timeout = self.config.idle_timeout;

        tokio::spawn(async move {
            let mut ticker = interval(TIMEOUT_CHECK_INTERVAL);

            loop {
                ticker.tick().await;

                let expired = {
                    let sessions = sessions.read().await;
                    sessions.expired(Instant::now(), handshake_timeout, idle_timeout)
                };

                for session_id in expired {
                    if event_tx
                        .send(ServerEvent::SessionExpired { session_id })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        })
    }

    /// Main loop: handles session events and broadcasts on every tick until
    /// [`ServerHandle::shutdown`] is called.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut background = Vec::with_capacity(2);
        if let Some(listener) = self.listener.take() {
            background.push(self.spawn_acceptor(listener));
        }
        background.push(self.spawn_timeout_checker());

        let mut tick_interval = interval(self.config.broadcast_interval);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Server started, broadcasting at {:.1} Hz{}",
            self.config.broadcast_rate(),
            if self.config.push_on_change {
                " and on every change"
            } else {
                ""
            }
        );

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(ServerEvent::Shutdown) | None => break,
                        Some(event) => self.handle_event(event).await,
                    }
                },

                _ = tick_interval.tick() => {
                    self.broadcast_snapshot().await;

                    if self.broadcaster.tick() % 200 == 0 {
                        let players = self.registry.read().await.len();
                        if players > 0 {
                            debug!("Tick {}: {} players", self.broadcaster.tick(), players);
                        }
                    }
                },
            }
        }

        // Stop accepting first; the listener is released once the acceptor is gone.
        for task in background {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Background task failed: {}", e);
                }
            }
        }

        self.close_all().await;
        info!("Server shut down");
        Ok(())
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived {
                session_id,
                message,
            } => self.handle_message(session_id, message).await,
            ServerEvent::ConnectionClosed { session_id } => {
                self.teardown(session_id, DisconnectReason::Closed).await;
            }
            ServerEvent::ReadFailed { session_id, error } => {
                let reason = if error.is_peer_fault() {
                    warn!("Session {} sent bad data: {}", session_id, error);
                    DisconnectReason::ProtocolViolation
                } else {
                    debug!("Session {} read failed: {}", session_id, error);
                    DisconnectReason::ReadError
                };
                self.teardown(session_id, reason).await;
            }
            ServerEvent::WriteFailed { session_id, reason } => {
                debug!("Session {} write failed: {}", session_id, reason);
                self.teardown(session_id, DisconnectReason::WriteError).await;
            }
            ServerEvent::SessionExpired { session_id } => {
                self.teardown(session_id, DisconnectReason::Timeout).await;
            }
            ServerEvent::Shutdown => {}
        }
    }

    /// Dispatches one decoded message from a session.
    async fn handle_message(&mut self, session_id: SessionId, message: Message) {
        let (state, own_player) = {
            let mut sessions = self.sessions.write().await;
            sessions.touch(session_id);
            match sessions.get(session_id) {
                Some(session) => (session.state, session.player_id),
                // Already torn down; the event was in flight.
                None => return,
            }
        };

        if state == SessionState::Disconnecting {
            return;
        }

        match message {
            Message::Join { requested_id, name } => {
                if state != SessionState::Connecting {
                    warn!("Session {} sent a second Join", session_id);
                    self.teardown(session_id, DisconnectReason::ProtocolViolation)
                        .await;
                    return;
                }
                self.handle_join(session_id, requested_id, &name).await;
            }
            Message::Move { player_id, x, y } => {
                let Some(own_player) = own_player else {
                    warn!("Session {} sent Move before joining", session_id);
                    self.teardown(session_id, DisconnectReason::ProtocolViolation)
                        .await;
                    return;
                };
                if player_id != own_player {
                    warn!(
                        "Player {} tried to move player {}, ignoring",
                        own_player, player_id
                    );
                    return;
                }
                self.handle_move(session_id, own_player, x, y).await;
            }
            Message::Leave { player_id } => {
                if own_player.is_some_and(|own| own != player_id) {
                    warn!(
                        "Session {} sent Leave for player {} it does not own",
                        session_id, player_id
                    );
                }
                self.teardown(session_id, DisconnectReason::Left).await;
            }
            other => {
                warn!(
                    "Session {} sent server-only message {}",
                    session_id,
                    other.kind()
                );
                self.teardown(session_id, DisconnectReason::ProtocolViolation)
                    .await;
            }
        }
    }

    /// Handshake: `Connecting -> Active`, or a rejection followed by close.
    async fn handle_join(
        &mut self,
        session_id: SessionId,
        requested_id: Option<PlayerId>,
        raw_name: &str,
    ) {
        let allocation = {
            let mut sessions = self.sessions.write().await;
            sessions.allocate_player_id(requested_id)
        };

        let player_id = match allocation {
            Ok(player_id) => player_id,
            Err(rejection) => {
                info!("Rejecting session {}: {}", session_id, rejection);
                self.send_to(
                    session_id,
                    &Message::Rejected {
                        reason: rejection.to_string(),
                    },
                )
                .await;
                self.teardown(session_id, DisconnectReason::Rejected).await;
                return;
            }
        };

        let name = normalize_name(raw_name, player_id);
        let (x, y) = spawn_position();

        let added = self.registry.write().await.add(player_id, &name, (x, y));
        if let Err(e) = added {
            error!("Registry out of sync with sessions: {}", e);
            self.teardown(session_id, DisconnectReason::InternalError)
                .await;
            return;
        }

        let activated = {
            let mut sessions = self.sessions.write().await;
            sessions.activate(session_id, player_id, name.clone())
        };
        if !activated {
            self.registry.write().await.remove(player_id);
            return;
        }

        info!("Player {} ({}) joined at ({}, {})", player_id, name, x, y);

        if !self
            .send_to(session_id, &Message::Assigned { player_id, x, y })
            .await
        {
            self.teardown(session_id, DisconnectReason::WriteError).await;
            return;
        }

        let failed = self
            .fan_out(&Message::PlayerJoined { player_id, name })
            .await;
        self.teardown_all(failed, DisconnectReason::WriteError).await;

        if self.config.push_on_change {
            let failed = self.fan_out_snapshot().await;
            self.teardown_all(failed, DisconnectReason::WriteError).await;
        }
    }

    async fn handle_move(&mut self, session_id: SessionId, player_id: PlayerId, x: f32, y: f32) {
        let position = clamp_to_world(x, y);
        let result = self
            .registry
            .write()
            .await
            .update_position(player_id, position);

        if let Err(e) = result {
            error!("Registry out of sync with sessions: {}", e);
            self.teardown(session_id, DisconnectReason::InternalError)
                .await;
            return;
        }

        debug!(
            "Player {} moved to ({}, {})",
            player_id, position.0, position.1
        );

        if self.config.push_on_change {
            let failed = self.fan_out_snapshot().await;
            self.teardown_all(failed, DisconnectReason::WriteError).await;
        }
    }

    /// Queues a message for a single session.
    async fn send_to(&self, session_id: SessionId, message: &Message) -> bool {
        let frame = match encode(message) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                error!("Failed to encode {}: {}", message.kind(), e);
                return false;
            }
        };
        self.sessions.read().await.send_to(session_id, frame)
    }

    /// Queues a message on every active session and returns the ones that failed.
    async fn fan_out(&self, message: &Message) -> Vec<SessionId> {
        let mut sessions = self.sessions.write().await;
        match broadcast_message(&mut sessions, message) {
            Ok(failed) => failed,
            Err(e) => {
                error!("Failed to encode {}: {}", message.kind(), e);
                Vec::new()
            }
        }
    }

    async fn fan_out_snapshot(&mut self) -> Vec<SessionId> {
        let frame = {
            let registry = self.registry.read().await;
            self.broadcaster.snapshot_frame(&registry)
        };

        match frame {
            Ok(frame) => {
                let mut sessions = self.sessions.write().await;
                fan_out(&mut sessions, &frame)
            }
            Err(e) => {
                error!("Failed to encode snapshot: {}", e);
                Vec::new()
            }
        }
    }

    /// Periodic broadcast; skipped while nobody is listening.
    async fn broadcast_snapshot(&mut self) {
        if self.sessions.read().await.active_count() == 0 {
            return;
        }

        let failed = self.fan_out_snapshot().await;
        self.teardown_all(failed, DisconnectReason::WriteError).await;
    }

    async fn teardown_all(&mut self, session_ids: Vec<SessionId>, reason: DisconnectReason) {
        for session_id in session_ids {
            self.teardown(session_id, reason).await;
        }
    }

    /// `Disconnecting -> Closed`: closes the session, removes its player and
    /// tells everyone else. Safe to call any number of times for the same
    /// session; only the first call has an effect and returns true.
    ///
    /// Sessions that fail while receiving the resulting notices are torn down
    /// in the same pass.
    async fn teardown(&mut self, session_id: SessionId, reason: DisconnectReason) -> bool {
        let mut pending = vec![(session_id, reason)];
        let mut closed_requested = false;

        while !pending.is_empty() {
            let mut removed_player = false;

            for (id, reason) in std::mem::take(&mut pending) {
                let closed = {
                    let mut sessions = self.sessions.write().await;
                    sessions.begin_disconnect(id);
                    sessions.close(id)
                };
                let Some(session) = closed else {
                    continue;
                };

                if id == session_id {
                    closed_requested = true;
                }
                info!("Session {} from {} closed: {}", id, session.addr, reason);

                let Some(player_id) = session.player_id else {
                    continue;
                };
                if self.registry.write().await.remove(player_id).is_none() {
                    continue;
                }

                removed_player = true;
                info!("Player {} ({}) left", player_id, session.name);

                let failed = self
                    .fan_out(&Message::PlayerLeft {
                        player_id,
                        name: session.name.clone(),
                    })
                    .await;
                pending.extend(
                    failed
                        .into_iter()
                        .map(|id| (id, DisconnectReason::WriteError)),
                );
            }

            if removed_player && self.config.push_on_change {
                let failed = self.fan_out_snapshot().await;
                pending.extend(
                    failed
                        .into_iter()
                        .map(|id| (id, DisconnectReason::WriteError)),
                );
            }
        }

        closed_requested
    }

    async fn close_all(&mut self) {
        let ids = self.sessions.read().await.ids();
        for id in ids {
            let closed = self.sessions.write().await.close(id);
            if let Some(player_id) = closed.and_then(|session| session.player_id) {
                self.registry.write().await.remove(player_id);
            }
        }
        info!("Closed all sessions ({})", DisconnectReason::Shutdown);
    }
}

/// Registers a new socket and starts its reader and writer tasks.
async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    sessions: &Arc<RwLock<SessionManager>>,
    event_tx: &mpsc::UnboundedSender<ServerEvent>,
    capacity: usize,
    write_timeout: Duration,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(capacity);

    let session_id = {
        let mut sessions = sessions.write().await;
        sessions.open(addr, outbound_tx)
    };

    let Some(session_id) = session_id else {
        warn!("Refusing connection from {}: too many connections", addr);
        let refusal = Message::Rejected {
            reason: "Too many connections".to_string(),
        };
        if let Ok(Err(e)) = timeout(write_timeout, write_message(&mut write_half, &refusal)).await {
            debug!("Could not tell {} it was refused: {}", addr, e);
        }
        return;
    };

    tokio::spawn(write_loop(
        session_id,
        write_half,
        outbound_rx,
        write_timeout,
        event_tx.clone(),
    ));
    let reader = tokio::spawn(read_loop(session_id, read_half, event_tx.clone()));

    sessions
        .write()
        .await
        .attach_reader(session_id, reader.abort_handle());
}

/// Decodes frames until the stream ends or breaks.
async fn read_loop(
    session_id: SessionId,
    read_half: OwnedReadHalf,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut reader = BufReader::new(read_half);

    loop {
        let (event, done) = match read_message(&mut reader).await {
            Ok(Some(message)) => (
                ServerEvent::MessageReceived {
                    session_id,
                    message,
                },
                false,
            ),
            Ok(None) => (ServerEvent::ConnectionClosed { session_id }, true),
            Err(error) => (ServerEvent::ReadFailed { session_id, error }, true),
        };

        if event_tx.send(event).is_err() || done {
            break;
        }
    }
}

/// Drains the session's outbound queue onto the socket. Ends when the queue is
/// dropped (session closed) or a write fails or times out.
async fn write_loop(
    session_id: SessionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
    write_timeout: Duration,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    while let Some(frame) = outbound.recv().await {
        let failure = match timeout(write_timeout, write_frame(&mut writer, &frame)).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("write timed out after {:?}", write_timeout),
        };

        // The session may already be gone; nobody left to tell is fine.
        let _ = event_tx.send(ServerEvent::WriteFailed {
            session_id,
            reason: failure,
        });
        break;
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Session {} shutdown: {}", session_id, e);
    }
}
