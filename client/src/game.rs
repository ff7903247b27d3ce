//! Frame loop driving input, network and renderer.

use crate::error::ClientError;
use crate::input::{InputCommand, InputSource};
use crate::network::{ClientEvent, NetworkClient};
use crate::rendering::Renderer;
use log::{debug, info};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

/// Time between two frames at `fps`, never shorter than a millisecond.
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64).max(MIN_FRAME_INTERVAL)
}

/// Why [`GameLoop::run`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    ConnectionLost(String),
    Quit,
    DurationElapsed,
}

pub struct GameLoop<R: Renderer, I: InputSource> {
    network: NetworkClient,
    renderer: R,
    input: I,
    frame_interval: Duration,
    max_duration: Option<Duration>,
}

impl<R: Renderer, I: InputSource> GameLoop<R, I> {
    pub fn new(network: NetworkClient, renderer: R, input: I, fps: u32) -> Self {
        Self {
            network,
            renderer,
            input,
            frame_interval: frame_interval(fps),
            max_duration: None,
        }
    }

    /// Leaves the world after `duration` instead of running until told to quit.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    /// Runs one frame per tick until input quits, the duration is over or the
    /// connection is lost. Losing the connection is a normal exit, not an error.
    pub async fn run(mut self) -> Result<ExitReason, ClientError> {
        let mut ticker = interval(self.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let started = Instant::now();

        loop {
            ticker.tick().await;

            if self
                .max_duration
                .is_some_and(|max| started.elapsed() >= max)
            {
                info!("Run time over, leaving");
                self.leave().await;
                return Ok(ExitReason::DurationElapsed);
            }

            match self.input.next_move() {
                InputCommand::Move(dx, dy) => {
                    if let Err(e) = self.network.send_move(dx, dy).await {
                        return self.lost(e);
                    }
                }
                InputCommand::Idle => {}
                InputCommand::Quit => {
                    self.leave().await;
                    return Ok(ExitReason::Quit);
                }
            }

            while let Some(event) = self.network.poll_event() {
                if let ClientEvent::ConnectionLost(reason) = event {
                    self.renderer.connection_lost(&reason);
                    return Ok(ExitReason::ConnectionLost(reason));
                }
                self.renderer.notify(&event);
            }

            match self.network.poll_snapshot() {
                Ok(Some(snapshot)) => self.renderer.render(self.network.player_id(), &snapshot),
                Ok(None) => {}
                Err(e) => return self.lost(e),
            }
        }
    }

    fn lost(&mut self, error: ClientError) -> Result<ExitReason, ClientError> {
        match error {
            ClientError::ConnectionLost(reason) => {
                self.renderer.connection_lost(&reason);
                Ok(ExitReason::ConnectionLost(reason))
            }
            other => Err(other),
        }
    }

    async fn leave(self) {
        if let Err(e) = self.network.leave().await {
            debug!("Leave was not delivered: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{read_message, write_message, Message, PlayerId, PlayerState, Snapshot};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Default, Clone)]
    struct Recorder {
        frames: Arc<Mutex<Vec<u32>>>,
        lost: Arc<Mutex<Vec<String>>>,
    }

    impl Renderer for Recorder {
        fn render(&mut self, _local_id: PlayerId, snapshot: &Snapshot) {
            self.frames.lock().unwrap().push(snapshot.tick);
        }

        fn notify(&mut self, _event: &ClientEvent) {}

        fn connection_lost(&mut self, reason: &str) {
            self.lost.lock().unwrap().push(reason.to_string());
        }
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[test]
    fn test_frame_interval_bounds() {
        assert_eq!(frame_interval(0), Duration::from_secs(1));
        assert_eq!(frame_interval(100), Duration::from_millis(10));
        assert_eq!(frame_interval(u32::MAX), MIN_FRAME_INTERVAL);
    }

    #[tokio::test]
    async fn test_scripted_session_moves_renders_and_leaves() {
        let (listener, addr) = listener().await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_message(&mut stream).await.unwrap();
            let assigned = Message::Assigned {
                player_id: 1,
                x: 200.0,
                y: 150.0,
            };
            write_message(&mut stream, &assigned).await.unwrap();
            let snapshot = Snapshot {
                tick: 1,
                timestamp: 0,
                players: vec![PlayerState::new(1, "a", 200.0, 150.0)],
            };
            write_message(&mut stream, &Message::Snapshot(snapshot))
                .await
                .unwrap();

            let mut received = Vec::new();
            while let Some(message) = read_message(&mut stream).await.unwrap() {
                received.push(message);
            }
            received
        });

        let network = NetworkClient::connect(&addr, "a", None).await.unwrap();
        let recorder = Recorder::default();
        let mut script = vec![InputCommand::Move(5.0, 0.0)];
        script.extend(std::iter::repeat(InputCommand::Idle).take(10));
        let input = crate::input::ScriptedInput::new(script);

        let exit = GameLoop::new(network, recorder.clone(), input, 100)
            .run()
            .await
            .unwrap();

        assert_eq!(exit, ExitReason::Quit);
        assert_eq!(*recorder.frames.lock().unwrap(), vec![1]);
        assert_eq!(
            server.await.unwrap(),
            vec![
                Message::Move {
                    player_id: 1,
                    x: 205.0,
                    y: 150.0
                },
                Message::Leave { player_id: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_connection_loss_ends_loop_gracefully() {
        let (listener, addr) = listener().await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_message(&mut stream).await.unwrap();
            let assigned = Message::Assigned {
                player_id: 2,
                x: 200.0,
                y: 150.0,
            };
            write_message(&mut stream, &assigned).await.unwrap();
        });

        let network = NetworkClient::connect(&addr, "b", None).await.unwrap();
        let recorder = Recorder::default();
        let input = crate::input::ScriptedInput::new(std::iter::repeat(InputCommand::Idle).take(500));

        let exit = GameLoop::new(network, recorder.clone(), input, 100)
            .run()
            .await
            .unwrap();

        assert!(matches!(exit, ExitReason::ConnectionLost(_)));
        assert_eq!(recorder.lost.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duration_limit() {
        let (listener, addr) = listener().await;

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_message(&mut stream).await.unwrap();
            let assigned = Message::Assigned {
                player_id: 3,
                x: 200.0,
                y: 150.0,
            };
            write_message(&mut stream, &assigned).await.unwrap();
            read_message(&mut stream).await.unwrap()
        });

        let network = NetworkClient::connect(&addr, "c", None).await.unwrap();
        let input = crate::input::ScriptedInput::new(std::iter::repeat(InputCommand::Idle).take(1000));

        let exit = GameLoop::new(network, Recorder::default(), input, 100)
            .with_duration(Duration::from_millis(50))
            .run()
            .await
            .unwrap();

        assert_eq!(exit, ExitReason::DurationElapsed);
        assert_eq!(server.await.unwrap(), Some(Message::Leave { player_id: 3 }));
    }
}
