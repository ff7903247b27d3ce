//! Server settings and the command line that produces them.

use crate::error::ServerError;
use clap::Parser;
use shared::{DEFAULT_PORT, MAX_SNAPSHOT_PLAYERS};
use std::time::Duration;

/// Shortest broadcast interval, i.e. at most 1000 snapshots per second.
pub const MIN_BROADCAST_INTERVAL: Duration = Duration::from_millis(1);

/// Runtime settings for [`crate::network::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` to listen on
    pub bind_addr: String,
    /// Time between two snapshot broadcasts
    pub broadcast_interval: Duration,
    /// Also broadcast right after every join, move and leave
    pub push_on_change: bool,
    /// Players allowed in the world at once
    pub max_players: usize,
    /// Sockets allowed at once, including ones still handshaking
    pub max_connections: usize,
    /// Time a new connection gets to send `Join`
    pub handshake_timeout: Duration,
    /// Drop active sessions that stay silent this long; `None` disables it
    pub idle_timeout: Option<Duration>,
    /// Upper bound on a single socket write
    pub write_timeout: Duration,
    /// Frames queued per session before it counts as stalled
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            broadcast_interval: Duration::from_millis(50), // 20 Hz
            push_on_change: false,
            max_players: 32,
            max_connections: 64,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            write_timeout: Duration::from_secs(2),
            outbound_capacity: 64,
        }
    }
}

impl ServerConfig {
    /// Snapshot rate in Hz, for logging.
    pub fn broadcast_rate(&self) -> f64 {
        1.0 / self.broadcast_interval.as_secs_f64()
    }

    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.broadcast_interval < MIN_BROADCAST_INTERVAL {
            return Err(ServerError::Config(format!(
                "broadcast interval {:?} is below {:?}",
                self.broadcast_interval, MIN_BROADCAST_INTERVAL
            )));
        }
        if self.max_players > MAX_SNAPSHOT_PLAYERS {
            return Err(ServerError::Config(format!(
                "max players {} exceeds the {} that fit in one snapshot",
                self.max_players, MAX_SNAPSHOT_PLAYERS
            )));
        }
        Ok(())
    }
}

/// Command line arguments for the server binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Snapshot broadcasts per second
    #[arg(short = 't', long, default_value = "20")]
    pub tick_rate: u32,

    /// Broadcast immediately after every state change as well
    #[arg(long)]
    pub push_on_change: bool,

    /// Maximum number of players
    #[arg(short = 'm', long, default_value = "32")]
    pub max_players: usize,

    /// Disconnect players silent for this many seconds (0 disables)
    #[arg(long, default_value = "0")]
    pub idle_timeout_secs: u64,

    /// Seconds a new connection has to send Join
    #[arg(long, default_value = "10")]
    pub handshake_timeout_secs: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let defaults = ServerConfig::default();
        let tick_rate = args.tick_rate.max(1);

        ServerConfig {
            bind_addr: format!("{}:{}", args.host, args.port),
            broadcast_interval: Duration::from_secs_f64(1.0 / tick_rate as f64)
                .max(MIN_BROADCAST_INTERVAL),
            push_on_change: args.push_on_change,
            max_players: args.max_players,
            max_connections: defaults.max_connections.max(args.max_players * 2),
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            idle_timeout: (args.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(args.idle_timeout_secs)),
            ..defaults
        }
    }
}
