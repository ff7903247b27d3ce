//! # Shared Space Server
//!
//! Authoritative server for a small 2D world that several players share over
//! TCP. Clients join, move their own avatar and leave; the server keeps the
//! canonical positions and broadcasts a snapshot of everybody at a fixed rate.
//!
//! ## Architecture
//!
//! ### Event Loop
//! All state changes happen on one task. Per-connection reader tasks decode
//! frames and forward them as [`network::ServerEvent`]s; the loop applies them
//! to the [`registry::PlayerRegistry`] and [`session::SessionManager`] and
//! broadcasts on every tick. Both live behind `Arc<RwLock<_>>` so the accept
//! task and the timeout checker can inspect sessions.
//!
//! ### Per-Session Writers
//! Every session owns a bounded outbound queue drained by its own writer task.
//! Broadcasting only queues an already encoded frame, so one slow client can
//! never hold up the others. A session whose queue overflows is dropped.
//!
//! ### Session Lifecycle
//! `Connecting -> Active -> Disconnecting -> Closed`. Teardown is idempotent:
//! a read error, a write error and a timeout racing for the same session
//! remove its player and announce the departure exactly once.
//!
//! ## Module Organization
//!
//! - `registry`: player id to state map, the world as the server sees it
//! - `session`: connection bookkeeping, handshake and id allocation
//! - `broadcast`: snapshot numbering and non-blocking fan-out
//! - `network`: listener, socket tasks and the event loop
//! - `config`: runtime settings and command line
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     println!("listening on {}", server.local_addr());
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod network;
pub mod registry;
pub mod session;
