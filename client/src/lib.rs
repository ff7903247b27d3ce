//! # Shared Space Client
//!
//! Client side of the shared 2D world. It joins the server over TCP, moves
//! its own player and keeps the most recent snapshot of everybody else around
//! for whatever presents it.
//!
//! ## Architecture
//!
//! ### Network Adapter
//! [`network::NetworkClient`] performs the `Join` handshake and then hands the
//! read half of the socket to a background task. That task keeps only the
//! latest snapshot (older ones are overwritten, never queued) and forwards
//! join/leave notices and loss of connection as [`network::ClientEvent`]s.
//! The frame loop polls both without ever blocking on the network.
//!
//! ### Presentation
//! Drawing is behind the [`rendering::Renderer`] trait. The bundled
//! [`rendering::LogRenderer`] prints the world through `log`, which keeps the
//! binary headless.
//!
//! ### Input
//! [`input::InputSource`] yields one command per frame. [`input::RandomWalk`]
//! wanders the world; [`input::ScriptedInput`] replays a fixed list and is
//! what the tests use.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::game::GameLoop;
//! use client::input::RandomWalk;
//! use client::network::NetworkClient;
//! use client::rendering::LogRenderer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = NetworkClient::connect("127.0.0.1:12345", "ali", None).await?;
//!     let exit = GameLoop::new(network, LogRenderer::new(), RandomWalk::new(None), 30)
//!         .run()
//!         .await?;
//!     println!("stopped: {:?}", exit);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod game;
pub mod input;
pub mod network;
pub mod rendering;
