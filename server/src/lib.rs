//! # Session Server Library
//!
//! This library provides the server side of the session layer for a
//! networked multiplayer game: it answers connectionless queries, admits
//! clients through a challenge handshake, keeps every connection's reliable
//! command stream in order, sends the gamestate and snapshots, serves
//! downloads, and forwards game events to a pluggable game module.
//!
//! ## Architecture Design
//!
//! ### Time-Injected Core
//! [`ServerState`] is a plain synchronous value. Every entry point takes the
//! current time in milliseconds, and every datagram it wants sent is queued
//! in an outbox that the caller drains with
//! [`ServerState::drain_outgoing`]. Tests drive it directly without sockets
//! or clocks.
//!
//! ### Event Loop
//! [`network::Server`] wraps the core in a tokio UDP loop: a receiver task
//! forwards datagrams, a sender task writes the outbox, and the main loop
//! runs one server frame per tick of the `sv_fps` interval.
//!
//! ### Game Module Boundary
//! Game logic sits behind the [`game::GameModule`] trait. [`game::LocalGame`]
//! runs in-process; [`game::VmGame`] talks to a module through the syscall
//! bridge in `shared::vm`. Any failure of the module stops the server with
//! an error instead of crashing it.
//!
//! ## Module Organization
//!
//! - `client_manager`: client slots, lifecycle states and lookups
//! - `config`: server settings and their validation
//! - `connectionless`: out-of-band commands and the connect handshake
//! - `download`: in-band file transfer and HTTP redirects
//! - `drdos`: reflection flood guard for status queries
//! - `game`: the game module trait and its implementations
//! - `heartbeat`: master server heartbeats
//! - `network`: the tokio UDP front end
//! - `rcon`: remote console and console commands
//! - `session`: per-client command processing, userinfo and drops
//! - `snapshot`: gamestate and snapshot construction with rate control
//! - `state`: server state, frames, map changes and shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::game::LocalGame;
//! use server::network::Server;
//! use server::state::ServerState;
//! use std::time::Instant;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = ServerState::new(ServerConfig::default(), Box::new(LocalGame::new()), 0)?;
//!     let mut server = Server::new("0.0.0.0:27960", state, Instant::now()).await?;
//!
//!     // Runs frames until a shutdown message arrives or the game module fails
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod connectionless;
pub mod download;
pub mod drdos;
pub mod game;
pub mod heartbeat;
pub mod network;
pub mod rcon;
pub mod session;
pub mod snapshot;
pub mod state;

pub use client_manager::{ClientManager, ClientNum, ClientState};
pub use config::{ConfigError, NetworkScope, ServerConfig, ServerPrivate};
pub use state::{Outgoing, ServerError, ServerState};
