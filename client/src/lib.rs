//! # Session Client Library
//!
//! The client half of the session layer: it resolves and challenges a
//! server, keeps its reliable command stream in order, loads the gamestate,
//! tracks snapshots and server time, downloads missing paks, records and
//! plays demos, pings servers and talks to remote consoles.
//!
//! ## Architecture Design
//!
//! ### Time-Injected Core
//! [`state::ClientState`] owns the whole connection and never touches a
//! socket or a clock. Callers pass the current time in milliseconds to
//! [`state::ClientState::frame`] and [`state::ClientState::packet_event`],
//! then drain the datagrams it queued with
//! [`state::ClientState::drain_outgoing`] and the notifications meant for the
//! game layer with [`state::ClientState::drain_events`].
//!
//! ### Event Loop
//! [`network::Client`] binds a tokio UDP socket and feeds packets, console
//! lines and finished host lookups into the core. Name resolution runs on a
//! blocking task so a slow resolver never stalls a frame.
//!
//! ### Connection States
//! A connection moves through
//! `Disconnected -> Connecting -> Challenging -> Connected -> Downloading ->
//! Loading -> Primed -> Active`. Any fatal protocol error drops back to
//! `Disconnected` with a reason available from
//! [`state::ClientState::last_error`].
//!
//! ## Module Organization
//!
//! - `config`: client settings and their validation
//! - `connection`: handshake, resends, timeouts, packet dispatch and console commands
//! - `demo`: demo recording and playback
//! - `download`: in-band and HTTP pak downloads
//! - `input`: user commands and outgoing packet assembly
//! - `network`: the tokio UDP front end
//! - `ping`: server ping slots
//! - `rcon`: remote console requests
//! - `server_commands`: the reliable server command window
//! - `snapshots`: gamestate and snapshot parsing
//! - `state`: connection state, errors and events
//! - `timing`: server time tracking and drift correction
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::config::ClientConfig;
//! use client::network::{Client, NetworkEvent};
//! use client::state::ClientState;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = ClientState::new(ClientConfig::default());
//!     let mut client = Client::new("0.0.0.0:0", state).await?;
//!     client
//!         .handle()
//!         .send(NetworkEvent::ConsoleLine("connect localhost".to_string()))?;
//!
//!     // Runs frames until "quit" or a Quit event
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod demo;
pub mod download;
pub mod input;
pub mod network;
pub mod ping;
pub mod rcon;
pub mod server_commands;
pub mod snapshots;
pub mod state;
pub mod timing;

pub use config::ClientConfig;
pub use state::{ClientError, ClientEvent, ClientState, ConnState};
