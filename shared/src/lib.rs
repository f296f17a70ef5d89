//! Protocol building blocks shared by the client and server
//!
//! Both ends of a connection speak the same two packet families:
//! connectionless text commands framed by [`oob`], and sequenced channel
//! packets framed by [`netchan`] carrying the [`message`] types. Reliable
//! text commands ride inside channel packets through the rings in
//! [`reliable`]. The [`vm`] module holds the syscall bridge to game-logic
//! modules.

pub mod address;
pub mod args;
pub mod challenge;
pub mod cmd;
pub mod dns;
pub mod error;
pub mod info;
pub mod message;
pub mod netchan;
pub mod oob;
pub mod protocol;
pub mod rcon;
pub mod reliable;
pub mod vm;

pub use address::NetAddress;
pub use args::Args;
pub use error::ProtocolError;
pub use info::InfoMap;
pub use protocol::*;

/// Converts a duration in milliseconds since some epoch into the `i32`
/// millisecond clock the protocol cores run on
pub fn millis_i32(elapsed: std::time::Duration) -> i32 {
    (elapsed.as_millis() as u64 & 0x7FFF_FFFF) as i32
}
