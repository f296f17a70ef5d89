//! Protocol constants shared by both ends of the connection

/// Wire protocol version; peers with a different value are refused
pub const PROTOCOL_VERSION: i32 = 86;

/// Product tag sent in master server heartbeats
pub const HEARTBEAT_FOR_MASTER: &str = "NetSession";
pub const GAMENAME_FOR_MASTER: &str = "NETSESSION";
pub const ENGINE_VERSION: &str = "0.1.0";

/// Size of the reliable command ring; must be a power of two
pub const MAX_RELIABLE_COMMANDS: usize = 256;

/// Snapshot frames retained per connection; must be a power of two
pub const PACKET_BACKUP: usize = 32;
pub const PACKET_MASK: usize = PACKET_BACKUP - 1;

pub const MAX_MSGLEN: usize = 32768;
pub const MAX_STRING_CHARS: usize = 1024;
pub const MAX_INFO_STRING: usize = 1024;
pub const MAX_CONFIGSTRINGS: usize = 1024;
/// Configstring holding the serverinfo string
pub const CS_SERVERINFO: usize = 0;
/// Configstring holding engine values such as `sv_serverid`
pub const CS_SYSTEMINFO: usize = 1;
/// Longest configstring fragment carried by one `bcs` command
pub const BIG_CONFIGSTRING_CHUNK: usize = 1000;

pub const MAX_CLIENTS: usize = 64;
pub const GENTITYNUM_BITS: u32 = 13;
pub const MAX_GENTITIES: usize = 1 << GENTITYNUM_BITS;

pub const MAX_DOWNLOAD_WINDOW: usize = 8;
pub const MAX_DOWNLOAD_BLKSIZE: usize = 2048;

pub const PORT_MASTER: u16 = 27950;
pub const PORT_SERVER: u16 = 27960;
pub const MAX_MASTER_SERVERS: usize = 5;
/// Milliseconds between periodic heartbeats
pub const HEARTBEAT_MSEC: i32 = 300 * 1000;

/// Challenge tokens expire after this many milliseconds
pub const CHALLENGE_TIMEOUT_MSEC: i32 = 5000;

/// Client resend interval for `getchallenge`/`connect`
pub const RETRANSMIT_TIMEOUT: i32 = 3000;

pub const MAX_INFO_RECEIPTS: usize = 48;
pub const MAX_PINGREQUESTS: usize = 16;

/// Server time of the first frame after a map load
pub const INITIAL_SERVER_TIME: i32 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_sizes_are_powers_of_two() {
        assert!(MAX_RELIABLE_COMMANDS.is_power_of_two());
        assert!(PACKET_BACKUP.is_power_of_two());
        assert_eq!(MAX_GENTITIES, 8192);
    }
}
