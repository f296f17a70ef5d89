//! Messages carried inside sequenced channel packets
//!
//! Client to server: acknowledgements, reliable client commands, and user
//! commands. Server to client: acknowledgement of client commands plus an
//! ordered list of operations (reliable server commands, gamestate,
//! snapshot, download data). Entities travel as [`EntityDelta`]s against a
//! baseline or an earlier snapshot; only changed fields are present.

use crate::error::ProtocolError;
use crate::protocol::MAX_MSGLEN;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};

/// Snapshot was delayed by rate limiting
pub const SNAPFLAG_RATE_DELAYED: i32 = 1;
/// Client is not yet active in the world
pub const SNAPFLAG_NOT_ACTIVE: i32 = 2;
/// Toggled on every map change or restart
pub const SNAPFLAG_SERVERCOUNT: i32 = 4;

/// A reliable text command with its sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliableCommand {
    pub sequence: i32,
    pub text: String,
}

/// One frame of player input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCmd {
    pub server_time: i32,
    pub buttons: u32,
    pub angles: [i32; 3],
    pub forward_move: i8,
    pub right_move: i8,
    pub up_move: i8,
}

/// User commands sent in one packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveSet {
    /// False when the client has no valid snapshot to delta from
    pub delta: bool,
    pub cmds: Vec<UserCmd>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub server_id: i32,
    /// Last channel sequence received from the server
    pub message_acknowledge: i32,
    /// Last reliable server command received
    pub reliable_acknowledge: i32,
    pub commands: Vec<ReliableCommand>,
    pub moves: Option<MoveSet>,
}

/// Replicated state of one entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub number: u16,
    pub entity_type: i32,
    pub flags: i32,
    pub origin: [i32; 3],
    pub angles: [i32; 3],
    pub model_index: i32,
    pub frame: i32,
    pub event: i32,
    pub other_entity: i32,
}

/// Changed fields of an entity relative to a base state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDelta {
    pub number: u16,
    /// Entity left the snapshot
    pub removed: bool,
    pub entity_type: Option<i32>,
    pub flags: Option<i32>,
    pub origin: Option<[i32; 3]>,
    pub angles: Option<[i32; 3]>,
    pub model_index: Option<i32>,
    pub frame: Option<i32>,
    pub event: Option<i32>,
    pub other_entity: Option<i32>,
}

fn changed<T: PartialEq + Copy>(from: T, to: T) -> Option<T> {
    if from == to {
        None
    } else {
        Some(to)
    }
}

impl EntityState {
    /// Delta that turns `base` into `self`
    pub fn delta_from(&self, base: &EntityState) -> EntityDelta {
        EntityDelta {
            number: self.number,
            removed: false,
            entity_type: changed(base.entity_type, self.entity_type),
            flags: changed(base.flags, self.flags),
            origin: changed(base.origin, self.origin),
            angles: changed(base.angles, self.angles),
            model_index: changed(base.model_index, self.model_index),
            frame: changed(base.frame, self.frame),
            event: changed(base.event, self.event),
            other_entity: changed(base.other_entity, self.other_entity),
        }
    }
}

impl EntityDelta {
    pub fn removal(number: u16) -> Self {
        Self {
            number,
            removed: true,
            ..Default::default()
        }
    }

    pub fn is_unchanged(&self) -> bool {
        !self.removed && *self == EntityDelta { number: self.number, ..Default::default() }
    }

    /// Applies the changed fields on top of `base`
    pub fn apply(&self, base: &EntityState) -> EntityState {
        EntityState {
            number: self.number,
            entity_type: self.entity_type.unwrap_or(base.entity_type),
            flags: self.flags.unwrap_or(base.flags),
            origin: self.origin.unwrap_or(base.origin),
            angles: self.angles.unwrap_or(base.angles),
            model_index: self.model_index.unwrap_or(base.model_index),
            frame: self.frame.unwrap_or(base.frame),
            event: self.event.unwrap_or(base.event),
            other_entity: self.other_entity.unwrap_or(base.other_entity),
        }
    }
}

/// State of the player the snapshot is built for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub command_time: i32,
    pub client_num: i32,
    pub pm_type: i32,
    pub origin: [i32; 3],
    pub velocity: [i32; 3],
    pub view_angles: [i32; 3],
    pub ping: i32,
    pub stats: Vec<i32>,
}

/// Full description of the level sent when a client is primed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gamestate {
    /// Reliable command sequence at the time the gamestate was built
    pub command_sequence: i32,
    pub configstrings: Vec<(u16, String)>,
    pub baselines: Vec<EntityState>,
    pub client_num: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub server_time: i32,
    /// Distance back to the frame this one is delta encoded against; 0 for a full snapshot
    pub delta_num: u8,
    pub snap_flags: i32,
    pub player_state: PlayerState,
    pub entities: Vec<EntityDelta>,
}

/// In-band download traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadMessage {
    /// A chunk of the file; block 0 carries the total size, negative on error
    /// with the error text as data; an empty chunk marks the end of file
    Block {
        block: u16,
        total_size: Option<i32>,
        data: Vec<u8>,
    },
    /// Fetch the file over HTTP instead
    Redirect {
        url: String,
        size: i32,
        base_len: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerOp {
    ServerCommand(ReliableCommand),
    Gamestate(Gamestate),
    Snapshot(SnapshotMessage),
    Download(DownloadMessage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Last reliable client command the server received
    pub reliable_acknowledge: i32,
    pub ops: Vec<ServerOp>,
}

fn encode_bounded<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serialize(message)?;
    if bytes.len() > MAX_MSGLEN {
        return Err(ProtocolError::Oversize(bytes.len()));
    }
    Ok(bytes)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_bounded(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(deserialize(bytes)?)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_bounded(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(number: u16) -> EntityState {
        EntityState {
            number,
            entity_type: 1,
            origin: [10, 20, 30],
            model_index: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_delta_carries_only_changed_fields() {
        let base = entity(7);
        let mut moved = base;
        moved.origin = [11, 20, 30];

        let delta = moved.delta_from(&base);
        assert_eq!(delta.origin, Some([11, 20, 30]));
        assert_eq!(delta.model_index, None);
        assert_eq!(delta.apply(&base), moved);
        assert!(base.delta_from(&base).is_unchanged());
    }

    #[test]
    fn test_removal_delta() {
        let delta = EntityDelta::removal(9);
        assert!(delta.removed);
        assert!(!delta.is_unchanged());
    }

    #[test]
    fn test_truncated_message_is_rejected() {
        let message = ClientMessage {
            server_id: 3,
            message_acknowledge: 10,
            reliable_acknowledge: 2,
            commands: vec![ReliableCommand {
                sequence: 1,
                text: "userinfo \"\\name\\x\"".to_string(),
            }],
            moves: None,
        };
        let bytes = message.encode().unwrap();
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), message);
        assert!(ClientMessage::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_oversize_message_is_refused() {
        let message = ServerMessage {
            reliable_acknowledge: 0,
            ops: vec![ServerOp::Download(DownloadMessage::Block {
                block: 1,
                total_size: None,
                data: vec![0; MAX_MSGLEN + 1],
            })],
        };
        assert!(matches!(message.encode(), Err(ProtocolError::Oversize(_))));
    }
}
