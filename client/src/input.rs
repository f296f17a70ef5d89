//! Usercmd generation and outgoing packet assembly
//!
//! Each client frame samples the player's input into a [`UserCmd`] stamped
//! with the current server time. Packets carry the commands created since
//! the last packet plus a few older ones so a lost packet costs nothing.

use crate::state::{ClientState, ConnState};
use log::{debug, trace};
use shared::message::{ClientMessage, MoveSet, ReliableCommand, UserCmd};
use shared::protocol::PACKET_BACKUP;
use std::collections::VecDeque;

/// Usercmds kept for duplication into later packets
pub const CMD_BACKUP: usize = 64;
/// Most usercmds a single packet may carry
pub const MAX_PACKET_USERCMDS: usize = 32;

/// Player input sampled by the front end for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputState {
    pub buttons: u32,
    pub angles: [i32; 3],
    pub forward_move: i8,
    pub right_move: i8,
    pub up_move: i8,
}

/// Most recent usercmds, numbered from 1
#[derive(Debug, Clone, Default)]
pub struct CommandRing {
    cmds: VecDeque<UserCmd>,
    cmd_number: i32,
}

impl CommandRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of the newest command
    pub fn cmd_number(&self) -> i32 {
        self.cmd_number
    }

    pub fn push(&mut self, cmd: UserCmd) -> i32 {
        if self.cmds.len() == CMD_BACKUP {
            self.cmds.pop_front();
        }
        self.cmds.push_back(cmd);
        self.cmd_number = self.cmd_number.wrapping_add(1);
        self.cmd_number
    }

    pub fn clear(&mut self) {
        self.cmds.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn latest(&self) -> Option<&UserCmd> {
        self.cmds.back()
    }

    /// Commands numbered after `after`, oldest first, at most `limit`
    pub fn since(&self, after: i32, limit: usize) -> Vec<UserCmd> {
        let count = self.cmd_number.wrapping_sub(after).clamp(0, self.cmds.len() as i32) as usize;
        let count = count.min(limit);
        self.cmds.iter().skip(self.cmds.len() - count).copied().collect()
    }
}

impl ClientState {
    /// Turns this frame's input into a usercmd once the level is loaded
    pub(crate) fn create_new_commands(&mut self) {
        if self.state < ConnState::Primed {
            return;
        }
        let input = self.input;
        let cmd = UserCmd {
            server_time: self.clock.server_time,
            buttons: input.buttons,
            angles: input.angles,
            forward_move: input.forward_move,
            right_move: input.right_move,
            up_move: input.up_move,
        };
        self.cmds.push(cmd);
    }

    /// Whether this frame should send a packet
    pub(crate) fn ready_to_send_packet(&self) -> bool {
        if self.demo.is_playing() {
            return false;
        }
        let Some(netchan) = &self.netchan else {
            return false;
        };
        let since_last = self.realtime.wrapping_sub(self.last_packet_sent_time);

        // before the level loads only send the occasional keepalive
        if self.state == ConnState::Connected || self.state == ConnState::Downloading {
            let interval = if self.download.is_active() { 50 } else { 1000 };
            return since_last >= interval;
        }
        if self.state < ConnState::Connected {
            return false;
        }

        if netchan.remote.is_local() || netchan.remote.is_lan() {
            return true;
        }

        let max_packets = self.config.max_packets.clamp(15, 125);
        let old = &self.out_packets[netchan.outgoing_sequence.wrapping_sub(1) as u32 as usize % PACKET_BACKUP];
        since_last.min(self.realtime.wrapping_sub(old.realtime)) >= 1000 / max_packets
    }

    /// Builds and sends a packet with acknowledgements, unacknowledged
    /// reliable commands and the usercmds not yet sent
    pub(crate) fn write_packet(&mut self) {
        if self.demo.is_playing() {
            return;
        }
        let Some(netchan) = self.netchan.as_ref() else {
            return;
        };
        let outgoing_sequence = netchan.outgoing_sequence;
        let message_acknowledge = netchan.incoming_sequence;

        let commands = self
            .reliable
            .unacknowledged()
            .map(|(sequence, text)| ReliableCommand {
                sequence,
                text: text.to_string(),
            })
            .collect();

        let moves = if self.state >= ConnState::Primed && !self.cmds.is_empty() {
            // repeat commands from earlier packets to cover for loss
            let dup = self.config.packet_dup.min(5);
            let old_packet = outgoing_sequence.wrapping_sub(1).wrapping_sub(dup as i32);
            let old_cmd_number = self.out_packets[old_packet as u32 as usize % PACKET_BACKUP].cmd_number;
            let cmds = self.cmds.since(old_cmd_number, MAX_PACKET_USERCMDS);

            // delta only against a snapshot that was in the message we acknowledge
            let delta = self.snap.valid
                && self.snap.message_num == message_acknowledge
                && !self.demo.is_waiting();
            Some(MoveSet { delta, cmds })
        } else {
            None
        };

        let message = ClientMessage {
            server_id: self.server_id,
            message_acknowledge,
            reliable_acknowledge: self.server_commands.sequence(),
            commands,
            moves,
        };

        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                debug!("write_packet: {}", e);
                return;
            }
        };

        let slot = outgoing_sequence as u32 as usize % PACKET_BACKUP;
        self.out_packets[slot] = crate::snapshots::OutPacket {
            cmd_number: self.cmds.cmd_number(),
            server_time: self.cmds.latest().map_or(0, |c| c.server_time),
            realtime: self.realtime,
        };
        self.last_packet_sent_time = self.realtime;

        if let Some(netchan) = self.netchan.as_mut() {
            let packet = netchan.transmit(&payload);
            let to = netchan.remote;
            trace!("write_packet: {} bytes, sequence {}", packet.len(), outgoing_sequence);
            self.send_packet(to, packet);
        }
    }
}
