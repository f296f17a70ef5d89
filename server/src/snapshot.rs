//! Snapshot building, delta compression and rate control
//!
//! Every message the server sends to a connected client goes through
//! [`ServerState::send_message_to_client`], which frames it on the channel,
//! records it in the client's frame ring and schedules the next send from
//! the client's rate. Primed and active clients get a snapshot in each
//! message; entities are delta encoded against the last frame the client
//! acknowledged, or against the baselines when there is none.

use crate::client_manager::{ClientNum, ClientState};
use crate::download::write_download;
use crate::state::ServerState;
use log::{debug, warn};
use shared::message::{
    EntityDelta, EntityState, PlayerState, ReliableCommand, ServerMessage, ServerOp,
    SnapshotMessage, SNAPFLAG_NOT_ACTIVE, SNAPFLAG_RATE_DELAYED,
};
use shared::protocol::{PACKET_BACKUP, PACKET_MASK};
use shared::NetAddress;
use std::collections::BTreeMap;

/// Bytes of UDP/IP overhead counted against the rate per packet
pub const HEADER_RATE_BYTES: i32 = 48;

/// What was sent to a client in one message, kept for delta encoding
#[derive(Debug, Clone, Default)]
pub struct ClientFrame {
    pub server_time: i32,
    /// Channel sequence the frame went out with
    pub message_num: i32,
    pub message_sent: i32,
    /// Time of the first acknowledgement; -1 until acknowledged
    pub message_acked: i32,
    pub message_size: usize,
    /// Sorted by entity number
    pub entities: Vec<EntityState>,
    pub player_state: PlayerState,
    /// Holds a snapshot that can serve as a delta base
    pub valid: bool,
}

/// Entity deltas that turn `old` into `new`
///
/// Both lists must be sorted by number. Entities only in `new` are encoded
/// against their baseline and always sent; entities in both are sent only
/// when changed; entities only in `old` are sent as removals.
pub fn delta_entities(
    old: &[EntityState],
    new: &[EntityState],
    baselines: &BTreeMap<u16, EntityState>,
) -> Vec<EntityDelta> {
    let from_baseline = |entity: &EntityState| {
        let base = baselines.get(&entity.number).copied().unwrap_or_default();
        entity.delta_from(&base)
    };

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    loop {
        match (old.get(i), new.get(j)) {
            (None, None) => break,
            (Some(o), Some(n)) if o.number == n.number => {
                let delta = n.delta_from(o);
                if !delta.is_unchanged() {
                    out.push(delta);
                }
                i += 1;
                j += 1;
            }
            (Some(o), Some(n)) if n.number < o.number => {
                out.push(from_baseline(n));
                j += 1;
            }
            (None, Some(n)) => {
                out.push(from_baseline(n));
                j += 1;
            }
            (Some(o), _) => {
                out.push(EntityDelta::removal(o.number));
                i += 1;
            }
        }
    }
    out
}

fn frame_slot(sequence: i32) -> usize {
    sequence as usize & PACKET_MASK
}

impl ServerState {
    /// Records what the client will see in the message about to be sent
    fn build_client_frame(&mut self, num: ClientNum) {
        let level_time = self.level_time;
        let mut entities: Vec<EntityState> = self
            .world
            .entities
            .iter()
            .filter(|e| usize::from(e.number) != num.0)
            .copied()
            .collect();
        entities.sort_by_key(|e| e.number);
        let mut player_state = self
            .world
            .player_states
            .get(num.0)
            .cloned()
            .unwrap_or_default();
        player_state.client_num = num.0 as i32;

        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        player_state.ping = client.ping;
        let sequence = client.netchan.outgoing_sequence;
        client.frames[frame_slot(sequence)] = ClientFrame {
            server_time: level_time,
            message_num: sequence,
            message_sent: 0,
            message_acked: -1,
            message_size: 0,
            entities,
            player_state,
            valid: true,
        };
    }

    /// Snapshot for the frame just built, delta encoded when possible
    fn write_snapshot(&self, num: ClientNum) -> Option<SnapshotMessage> {
        let client = self.clients.get(num)?;
        let sequence = client.netchan.outgoing_sequence;
        let frame = &client.frames[frame_slot(sequence)];

        let old = if client.delta_message <= 0 || client.state != ClientState::Active {
            None
        } else if sequence.wrapping_sub(client.delta_message) >= (PACKET_BACKUP - 3) as i32 {
            debug!("{}: Delta request from out of date packet.", client.name);
            None
        } else {
            let old = &client.frames[frame_slot(client.delta_message)];
            if old.valid && old.message_num == client.delta_message {
                Some(old)
            } else {
                debug!("{}: Delta request from invalid frame.", client.name);
                None
            }
        };

        let delta_num = old.map_or(0, |_| sequence.wrapping_sub(client.delta_message) as u8);
        let entities = delta_entities(
            old.map_or(&[][..], |o| o.entities.as_slice()),
            &frame.entities,
            &self.baselines,
        );

        let mut snap_flags = self.snap_flag_server_bit;
        if client.rate_delayed {
            snap_flags |= SNAPFLAG_RATE_DELAYED;
        }
        if client.state != ClientState::Active {
            snap_flags |= SNAPFLAG_NOT_ACTIVE;
        }

        Some(SnapshotMessage {
            server_time: frame.server_time,
            delta_num,
            snap_flags,
            player_state: frame.player_state.clone(),
            entities,
        })
    }

    /// Unacknowledged reliable commands, oldest first
    pub(crate) fn pending_server_commands(&self, num: ClientNum) -> Vec<ServerOp> {
        self.clients.get(num).map_or_else(Vec::new, |client| {
            client
                .reliable
                .unacknowledged()
                .map(|(sequence, text)| {
                    ServerOp::ServerCommand(ReliableCommand {
                        sequence,
                        text: text.to_string(),
                    })
                })
                .collect()
        })
    }

    /// Frames `ops` on the client's channel and schedules the next send
    pub(crate) fn send_message_to_client(&mut self, num: ClientNum, ops: Vec<ServerOp>, now: i32) {
        let frame_msec = self.config.frame_msec();
        let lan_force_rate = self.config.lan_force_rate;
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };

        let message = ServerMessage {
            reliable_acknowledge: client.last_client_command,
            ops,
        };
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Message to {} dropped: {}", client.name, e);
                return;
            }
        };

        let sequence = client.netchan.outgoing_sequence;
        let frame = &mut client.frames[frame_slot(sequence)];
        if frame.message_num != sequence || !frame.valid {
            // no snapshot in this message
            *frame = ClientFrame {
                message_num: sequence,
                ..Default::default()
            };
        }
        frame.message_size = payload.len();
        frame.message_sent = now;
        frame.message_acked = -1;

        let packet = client.netchan.transmit(&payload);
        let to = client.address();

        if to == NetAddress::Loopback || (lan_force_rate && to.is_lan()) {
            client.next_snapshot_time = now + frame_msec;
        } else {
            let rate = client.rate.max(1000);
            let mut rate_msec = (payload.len() as i32 + HEADER_RATE_BYTES) * 1000 / rate;
            if rate_msec < client.snapshot_msec {
                rate_msec = client.snapshot_msec;
                client.rate_delayed = false;
            } else {
                client.rate_delayed = true;
            }
            client.next_snapshot_time = now + rate_msec;

            // don't pile up empty snapshots while connecting
            if client.state != ClientState::Active
                && !client.download.is_active()
                && client.next_snapshot_time < now + 1000
            {
                client.next_snapshot_time = now + 1000;
            }
        }

        self.send_packet(to, packet);
    }

    /// Builds and sends the regular per-frame message for one client
    pub(crate) fn send_client_snapshot(&mut self, num: ClientNum, now: i32) {
        let state = match self.clients.get(num) {
            Some(client) if !client.is_bot => client.state,
            _ => return,
        };

        let mut ops = self.pending_server_commands(num);
        // a zombie gets one last snapshot so its client runs the disconnect
        if state >= ClientState::Primed || state == ClientState::Zombie {
            self.build_client_frame(num);
            if let Some(snapshot) = self.write_snapshot(num) {
                ops.push(ServerOp::Snapshot(snapshot));
            }
        }

        if let Some(client) = self.clients.get_mut(num) {
            let downloads = write_download(client, &self.config, self.paks.as_ref(), now);
            ops.extend(downloads.into_iter().map(ServerOp::Download));
        }

        self.send_message_to_client(num, ops, now);
    }

    /// Sends to every connected client whose next snapshot is due
    pub(crate) fn send_client_messages(&mut self, now: i32) {
        for num in self.clients.nums_at_least(ClientState::Connected) {
            let due = self
                .clients
                .get(num)
                .map_or(false, |c| !c.is_bot && now >= c.next_snapshot_time);
            if due {
                self.send_client_snapshot(num, now);
            }
        }
    }

    /// Records the acknowledgement of a frame and updates the ping estimate
    pub(crate) fn acknowledge_frame(&mut self, num: ClientNum, acknowledge: i32, now: i32) {
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        let frame = &mut client.frames[frame_slot(acknowledge)];
        if frame.message_num != acknowledge || frame.message_acked != -1 {
            return;
        }
        frame.message_acked = now;
        client.ping = (now - frame.message_sent).max(0);
    }

    /// Entity states at the end of level load become the baselines
    pub(crate) fn create_baselines(&mut self) {
        self.baselines = self
            .world
            .entities
            .iter()
            .map(|e| (e.number, *e))
            .collect();
    }
}
